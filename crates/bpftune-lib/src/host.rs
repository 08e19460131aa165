//! Tuner host: plugin discovery, roster, lifecycle, dispatch
//!
//! Scans a plugin directory for tuner artifacts, resolves each against the
//! factory table, runs init/fini at the right lifecycle points, and routes
//! ring events to the owning tuner's handler. The roster and all shared state
//! are mutated only by the supervisor thread.

use crate::corr::CorrMap;
use crate::event::TuningEvent;
use crate::models::TunerState;
use crate::netns::NamespaceTracker;
use crate::observability::{DaemonMetrics, StructuredLogger};
use crate::registry::TunableRegistry;
use crate::ring::EventSource;
use crate::tuner::{Tuner, TunerCtx, TunerFactory, Tuning};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Minimum gap between repeated unknown-tuner-id warnings per id
const UNKNOWN_ID_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// State shared between the host, the supervisor, and tuner handlers
pub struct Shared {
    pub registry: TunableRegistry,
    pub corr: CorrMap,
    pub namespaces: NamespaceTracker,
    pub sources: Vec<Box<dyn EventSource>>,
    pub logger: StructuredLogger,
    pub metrics: DaemonMetrics,
    pub corr_threshold: f64,
}

struct TunerSlot {
    tuner: Tuner,
    tuning: Box<dyn Tuning>,
}

/// Roster of live tuners and the plugin directory they came from
pub struct TunerHost {
    plugin_dir: PathBuf,
    factories: HashMap<String, TunerFactory>,
    slots: Vec<TunerSlot>,
    next_tuner_id: u32,
    /// Ids whose artifact disappeared; events for them drop silently
    retired: HashSet<u32>,
    /// Artifacts whose init failed, keyed to the mtime observed at failure
    failed: HashMap<PathBuf, Option<SystemTime>>,
    unknown_warned: HashMap<u32, Instant>,
}

impl TunerHost {
    pub fn new(plugin_dir: impl Into<PathBuf>, factories: HashMap<String, TunerFactory>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            factories,
            slots: Vec::new(),
            next_tuner_id: 0,
            retired: HashSet::new(),
            failed: HashMap::new(),
            unknown_warned: HashMap::new(),
        }
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Number of tuners currently accepting events
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.tuner.state.accepts_events())
            .count()
    }

    /// Snapshot of the roster for health reporting and tests
    pub fn roster(&self) -> Vec<(u32, String, TunerState)> {
        self.slots
            .iter()
            .map(|s| (s.tuner.id, s.tuner.name.clone(), s.tuner.state))
            .collect()
    }

    /// Reconcile the roster against the plugin directory
    ///
    /// New artifacts are loaded and initialized; artifacts that disappeared
    /// have their tuners finalized and rolled back. A previously failed
    /// artifact is retried only once its mtime changes.
    pub fn scan(&mut self, shared: &mut Shared) {
        let present = self.list_artifacts();
        let present_paths: HashSet<PathBuf> = present.iter().map(|(p, _)| p.clone()).collect();

        // Retire tuners whose artifact disappeared.
        let mut idx = 0;
        while idx < self.slots.len() {
            if present_paths.contains(&self.slots[idx].tuner.artifact) {
                idx += 1;
            } else {
                let slot = self.slots.remove(idx);
                self.finish(slot, shared);
            }
        }
        self.failed.retain(|path, _| present_paths.contains(path));

        // Load artifacts not yet on the roster.
        for (path, mtime) in present {
            if self.slots.iter().any(|s| s.tuner.artifact == path) {
                continue;
            }
            if let Some(failed_mtime) = self.failed.get(&path) {
                if *failed_mtime == mtime {
                    continue;
                }
                self.failed.remove(&path);
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let Some(factory) = self.factories.get(&name).cloned() else {
                debug!(artifact = %path.display(), "no tuner registered for artifact");
                continue;
            };
            self.load_tuner(shared, name, path, mtime, factory);
        }

        shared.metrics.set_tuners_live(self.live_count() as i64);
    }

    fn list_artifacts(&self) -> Vec<(PathBuf, Option<SystemTime>)> {
        let entries = match std::fs::read_dir(&self.plugin_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.plugin_dir.display(), error = %e, "plugin directory not readable");
                return Vec::new();
            }
        };
        entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|e| e.path().extension().map(|x| x == "so").unwrap_or(false))
            .map(|e| {
                let mtime = e.metadata().ok().and_then(|m| m.modified().ok());
                (e.path(), mtime)
            })
            .collect()
    }

    fn load_tuner(
        &mut self,
        shared: &mut Shared,
        name: String,
        path: PathBuf,
        mtime: Option<SystemTime>,
        factory: TunerFactory,
    ) {
        let id = self.next_tuner_id;
        self.next_tuner_id += 1;

        let mut tuner = Tuner::new(id, name, path.clone());
        let mut tuning = factory();
        let result = {
            let mut ctx = TunerCtx {
                tuner: &mut tuner,
                registry: &mut shared.registry,
                corr: &shared.corr,
                namespaces: &mut shared.namespaces,
                sources: &mut shared.sources,
                logger: &shared.logger,
                corr_threshold: shared.corr_threshold,
            };
            tuning.init(&mut ctx)
        };

        match result {
            Ok(()) => {
                tuner.state = TunerState::Attached;
                shared.logger.log_tuner_added(&tuner.name, id);
                self.slots.push(TunerSlot { tuner, tuning });
            }
            Err(e) => {
                shared.logger.log_tuner_failed(&tuner.name, &e.to_string());
                shared.registry.unregister(id);
                self.failed.insert(path, mtime);
                self.retired.insert(id);
            }
        }
    }

    /// Route one event to the owning tuner
    ///
    /// Events for retired ids are discarded silently; events for ids never
    /// seen are dropped with a rate-limited warning.
    pub fn dispatch(&mut self, shared: &mut Shared, event: &TuningEvent) {
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.tuner.id == event.tuner_id)
        else {
            shared.metrics.inc_events_dropped();
            if !self.retired.contains(&event.tuner_id) {
                let now = Instant::now();
                let warn_due = self
                    .unknown_warned
                    .get(&event.tuner_id)
                    .map(|last| now.duration_since(*last) >= UNKNOWN_ID_WARN_INTERVAL)
                    .unwrap_or(true);
                if warn_due {
                    warn!(tuner_id = event.tuner_id, "event for unknown tuner id");
                    self.unknown_warned.insert(event.tuner_id, now);
                }
            }
            return;
        };

        if !slot.tuner.state.accepts_events() {
            shared.metrics.inc_events_dropped();
            return;
        }

        let started = Instant::now();
        let mut ctx = TunerCtx {
            tuner: &mut slot.tuner,
            registry: &mut shared.registry,
            corr: &shared.corr,
            namespaces: &mut shared.namespaces,
            sources: &mut shared.sources,
            logger: &shared.logger,
            corr_threshold: shared.corr_threshold,
        };
        slot.tuning.event_handler(&mut ctx, event);
        shared.metrics.inc_events_dispatched();
        shared
            .metrics
            .observe_handler_latency(started.elapsed().as_secs_f64());
    }

    /// Finalize every live tuner in reverse load order
    pub fn shutdown(&mut self, shared: &mut Shared, fini_budget: Duration) {
        while let Some(slot) = self.slots.pop() {
            self.finish_with_budget(slot, shared, Some(fini_budget));
        }
        shared.metrics.set_tuners_live(0);
    }

    fn finish(&mut self, slot: TunerSlot, shared: &mut Shared) {
        self.finish_with_budget(slot, shared, None);
    }

    fn finish_with_budget(
        &mut self,
        mut slot: TunerSlot,
        shared: &mut Shared,
        budget: Option<Duration>,
    ) {
        let started = Instant::now();
        {
            let mut ctx = TunerCtx {
                tuner: &mut slot.tuner,
                registry: &mut shared.registry,
                corr: &shared.corr,
                namespaces: &mut shared.namespaces,
                sources: &mut shared.sources,
                logger: &shared.logger,
                corr_threshold: shared.corr_threshold,
            };
            slot.tuning.fini(&mut ctx);
        }
        if let Some(budget) = budget {
            let elapsed = started.elapsed();
            if elapsed > budget {
                warn!(
                    tuner = %slot.tuner.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "fini overran its budget; rollback may be incomplete"
                );
            }
        }
        shared.registry.rollback(slot.tuner.id);
        shared.registry.unregister(slot.tuner.id);
        slot.tuner.state = TunerState::Gone;
        self.retired.insert(slot.tuner.id);
        shared.logger.log_tuner_fini(&slot.tuner.name);
    }
}

/// Filesystem watch on the plugin directory
///
/// Create/remove/modify activity nudges the supervisor into an immediate
/// rescan; the periodic rescan timer remains the backstop.
pub struct PluginWatcher {
    _watcher: RecommendedWatcher,
}

impl PluginWatcher {
    pub fn start(dir: &Path) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<()>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_)
                    ) {
                        let _ = tx.send(());
                    }
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok((Self { _watcher: watcher }, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysctl::SysctlIo;
    use crate::tuner::TunerFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct CountingTuner {
        events: Arc<AtomicUsize>,
        finis: Arc<AtomicUsize>,
        fail_init: bool,
    }

    impl Tuning for CountingTuner {
        fn init(&mut self, _ctx: &mut TunerCtx<'_>) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("probe load failed");
            }
            Ok(())
        }

        fn fini(&mut self, _ctx: &mut TunerCtx<'_>) {
            self.finis.fetch_add(1, Ordering::SeqCst);
        }

        fn event_handler(&mut self, _ctx: &mut TunerCtx<'_>, _event: &TuningEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_factory(
        events: Arc<AtomicUsize>,
        finis: Arc<AtomicUsize>,
        fail_init: bool,
    ) -> TunerFactory {
        Arc::new(move || {
            Box::new(CountingTuner {
                events: events.clone(),
                finis: finis.clone(),
                fail_init,
            })
        })
    }

    fn scratch_shared() -> (TempDir, Shared) {
        let dir = TempDir::new().unwrap();
        let shared = Shared {
            registry: TunableRegistry::new(SysctlIo::with_root(dir.path()), true),
            corr: CorrMap::new(),
            namespaces: NamespaceTracker::default(),
            sources: Vec::new(),
            logger: StructuredLogger::new(),
            metrics: DaemonMetrics::new(),
            corr_threshold: 0.5,
        };
        (dir, shared)
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"artifact").unwrap();
        path
    }

    #[test]
    fn test_artifact_appearance_loads_tuner() {
        let plugin_dir = TempDir::new().unwrap();
        let (_sysctl_dir, mut shared) = scratch_shared();
        let events = Arc::new(AtomicUsize::new(0));
        let finis = Arc::new(AtomicUsize::new(0));

        let mut factories = HashMap::new();
        factories.insert(
            "sample_tuner".to_string(),
            counting_factory(events.clone(), finis.clone(), false),
        );
        let mut host = TunerHost::new(plugin_dir.path(), factories);

        host.scan(&mut shared);
        assert_eq!(host.live_count(), 0);

        touch(plugin_dir.path(), "sample_tuner.so");
        host.scan(&mut shared);
        assert_eq!(host.live_count(), 1);
        let roster = host.roster();
        assert_eq!(roster[0].1, "sample_tuner");
        assert_eq!(roster[0].2, TunerState::Attached);
    }

    #[test]
    fn test_events_route_to_owner_and_stop_after_removal() {
        let plugin_dir = TempDir::new().unwrap();
        let (_sysctl_dir, mut shared) = scratch_shared();
        let events = Arc::new(AtomicUsize::new(0));
        let finis = Arc::new(AtomicUsize::new(0));

        let mut factories = HashMap::new();
        factories.insert(
            "sample_tuner".to_string(),
            counting_factory(events.clone(), finis.clone(), false),
        );
        let mut host = TunerHost::new(plugin_dir.path(), factories);

        let artifact = touch(plugin_dir.path(), "sample_tuner.so");
        host.scan(&mut shared);
        let tuner_id = host.roster()[0].0;

        let event = TuningEvent {
            tuner_id,
            ..Default::default()
        };
        host.dispatch(&mut shared, &event);
        assert_eq!(events.load(Ordering::SeqCst), 1);

        // Artifact disappears: fini runs, backlogged events are discarded.
        std::fs::remove_file(&artifact).unwrap();
        host.scan(&mut shared);
        assert_eq!(finis.load(Ordering::SeqCst), 1);
        assert_eq!(host.live_count(), 0);

        host.dispatch(&mut shared, &event);
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tuner_ids_are_never_reused() {
        let plugin_dir = TempDir::new().unwrap();
        let (_sysctl_dir, mut shared) = scratch_shared();
        let events = Arc::new(AtomicUsize::new(0));
        let finis = Arc::new(AtomicUsize::new(0));

        let mut factories = HashMap::new();
        factories.insert(
            "sample_tuner".to_string(),
            counting_factory(events.clone(), finis.clone(), false),
        );
        let mut host = TunerHost::new(plugin_dir.path(), factories);

        let artifact = touch(plugin_dir.path(), "sample_tuner.so");
        host.scan(&mut shared);
        let first_id = host.roster()[0].0;

        std::fs::remove_file(&artifact).unwrap();
        host.scan(&mut shared);

        touch(plugin_dir.path(), "sample_tuner.so");
        host.scan(&mut shared);
        let second_id = host.roster()[0].0;
        assert_ne!(first_id, second_id);
    }

    #[test]
    fn test_failed_init_not_retried_until_mtime_changes() {
        let plugin_dir = TempDir::new().unwrap();
        let (_sysctl_dir, mut shared) = scratch_shared();
        let events = Arc::new(AtomicUsize::new(0));
        let finis = Arc::new(AtomicUsize::new(0));

        let mut factories = HashMap::new();
        factories.insert(
            "broken_tuner".to_string(),
            counting_factory(events.clone(), finis.clone(), true),
        );
        let mut host = TunerHost::new(plugin_dir.path(), factories);

        let artifact = touch(plugin_dir.path(), "broken_tuner.so");
        host.scan(&mut shared);
        assert_eq!(host.live_count(), 0);
        let failed_id = host.next_tuner_id;

        // Same mtime: no retry, no fresh id burned.
        host.scan(&mut shared);
        assert_eq!(host.next_tuner_id, failed_id);

        // Touch the artifact with a distinct mtime: retried (and fails again).
        let later = SystemTime::now() + Duration::from_secs(10);
        let file = std::fs::File::options().write(true).open(&artifact).unwrap();
        file.set_modified(later).unwrap();
        drop(file);
        host.scan(&mut shared);
        assert_eq!(host.next_tuner_id, failed_id + 1);
    }

    #[test]
    fn test_shutdown_finalizes_in_reverse_load_order() {
        let plugin_dir = TempDir::new().unwrap();
        let (_sysctl_dir, mut shared) = scratch_shared();
        let events = Arc::new(AtomicUsize::new(0));
        let finis = Arc::new(AtomicUsize::new(0));

        let mut factories = HashMap::new();
        for name in ["a_tuner", "b_tuner"] {
            factories.insert(
                name.to_string(),
                counting_factory(events.clone(), finis.clone(), false),
            );
        }
        let mut host = TunerHost::new(plugin_dir.path(), factories);
        touch(plugin_dir.path(), "a_tuner.so");
        touch(plugin_dir.path(), "b_tuner.so");
        host.scan(&mut shared);
        assert_eq!(host.live_count(), 2);

        host.shutdown(&mut shared, Duration::from_secs(2));
        assert_eq!(finis.load(Ordering::SeqCst), 2);
        assert_eq!(host.live_count(), 0);
    }
}
