//! Supervisor event loop
//!
//! One thread drives everything: drain the event sources, dedup, resolve
//! namespaces, dispatch to handlers inline, rescan the plugin directory on a
//! timer or a filesystem hint, and unwind cleanly on shutdown.

use crate::corr::{CorrMap, CORR_THRESHOLD};
use crate::dedup::{event_key, LastEventMap, DEDUP_WINDOW};
use crate::event::TuningEvent;
use crate::host::{PluginWatcher, Shared, TunerHost};
use crate::netns::NamespaceTracker;
use crate::observability::{DaemonMetrics, StructuredLogger};
use crate::registry::TunableRegistry;
use crate::ring::{EventSource, RingHealth};
use crate::sysctl::SysctlIo;
use crate::tuner::TunerFactory;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Default plugin artifact directory
pub const DEFAULT_PLUGIN_DIR: &str = "/usr/local/lib64/bpftune";

/// Configuration for the supervisor loop
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory scanned for tuner artifacts
    pub plugin_dir: PathBuf,
    /// Plugin directory rescan interval (default: 5 seconds)
    pub rescan_interval: Duration,
    /// Ring drain cadence (default: 100 ms)
    pub poll_interval: Duration,
    /// Per-(tuner, event, namespace) dedup window (default: 25 ms)
    pub dedup_window: Duration,
    /// Correlation above which increases are suppressed (default: 0.5)
    pub corr_threshold: f64,
    /// Whether per-namespace writes are performed
    pub netns_enabled: bool,
    /// Root of the sysctl filesystem
    pub sysctl_root: PathBuf,
    /// How long to keep draining decoded events after a shutdown signal
    pub shutdown_drain: Duration,
    /// Per-tuner fini budget during shutdown
    pub fini_budget: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            rescan_interval: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(100),
            dedup_window: DEDUP_WINDOW,
            corr_threshold: CORR_THRESHOLD,
            netns_enabled: true,
            sysctl_root: PathBuf::from("/proc/sys"),
            shutdown_drain: Duration::from_millis(500),
            fini_budget: Duration::from_secs(2),
        }
    }
}

/// How the supervisor loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Graceful shutdown; tuners finalized and rolled back
    Clean,
    /// Repeated hard ring failures
    RingUnhealthy,
    /// A tuner handler panicked
    FatalPlugin,
}

impl ExitStatus {
    /// Process exit code for this outcome
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::RingUnhealthy => 2,
            ExitStatus::FatalPlugin => 3,
        }
    }
}

/// The daemon core: host, shared state, and the consumer loop
pub struct Supervisor {
    cfg: SupervisorConfig,
    host: TunerHost,
    shared: Shared,
    dedup: LastEventMap,
    ring_health: RingHealth,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig, factories: HashMap<String, TunerFactory>) -> Self {
        let sysctl = SysctlIo::with_root(&cfg.sysctl_root);
        let shared = Shared {
            registry: TunableRegistry::new(sysctl, cfg.netns_enabled),
            corr: CorrMap::new(),
            namespaces: NamespaceTracker::default(),
            sources: Vec::new(),
            logger: StructuredLogger::new(),
            metrics: DaemonMetrics::new(),
            corr_threshold: cfg.corr_threshold,
        };
        let host = TunerHost::new(cfg.plugin_dir.clone(), factories);
        let dedup = LastEventMap::new(cfg.dedup_window);
        Self {
            cfg,
            host,
            shared,
            dedup,
            ring_health: RingHealth::new(),
        }
    }

    /// Handle to the shared correlation map
    pub fn corr_map(&self) -> CorrMap {
        self.shared.corr.clone()
    }

    /// Attach an additional event source ahead of the run loop
    pub fn add_event_source(&mut self, source: Box<dyn EventSource>) {
        self.shared.sources.push(source);
    }

    /// Run until shutdown is signalled or the pipeline turns fatal
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> ExitStatus {
        info!(plugin_dir = %self.cfg.plugin_dir.display(), "supervisor starting");
        self.host.scan(&mut self.shared);

        let mut watcher_rx = match PluginWatcher::start(&self.cfg.plugin_dir) {
            Ok((watcher, rx)) => Some((watcher, rx)),
            Err(e) => {
                warn!(error = %e, "plugin directory watch unavailable; relying on rescan timer");
                None
            }
        };

        let mut poll = interval(self.cfg.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rescan = interval(self.cfg.rescan_interval);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let rescan_hint = async {
                match watcher_rx.as_mut() {
                    Some((_, rx)) => {
                        rx.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = poll.tick() => {
                    if let Err(status) = self.drain_cycle() {
                        return status;
                    }
                }
                _ = rescan.tick() => {
                    self.host.scan(&mut self.shared);
                    self.shared.namespaces.sweep(Instant::now());
                    self.shared
                        .metrics
                        .set_namespaces_live(self.shared.namespaces.live_count() as i64);
                }
                _ = rescan_hint => {
                    self.host.scan(&mut self.shared);
                }
                _ = shutdown.recv() => {
                    info!("shutdown signalled");
                    break;
                }
            }
        }

        // Stop accepting new events; give already-emitted ones a short drain.
        let deadline = Instant::now() + self.cfg.shutdown_drain;
        while Instant::now() < deadline {
            match self.drain_cycle() {
                Ok(0) => break,
                Ok(_) => {}
                Err(status) => return status,
            }
        }

        self.host.shutdown(&mut self.shared, self.cfg.fini_budget);
        info!("supervisor stopped");
        ExitStatus::Clean
    }

    /// Drain every source once and dispatch what came out
    fn drain_cycle(&mut self) -> Result<usize, ExitStatus> {
        let mut events = Vec::new();
        let mut failed = false;
        for source in &mut self.shared.sources {
            if let Err(e) = source.drain(&mut events) {
                warn!(source = source.label(), error = %e, "ring read failed");
                self.shared.metrics.inc_ring_errors();
                failed = true;
            }
        }
        if failed {
            if self.ring_health.record_failure(Instant::now()) {
                error!("event ring unhealthy; shutting down");
                return Err(ExitStatus::RingUnhealthy);
            }
        } else {
            self.ring_health.record_ok();
        }

        let drained = events.len();
        for event in events {
            self.process(&event)?;
        }
        Ok(drained)
    }

    fn process(&mut self, event: &TuningEvent) -> Result<(), ExitStatus> {
        let now = Instant::now();

        let key = event_key(event.netns_cookie, event.tuner_id, event.event_id);
        if !self.dedup.observe(key, now) {
            self.shared.metrics.inc_events_deduped();
            return Ok(());
        }

        if !self
            .shared
            .namespaces
            .filter(event.netns_cookie, event.tuner_id, now)
        {
            self.shared.metrics.inc_events_dropped();
            return Ok(());
        }

        // No isolation boundary around handlers: a panicking plugin is a
        // fatal bug and takes the daemon down with exit code 3.
        let host = &mut self.host;
        let shared = &mut self.shared;
        match catch_unwind(AssertUnwindSafe(|| host.dispatch(shared, event))) {
            Ok(()) => Ok(()),
            Err(_) => {
                error!(tuner_id = event.tuner_id, "tuner handler panicked");
                Err(ExitStatus::FatalPlugin)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_match_contract() {
        assert_eq!(ExitStatus::Clean.code(), 0);
        assert_eq!(ExitStatus::RingUnhealthy.code(), 2);
        assert_eq!(ExitStatus::FatalPlugin.code(), 3);
    }

    #[test]
    fn test_default_config_constants() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.rescan_interval, Duration::from_millis(5000));
        assert_eq!(cfg.dedup_window, Duration::from_millis(25));
        assert_eq!(cfg.corr_threshold, 0.5);
        assert!(cfg.netns_enabled);
        assert_eq!(cfg.plugin_dir, PathBuf::from(DEFAULT_PLUGIN_DIR));
    }
}
