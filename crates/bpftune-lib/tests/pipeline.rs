//! End-to-end pipeline tests through the supervisor loop
//!
//! Inject events over a channel source and observe dedup, dispatch, the
//! correlation gate on the TCP buffer tuner, and the fatal exit paths.

use bpftune_lib::corr::CorrKey;
use bpftune_lib::errors::TuneError;
use bpftune_lib::event::{TunableUpdate, TuningEvent, NETNS_COOKIE_UNSUPPORTED};
use bpftune_lib::ring::{ChannelSource, EventSource};
use bpftune_lib::supervisor::{ExitStatus, Supervisor, SupervisorConfig};
use bpftune_lib::sysctl::SysctlIo;
use bpftune_lib::tuner::{TunerCtx, TunerFactory, Tuning};
use bpftune_lib::tuners::builtin_factories;
use bpftune_lib::tuners::tcp_buffer::{TCP_BUFFER_INCREASE, TCP_BUFFER_TCP_WMEM};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::sleep;

struct RecordingTuner {
    hits: Arc<AtomicUsize>,
    inits: Arc<AtomicUsize>,
    finis: Arc<AtomicUsize>,
    panic_on_event: bool,
}

impl Tuning for RecordingTuner {
    fn init(&mut self, _ctx: &mut TunerCtx<'_>) -> anyhow::Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fini(&mut self, _ctx: &mut TunerCtx<'_>) {
        self.finis.fetch_add(1, Ordering::SeqCst);
    }

    fn event_handler(&mut self, _ctx: &mut TunerCtx<'_>, _event: &TuningEvent) {
        if self.panic_on_event {
            panic!("handler blew up");
        }
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Counters {
    hits: Arc<AtomicUsize>,
    inits: Arc<AtomicUsize>,
    finis: Arc<AtomicUsize>,
}

fn recording_factory(counters: &Counters, panic_on_event: bool) -> TunerFactory {
    let hits = counters.hits.clone();
    let inits = counters.inits.clone();
    let finis = counters.finis.clone();
    Arc::new(move || {
        Box::new(RecordingTuner {
            hits: hits.clone(),
            inits: inits.clone(),
            finis: finis.clone(),
            panic_on_event,
        }) as Box<dyn Tuning>
    })
}

fn fast_config(plugin_dir: &Path, sysctl_root: &Path) -> SupervisorConfig {
    SupervisorConfig {
        plugin_dir: plugin_dir.to_path_buf(),
        sysctl_root: sysctl_root.to_path_buf(),
        rescan_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
        ..SupervisorConfig::default()
    }
}

fn seed_tcp_sysctls(root: &Path) {
    let io = SysctlIo::with_root(root);
    for (name, content) in [
        ("net.ipv4.tcp_wmem", "4096 16384 65536\n"),
        ("net.ipv4.tcp_rmem", "4096 131072 262144\n"),
        ("net.ipv4.tcp_mem", "42189 56254 84378\n"),
        ("net.ipv4.tcp_max_orphans", "8192\n"),
        ("net.core.netdev_max_backlog", "1000\n"),
    ] {
        let path = io.path_for(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

fn plain_event(tuner_id: u32, event_id: u32, netns_cookie: i64) -> TuningEvent {
    TuningEvent {
        tuner_id,
        event_id,
        netns_cookie,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_burst_deduped_then_window_reopens() {
    let plugin_dir = TempDir::new().unwrap();
    let sysctl_dir = TempDir::new().unwrap();
    let counters = Counters::default();

    let mut factories: HashMap<String, TunerFactory> = HashMap::new();
    factories.insert("recording_tuner".to_string(), recording_factory(&counters, false));
    std::fs::write(plugin_dir.path().join("recording_tuner.so"), b"artifact").unwrap();

    let mut supervisor = Supervisor::new(
        fast_config(plugin_dir.path(), sysctl_dir.path()),
        factories,
    );
    let (tx, source) = ChannelSource::channel("test-events");
    supervisor.add_event_source(Box::new(source));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(supervisor.run(shutdown_rx));
    sleep(Duration::from_millis(50)).await;

    // A burst for one (tuner, event, namespace) key collapses to one dispatch.
    for _ in 0..5 {
        tx.send(plain_event(0, 1, 7)).unwrap();
    }
    sleep(Duration::from_millis(50)).await;
    assert_eq!(counters.hits.load(Ordering::SeqCst), 1);

    // Past the 25 ms window the next event goes through.
    tx.send(plain_event(0, 1, 7)).unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(counters.hits.load(Ordering::SeqCst), 2);

    shutdown_tx.send(()).unwrap();
    assert_eq!(task.await.unwrap(), ExitStatus::Clean);
    assert_eq!(counters.finis.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_artifact_appearance_and_removal_through_rescan() {
    let plugin_dir = TempDir::new().unwrap();
    let sysctl_dir = TempDir::new().unwrap();
    let counters = Counters::default();

    let mut factories: HashMap<String, TunerFactory> = HashMap::new();
    factories.insert("recording_tuner".to_string(), recording_factory(&counters, false));

    let supervisor = Supervisor::new(
        fast_config(plugin_dir.path(), sysctl_dir.path()),
        factories,
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(supervisor.run(shutdown_rx));
    sleep(Duration::from_millis(30)).await;
    assert_eq!(counters.inits.load(Ordering::SeqCst), 0);

    // Dropping the artifact in gets it initialized within 2x rescan.
    let artifact = plugin_dir.path().join("recording_tuner.so");
    std::fs::write(&artifact, b"artifact").unwrap();
    sleep(Duration::from_millis(120)).await;
    assert_eq!(counters.inits.load(Ordering::SeqCst), 1);

    // Removing it runs fini within 2x rescan.
    std::fs::remove_file(&artifact).unwrap();
    sleep(Duration::from_millis(120)).await;
    assert_eq!(counters.finis.load(Ordering::SeqCst), 1);

    shutdown_tx.send(()).unwrap();
    assert_eq!(task.await.unwrap(), ExitStatus::Clean);
}

#[tokio::test]
async fn test_correlated_latency_suppresses_tcp_buffer_increase() {
    let plugin_dir = TempDir::new().unwrap();
    let sysctl_dir = TempDir::new().unwrap();
    seed_tcp_sysctls(sysctl_dir.path());
    std::fs::write(plugin_dir.path().join("tcp_buffer_tuner.so"), b"artifact").unwrap();

    let mut supervisor = Supervisor::new(
        fast_config(plugin_dir.path(), sysctl_dir.path()),
        builtin_factories(),
    );
    let (tx, source) = ChannelSource::channel("test-events");
    supervisor.add_event_source(Box::new(source));

    // Perfect correlation between buffer growth and latency for this key.
    let corr = supervisor.corr_map();
    let key = CorrKey {
        id: TCP_BUFFER_TCP_WMEM,
        netns_cookie: NETNS_COOKIE_UNSUPPORTED,
    };
    for i in 1..=10 {
        corr.update(key, i, i);
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(supervisor.run(shutdown_rx));
    sleep(Duration::from_millis(50)).await;

    let mut event = TuningEvent {
        tuner_id: 0,
        scenario_id: TCP_BUFFER_INCREASE,
        event_id: TCP_BUFFER_TCP_WMEM,
        netns_cookie: NETNS_COOKIE_UNSUPPORTED,
        ..Default::default()
    };
    event.update[0] = TunableUpdate {
        id: TCP_BUFFER_TCP_WMEM,
        _pad: 0,
        old: [4096, 16384, 65536],
        new: [4096, 16384, 131072],
    };
    tx.send(event).unwrap();
    sleep(Duration::from_millis(100)).await;

    // The increase was rewritten to no-change: max stays at its old value.
    let io = SysctlIo::with_root(sysctl_dir.path());
    assert_eq!(io.read("net.ipv4.tcp_wmem", 3).unwrap(), [4096, 16384, 65536]);

    shutdown_tx.send(()).unwrap();
    assert_eq!(task.await.unwrap(), ExitStatus::Clean);
}

#[tokio::test]
async fn test_uncorrelated_tcp_buffer_increase_is_written() {
    let plugin_dir = TempDir::new().unwrap();
    let sysctl_dir = TempDir::new().unwrap();
    seed_tcp_sysctls(sysctl_dir.path());
    std::fs::write(plugin_dir.path().join("tcp_buffer_tuner.so"), b"artifact").unwrap();

    let mut supervisor = Supervisor::new(
        fast_config(plugin_dir.path(), sysctl_dir.path()),
        builtin_factories(),
    );
    let (tx, source) = ChannelSource::channel("test-events");
    supervisor.add_event_source(Box::new(source));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(supervisor.run(shutdown_rx));
    sleep(Duration::from_millis(50)).await;

    let mut event = TuningEvent {
        tuner_id: 0,
        scenario_id: TCP_BUFFER_INCREASE,
        event_id: TCP_BUFFER_TCP_WMEM,
        netns_cookie: NETNS_COOKIE_UNSUPPORTED,
        ..Default::default()
    };
    event.update[0] = TunableUpdate {
        id: TCP_BUFFER_TCP_WMEM,
        _pad: 0,
        old: [4096, 16384, 65536],
        new: [4096, 16384, 131072],
    };
    tx.send(event).unwrap();
    sleep(Duration::from_millis(100)).await;

    // new max within the 4x cap: written through, then rolled back on exit.
    let io = SysctlIo::with_root(sysctl_dir.path());
    assert_eq!(io.read("net.ipv4.tcp_wmem", 3).unwrap(), [4096, 16384, 131072]);

    shutdown_tx.send(()).unwrap();
    assert_eq!(task.await.unwrap(), ExitStatus::Clean);
    assert_eq!(io.read("net.ipv4.tcp_wmem", 3).unwrap(), [4096, 16384, 65536]);
}

/// Event source that fails hard on every drain
struct BrokenSource;

impl EventSource for BrokenSource {
    fn label(&self) -> &str {
        "broken"
    }

    fn drain(&mut self, _out: &mut Vec<TuningEvent>) -> Result<(), TuneError> {
        Err(TuneError::RingReadFailed {
            source_name: "broken".to_string(),
            reason: "device gone".to_string(),
        })
    }
}

#[tokio::test]
async fn test_repeated_ring_failures_exit_unhealthy() {
    let plugin_dir = TempDir::new().unwrap();
    let sysctl_dir = TempDir::new().unwrap();

    let mut supervisor = Supervisor::new(
        fast_config(plugin_dir.path(), sysctl_dir.path()),
        HashMap::new(),
    );
    supervisor.add_event_source(Box::new(BrokenSource));

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let status = tokio::time::timeout(Duration::from_secs(5), supervisor.run(shutdown_rx))
        .await
        .expect("supervisor should give up on its own");
    assert_eq!(status, ExitStatus::RingUnhealthy);
    assert_eq!(status.code(), 2);
}

#[tokio::test]
async fn test_panicking_handler_is_fatal() {
    let plugin_dir = TempDir::new().unwrap();
    let sysctl_dir = TempDir::new().unwrap();
    let counters = Counters::default();

    let mut factories: HashMap<String, TunerFactory> = HashMap::new();
    factories.insert("recording_tuner".to_string(), recording_factory(&counters, true));
    std::fs::write(plugin_dir.path().join("recording_tuner.so"), b"artifact").unwrap();

    let mut supervisor = Supervisor::new(
        fast_config(plugin_dir.path(), sysctl_dir.path()),
        factories,
    );
    let (tx, source) = ChannelSource::channel("test-events");
    supervisor.add_event_source(Box::new(source));

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(supervisor.run(shutdown_rx));
    sleep(Duration::from_millis(50)).await;

    tx.send(plain_event(0, 1, 7)).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("supervisor should exit")
        .unwrap();
    assert_eq!(status, ExitStatus::FatalPlugin);
    assert_eq!(status.code(), 3);
}
