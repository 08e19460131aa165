//! Event ring consumption
//!
//! Tuner probes emit fixed-format records into BPF ring buffers; userspace
//! components emit the same records over in-process channels. Both sit behind
//! the [`EventSource`] seam so the supervisor drains them uniformly.

use crate::errors::TuneError;
use crate::event::TuningEvent;
use aya::maps::{MapData, RingBuf};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;

/// Hard failures within [`RING_FAILURE_WINDOW`] before the ring is unhealthy
pub const RING_FAILURE_LIMIT: usize = 3;

/// Window over which consecutive hard failures are counted
pub const RING_FAILURE_WINDOW: Duration = Duration::from_secs(1);

/// A drainable source of tuning events
pub trait EventSource: Send {
    /// Human-readable source label for logs
    fn label(&self) -> &str;

    /// Move all currently-available events into `out`
    ///
    /// Returns an error only for hard read failures; an empty source is not
    /// an error.
    fn drain(&mut self, out: &mut Vec<TuningEvent>) -> Result<(), TuneError>;
}

/// Events read from a BPF ring buffer map
pub struct RingBufSource {
    label: String,
    ring: RingBuf<MapData>,
}

impl RingBufSource {
    pub fn new(label: impl Into<String>, ring: RingBuf<MapData>) -> Self {
        Self {
            label: label.into(),
            ring,
        }
    }
}

impl EventSource for RingBufSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn drain(&mut self, out: &mut Vec<TuningEvent>) -> Result<(), TuneError> {
        while let Some(item) = self.ring.next() {
            match TuningEvent::from_bytes(&item) {
                Some(event) => out.push(event),
                None => warn!(source = %self.label, "received truncated ring record"),
            }
        }
        Ok(())
    }
}

/// Events emitted from userspace over an in-process channel
///
/// Used by tuners without kernel probes and by tests injecting traffic.
pub struct ChannelSource {
    label: String,
    rx: mpsc::UnboundedReceiver<TuningEvent>,
}

impl ChannelSource {
    /// Create a channel-backed source and its sending half
    pub fn channel(label: impl Into<String>) -> (mpsc::UnboundedSender<TuningEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                label: label.into(),
                rx,
            },
        )
    }
}

impl EventSource for ChannelSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn drain(&mut self, out: &mut Vec<TuningEvent>) -> Result<(), TuneError> {
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        Ok(())
    }
}

/// Tracks hard ring failures against the shutdown threshold
#[derive(Debug, Default)]
pub struct RingHealth {
    failures: VecDeque<Instant>,
}

impl RingHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one hard failure at `now`
    ///
    /// Returns `true` once the failure budget is exhausted and the daemon
    /// should shut down.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.failures.push_back(now);
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > RING_FAILURE_WINDOW {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.len() >= RING_FAILURE_LIMIT
    }

    /// A successful drain clears the failure streak
    pub fn record_ok(&mut self) {
        self.failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_source_drains_in_order() {
        let (tx, mut source) = ChannelSource::channel("test");
        for scenario_id in 0..3 {
            tx.send(TuningEvent {
                scenario_id,
                ..Default::default()
            })
            .unwrap();
        }

        let mut out = Vec::new();
        source.drain(&mut out).unwrap();
        let scenarios: Vec<u32> = out.iter().map(|e| e.scenario_id).collect();
        assert_eq!(scenarios, vec![0, 1, 2]);

        out.clear();
        source.drain(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_ring_health_trips_after_three_failures_in_window() {
        let mut health = RingHealth::new();
        let t0 = Instant::now();
        assert!(!health.record_failure(t0));
        assert!(!health.record_failure(t0 + Duration::from_millis(200)));
        assert!(health.record_failure(t0 + Duration::from_millis(400)));
    }

    #[test]
    fn test_ring_health_window_expires_old_failures() {
        let mut health = RingHealth::new();
        let t0 = Instant::now();
        assert!(!health.record_failure(t0));
        assert!(!health.record_failure(t0 + Duration::from_millis(900)));
        // First failure has aged out of the window by now.
        assert!(!health.record_failure(t0 + Duration::from_millis(1500)));
    }

    #[test]
    fn test_ring_health_success_resets_streak() {
        let mut health = RingHealth::new();
        let t0 = Instant::now();
        health.record_failure(t0);
        health.record_failure(t0 + Duration::from_millis(100));
        health.record_ok();
        assert!(!health.record_failure(t0 + Duration::from_millis(200)));
    }
}
