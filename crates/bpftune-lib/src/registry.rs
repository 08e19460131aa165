//! Tunable registry and write policy
//!
//! Owns the authoritative view of every tunable a tuner has claimed and
//! mediates every write: growth/shrink caps against the captured original,
//! per-(tunable, namespace) cooldown, deference to external administrators,
//! and rollback to originals on tuner teardown.

use crate::errors::TuneError;
use crate::event::{GLOBAL_NETNS_COOKIE, NETNS_COOKIE_UNSUPPORTED};
use crate::models::{TunableDesc, MAX_ARITY};
use crate::netns::NetnsSwitcher;
use crate::observability::{DaemonMetrics, StructuredLogger};
use crate::sysctl::SysctlIo;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Increases are clamped to this multiple of the captured original
pub const MAX_GROWTH_FACTOR: i64 = 4;

/// Decreases are clamped to this divisor of the captured original
pub const MAX_SHRINK_FACTOR: i64 = 4;

/// Minimum interval between writes to one (tunable, namespace)
pub const MIN_WRITE_INTERVAL: Duration = Duration::from_secs(1);

/// Mutable state for one (tuner, tunable, namespace) triple
#[derive(Debug, Clone)]
pub struct TunableState {
    /// Value captured before the daemon's first write; rollback target
    pub original: [i64; MAX_ARITY],
    /// Last value the daemon wrote or read
    pub current: [i64; MAX_ARITY],
    pub last_write: Option<Instant>,
    pub write_count: u64,
}

impl TunableState {
    fn captured(values: [i64; MAX_ARITY]) -> Self {
        Self {
            original: values,
            current: values,
            last_write: None,
            write_count: 0,
        }
    }
}

/// Result of a mediated write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Values written to the kernel (possibly clamped by the cap)
    Written {
        values: [i64; MAX_ARITY],
        clamped: bool,
    },
    /// Dropped: previous write to this (tunable, namespace) was too recent
    SkippedCooldown,
    /// Dropped: the target namespace could not be entered
    SkippedNamespace,
    /// The sysctl write itself failed; state unchanged, retried on next event
    Failed,
}

type StateKey = (u32, u32, i64);

/// Registry of claimed tunables and their per-namespace state
pub struct TunableRegistry {
    sysctl: SysctlIo,
    switcher: NetnsSwitcher,
    netns_enabled: bool,
    cooldown: Duration,
    logger: StructuredLogger,
    metrics: DaemonMetrics,
    descs: HashMap<(u32, u32), TunableDesc>,
    state: HashMap<StateKey, TunableState>,
}

impl TunableRegistry {
    pub fn new(sysctl: SysctlIo, netns_enabled: bool) -> Self {
        Self {
            sysctl,
            switcher: NetnsSwitcher::new(),
            netns_enabled,
            cooldown: MIN_WRITE_INTERVAL,
            logger: StructuredLogger::new(),
            metrics: DaemonMetrics::new(),
            descs: HashMap::new(),
            state: HashMap::new(),
        }
    }

    /// Override the per-tunable write cooldown
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Override the namespace runtime directory used for cookie resolution
    pub fn with_netns_switcher(mut self, switcher: NetnsSwitcher) -> Self {
        self.switcher = switcher;
        self
    }

    /// Claim descriptors for a tuner, capturing global originals
    ///
    /// Per-namespace originals are captured lazily on first observation. A
    /// descriptor whose current value cannot be read is still claimed; its
    /// capture is retried on first write.
    pub fn register(&mut self, tuner_id: u32, descs: Vec<TunableDesc>) {
        for desc in descs {
            match self.sysctl.read(&desc.name, desc.arity) {
                Ok(values) => {
                    self.state
                        .insert((tuner_id, desc.id, GLOBAL_NETNS_COOKIE), TunableState::captured(values));
                }
                Err(e) => {
                    warn!(tunable = %desc.name, error = %e, "could not capture original value");
                }
            }
            self.descs.insert((tuner_id, desc.id), desc);
        }
    }

    /// Descriptor lookup for a claimed tunable
    pub fn descriptor(&self, tuner_id: u32, tunable_id: u32) -> Option<&TunableDesc> {
        self.descs.get(&(tuner_id, tunable_id))
    }

    /// State for one (tuner, tunable, namespace) triple, if captured
    pub fn state(&self, tuner_id: u32, tunable_id: u32, netns_cookie: i64) -> Option<&TunableState> {
        self.state.get(&(tuner_id, tunable_id, netns_cookie))
    }

    /// Mediated write of a tunable on behalf of a tuner
    ///
    /// `reason` is a preformatted human-readable explanation logged at INFO
    /// on success.
    pub fn write(
        &mut self,
        tuner_id: u32,
        tuner_name: &str,
        tunable_id: u32,
        scenario_label: &str,
        netns_cookie: i64,
        values: [i64; MAX_ARITY],
        reason: &str,
    ) -> Result<WriteOutcome, TuneError> {
        self.write_at(
            Instant::now(),
            tuner_id,
            tuner_name,
            tunable_id,
            scenario_label,
            netns_cookie,
            values,
            reason,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn write_at(
        &mut self,
        now: Instant,
        tuner_id: u32,
        tuner_name: &str,
        tunable_id: u32,
        scenario_label: &str,
        netns_cookie: i64,
        mut values: [i64; MAX_ARITY],
        reason: &str,
    ) -> Result<WriteOutcome, TuneError> {
        let desc = self
            .descs
            .get(&(tuner_id, tunable_id))
            .ok_or(TuneError::UnknownTunable {
                tuner: tuner_id,
                tunable: tunable_id,
            })?
            .clone();

        // Namespaced writes degrade to global when disabled or unsupported.
        let cookie = if desc.namespaced
            && self.netns_enabled
            && netns_cookie != NETNS_COOKIE_UNSUPPORTED
        {
            netns_cookie
        } else {
            GLOBAL_NETNS_COOKIE
        };

        let key = (tuner_id, tunable_id, cookie);

        // First touch of this namespace: capture the original before writing.
        if !self.state.contains_key(&key) {
            match self.read_scoped(&desc, cookie) {
                Ok(current) => {
                    self.state.insert(key, TunableState::captured(current));
                }
                Err(TuneError::NamespaceEnterFailed { cookie, reason }) => {
                    warn!(tunable = %desc.name, cookie, reason = %reason, "skipping namespaced write");
                    return Ok(WriteOutcome::SkippedNamespace);
                }
                Err(e) => {
                    warn!(tunable = %desc.name, error = %e, "could not capture original value");
                    return Ok(WriteOutcome::Failed);
                }
            }
        }

        // Concurrent writer detection: an external administrator wins.
        if let Ok(kernel_now) = self.read_scoped(&desc, cookie) {
            let state = self.state.get_mut(&key).expect("state captured above");
            if kernel_now != state.current {
                self.logger
                    .log_external_mutation(&desc.name, cookie, &kernel_now);
                state.original = kernel_now;
                state.current = kernel_now;
            }
        } else {
            debug!(tunable = %desc.name, "pre-write refresh failed; using cached value");
        }

        let state = self.state.get_mut(&key).expect("state captured above");

        // Cap: clamp each component into [original/shrink, original*growth].
        let mut clamped = false;
        for i in 0..desc.arity {
            let original = state.original[i];
            if original <= 0 {
                continue;
            }
            let ceiling = original.saturating_mul(MAX_GROWTH_FACTOR);
            let floor = original / MAX_SHRINK_FACTOR;
            if values[i] > ceiling {
                values[i] = ceiling;
                clamped = true;
            } else if values[i] < floor {
                values[i] = floor;
                clamped = true;
            }
        }

        // Cooldown: one write per interval per (tunable, namespace).
        if let Some(last) = state.last_write {
            if now.duration_since(last) < self.cooldown {
                debug!(tunable = %desc.name, cookie, "write skipped by cooldown");
                return Ok(WriteOutcome::SkippedCooldown);
            }
        }

        match self.write_scoped(&desc, cookie, &values) {
            Ok(()) => {}
            Err(TuneError::NamespaceEnterFailed { cookie, reason }) => {
                warn!(tunable = %desc.name, cookie, reason = %reason, "skipping namespaced write");
                return Ok(WriteOutcome::SkippedNamespace);
            }
            Err(e) => {
                warn!(tunable = %desc.name, error = %e, "sysctl write failed");
                return Ok(WriteOutcome::Failed);
            }
        }

        let state = self.state.get_mut(&key).expect("state captured above");
        state.current = values;
        state.last_write = Some(now);
        state.write_count += 1;
        self.metrics.inc_sysctl_writes();
        self.logger.log_write(tuner_name, scenario_label, reason);

        Ok(WriteOutcome::Written { values, clamped })
    }

    /// Restore originals for every (tunable, namespace) this tuner wrote
    ///
    /// Bypasses cap and cooldown; failures are logged and the remaining pairs
    /// still restored.
    pub fn rollback(&mut self, tuner_id: u32) {
        let touched: Vec<StateKey> = self
            .state
            .iter()
            .filter(|((t, _, _), st)| *t == tuner_id && st.write_count > 0)
            .map(|(key, _)| *key)
            .collect();

        for key in touched {
            let (_, tunable_id, cookie) = key;
            let Some(desc) = self.descs.get(&(tuner_id, tunable_id)).cloned() else {
                continue;
            };
            let original = self.state[&key].original;
            match self.write_scoped(&desc, cookie, &original) {
                Ok(()) => {
                    debug!(tunable = %desc.name, cookie, "restored original value");
                    let state = self.state.get_mut(&key).expect("key collected above");
                    state.current = original;
                    self.metrics.inc_rollbacks();
                }
                Err(e) => {
                    warn!(tunable = %desc.name, cookie, error = %e, "rollback failed");
                }
            }
        }
    }

    /// Forget a tuner's descriptors and state after rollback
    pub fn unregister(&mut self, tuner_id: u32) {
        self.descs.retain(|(t, _), _| *t != tuner_id);
        self.state.retain(|(t, _, _), _| *t != tuner_id);
    }

    fn read_scoped(
        &mut self,
        desc: &TunableDesc,
        cookie: i64,
    ) -> Result<[i64; MAX_ARITY], TuneError> {
        if cookie == GLOBAL_NETNS_COOKIE {
            self.sysctl.read(&desc.name, desc.arity)
        } else {
            let _guard = self.switcher.enter(cookie)?;
            self.sysctl.read(&desc.name, desc.arity)
        }
    }

    fn write_scoped(
        &mut self,
        desc: &TunableDesc,
        cookie: i64,
        values: &[i64; MAX_ARITY],
    ) -> Result<(), TuneError> {
        if cookie == GLOBAL_NETNS_COOKIE {
            self.sysctl.write(&desc.name, desc.arity, values)
        } else {
            let _guard = self.switcher.enter(cookie)?;
            self.sysctl.write(&desc.name, desc.arity, values)
        }
    }
}
