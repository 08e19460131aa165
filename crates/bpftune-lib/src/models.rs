//! Core data model for tuners, tunables, and scenarios

use serde::{Deserialize, Serialize};

/// Maximum number of numeric components a tunable carries
pub const MAX_ARITY: usize = 3;

/// Where a tunable lives in the kernel's configuration surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunableKind {
    /// A `/proc/sys` entry addressed by dotted name
    Sysctl,
    /// A non-sysctl procfs file
    Procfs,
    /// Anything else (device attributes, debugfs, ...)
    Other,
}

/// Immutable description of one kernel tunable claimed by a tuner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunableDesc {
    /// Per-tuner-unique tunable id
    pub id: u32,
    pub kind: TunableKind,
    /// Canonical dotted name, e.g. `net.ipv4.tcp_wmem`
    pub name: String,
    /// Whether a per-network-namespace overlay exists for this tunable
    pub namespaced: bool,
    /// Number of numeric components (1..=3)
    pub arity: usize,
}

impl TunableDesc {
    pub fn new(
        id: u32,
        kind: TunableKind,
        name: impl Into<String>,
        namespaced: bool,
        arity: usize,
    ) -> Self {
        debug_assert!((1..=MAX_ARITY).contains(&arity));
        Self {
            id,
            kind,
            name: name.into(),
            namespaced,
            arity,
        }
    }
}

/// A named reason for a proposed tunable change
///
/// Purely informational; scenarios annotate log lines and event records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDesc {
    pub id: u32,
    /// Short label, e.g. "need to increase TCP buffer size(s)"
    pub label: String,
    /// Longer human-readable rationale
    pub description: String,
}

impl ScenarioDesc {
    pub fn new(id: u32, label: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            description: description.into(),
        }
    }
}

/// Lifecycle state of a loaded tuner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunerState {
    /// Artifact resolved, entry points located, `init` not yet run
    Loaded,
    /// `init` completed; tunables and scenarios registered
    Initialized,
    /// Probes attached and delivering events
    Attached,
    /// `init` failed; not retried until the artifact changes on disk
    Failed,
    /// Artifact removed or daemon shutting down; no further events delivered
    Gone,
}

impl TunerState {
    /// Whether events may be delivered to a tuner in this state
    pub fn accepts_events(&self) -> bool {
        matches!(self, TunerState::Initialized | TunerState::Attached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunable_desc_construction() {
        let desc = TunableDesc::new(0, TunableKind::Sysctl, "net.ipv4.tcp_wmem", true, 3);
        assert_eq!(desc.name, "net.ipv4.tcp_wmem");
        assert!(desc.namespaced);
        assert_eq!(desc.arity, 3);
    }

    #[test]
    fn test_state_event_acceptance() {
        assert!(!TunerState::Loaded.accepts_events());
        assert!(TunerState::Initialized.accepts_events());
        assert!(TunerState::Attached.accepts_events());
        assert!(!TunerState::Failed.accepts_events());
        assert!(!TunerState::Gone.accepts_events());
    }
}
