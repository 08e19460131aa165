//! Structured error types for the tuning daemon
//!
//! Using thiserror for automatic Display implementation and error chaining.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TuneError {
    #[error("failed to load probe object for tuner {tuner}: {reason}")]
    ProbeLoadFailed { tuner: String, reason: String },

    #[error("failed to attach probe {probe} for tuner {tuner}: {reason}")]
    ProbeAttachFailed {
        tuner: String,
        probe: String,
        reason: String,
    },

    #[error("failed to read sysctl {name}: {reason}")]
    SysctlReadFailed { name: String, reason: String },

    #[error("failed to write sysctl {name}: {reason}")]
    SysctlWriteFailed { name: String, reason: String },

    #[error("failed to enter network namespace (cookie {cookie}): {reason}")]
    NamespaceEnterFailed { cookie: i64, reason: String },

    #[error("ring read failed on source {source_name}: {reason}")]
    RingReadFailed { source_name: String, reason: String },

    #[error("unknown tuner id {0}")]
    UnknownTunerId(u32),

    #[error("unknown tunable {tunable} for tuner {tuner}")]
    UnknownTunable { tuner: u32, tunable: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysctl_error_display() {
        let err = TuneError::SysctlReadFailed {
            name: "net.ipv4.tcp_wmem".to_string(),
            reason: "No such file or directory".to_string(),
        };
        assert!(err.to_string().contains("net.ipv4.tcp_wmem"));
    }

    #[test]
    fn test_namespace_error_display() {
        let err = TuneError::NamespaceEnterFailed {
            cookie: 42,
            reason: "Operation not permitted".to_string(),
        };
        assert!(err.to_string().contains("42"));
        assert!(err.to_string().contains("Operation not permitted"));
    }
}
