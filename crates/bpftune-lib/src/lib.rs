//! Core library for the autonomous kernel tuning daemon
//!
//! This crate provides the daemon's hard core:
//! - Tuner host and plugin lifecycle
//! - Event ring consumption, dedup, and dispatch
//! - Tunable registry with caps, cooldown, and rollback
//! - Streaming correlation estimation
//! - Network namespace tracking and entry

pub mod compat;
pub mod corr;
pub mod dedup;
pub mod errors;
pub mod event;
pub mod health;
pub mod host;
pub mod models;
pub mod netns;
pub mod observability;
pub mod probe;
pub mod registry;
pub mod ring;
pub mod supervisor;
pub mod sysctl;
pub mod tuner;
pub mod tuners;

pub use errors::TuneError;
pub use event::{TunableUpdate, TuningEvent, NETNS_COOKIE_UNSUPPORTED};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::{ScenarioDesc, TunableDesc, TunableKind, TunerState};
pub use observability::{DaemonMetrics, StructuredLogger};
pub use supervisor::{ExitStatus, Supervisor, SupervisorConfig};
