//! The tuner contract
//!
//! Every tuning plugin exposes the capability set {init, fini, event_handler}
//! through the [`Tuning`] trait. The host resolves artifacts in the plugin
//! directory to factories producing trait objects; whether a tuner is built
//! in-tree or loaded dynamically is invisible to the rest of the system.

use crate::corr::CorrMap;
use crate::errors::TuneError;
use crate::event::TuningEvent;
use crate::models::{ScenarioDesc, TunableDesc, TunerState, MAX_ARITY};
use crate::netns::NamespaceTracker;
use crate::observability::StructuredLogger;
use crate::registry::{TunableRegistry, WriteOutcome};
use crate::ring::EventSource;
use std::path::PathBuf;
use std::sync::Arc;

/// Produces a fresh tuner implementation for an artifact
pub type TunerFactory = Arc<dyn Fn() -> Box<dyn Tuning> + Send + Sync>;

/// One loaded tuning plugin
#[derive(Debug, Clone)]
pub struct Tuner {
    /// Monotonically assigned, never reused within a process
    pub id: u32,
    /// Stable name derived from the artifact file stem
    pub name: String,
    /// The artifact this tuner was loaded from
    pub artifact: PathBuf,
    pub state: TunerState,
    /// Tunables declared during init
    pub descriptors: Vec<TunableDesc>,
    /// Scenarios declared during init
    pub scenarios: Vec<ScenarioDesc>,
}

impl Tuner {
    pub fn new(id: u32, name: impl Into<String>, artifact: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            artifact: artifact.into(),
            state: TunerState::Loaded,
            descriptors: Vec::new(),
            scenarios: Vec::new(),
        }
    }

    /// Canonical name of a declared tunable
    pub fn tunable_name(&self, tunable_id: u32) -> Option<&str> {
        self.descriptors
            .iter()
            .find(|d| d.id == tunable_id)
            .map(|d| d.name.as_str())
    }

    pub fn scenario(&self, scenario_id: u32) -> Option<&ScenarioDesc> {
        self.scenarios.iter().find(|s| s.id == scenario_id)
    }

    /// Path where this tuner's compiled probe object is expected
    pub fn probe_object_path(&self) -> PathBuf {
        self.artifact.with_extension("bpf.o")
    }
}

/// Host capabilities handed to a tuner's entry points
///
/// The host owns the roster and all shared state; tuners reach both through
/// this context rather than holding back-references.
pub struct TunerCtx<'a> {
    pub tuner: &'a mut Tuner,
    pub registry: &'a mut TunableRegistry,
    pub corr: &'a CorrMap,
    pub namespaces: &'a mut NamespaceTracker,
    pub sources: &'a mut Vec<Box<dyn EventSource>>,
    pub logger: &'a StructuredLogger,
    /// Correlation above which increase scenarios must be suppressed
    pub corr_threshold: f64,
}

impl TunerCtx<'_> {
    /// Declare the tunables and scenarios this tuner owns
    ///
    /// Called from `init`; the registry captures original values for the
    /// global namespace immediately.
    pub fn declare(&mut self, descriptors: Vec<TunableDesc>, scenarios: Vec<ScenarioDesc>) {
        self.registry.register(self.tuner.id, descriptors.clone());
        self.tuner.descriptors = descriptors;
        self.tuner.scenarios = scenarios;
    }

    /// Register an event source feeding this tuner's events to the consumer
    pub fn add_event_source(&mut self, source: Box<dyn EventSource>) {
        self.sources.push(source);
    }

    /// Mediated sysctl write on behalf of this tuner
    pub fn write_tunable(
        &mut self,
        tunable_id: u32,
        scenario_id: u32,
        netns_cookie: i64,
        values: [i64; MAX_ARITY],
        reason: &str,
    ) -> Result<WriteOutcome, TuneError> {
        let label = self
            .tuner
            .scenario(scenario_id)
            .map(|s| s.label.as_str())
            .unwrap_or("unknown scenario");
        self.registry.write(
            self.tuner.id,
            &self.tuner.name,
            tunable_id,
            label,
            netns_cookie,
            values,
            reason,
        )
    }
}

/// Entry points every tuner must provide
pub trait Tuning: Send {
    /// Open and attach probes, declare tunables and scenarios
    ///
    /// Runs to completion before any event is delivered. A returned error
    /// marks the tuner Failed; it is not retried until its artifact changes.
    fn init(&mut self, ctx: &mut TunerCtx<'_>) -> anyhow::Result<()>;

    /// Detach probes and release resources; must be idempotent
    ///
    /// The host rolls registered tunables back to their originals after this
    /// returns.
    fn fini(&mut self, ctx: &mut TunerCtx<'_>);

    /// Handle one event whose tuner id matches
    ///
    /// Runs on the consumer thread; bounded work only, at most one sysctl
    /// write per event.
    fn event_handler(&mut self, ctx: &mut TunerCtx<'_>, event: &TuningEvent);
}
