//! Sample tuner
//!
//! The minimum viable tuner: registers no tunables, declares a single
//! scenario, and logs the events its probe emits. `fini` restores nothing
//! because nothing was written.

use crate::event::TuningEvent;
use crate::models::ScenarioDesc;
use crate::probe::ProbeSet;
use crate::ring::RingBufSource;
use crate::tuner::{TunerCtx, Tuning};
use tracing::debug;

pub const SAMPLE_SCENARIO: u32 = 0;

#[derive(Default)]
pub struct SampleTuner {
    probes: Option<ProbeSet>,
}

impl SampleTuner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tuning for SampleTuner {
    fn init(&mut self, ctx: &mut TunerCtx<'_>) -> anyhow::Result<()> {
        ctx.declare(
            Vec::new(),
            vec![ScenarioDesc::new(
                SAMPLE_SCENARIO,
                "sample scenario",
                "sysctl value was accessed",
            )],
        );

        // Probe objects ship separately from the daemon; without one the
        // tuner stays alive and is driven by external event sources.
        let object = ctx.tuner.probe_object_path();
        if object.exists() {
            let mut probes = ProbeSet::load(&ctx.tuner.name, &object, &[])?;
            probes.attach_kprobe("sample_event", "proc_sys_call_handler", true)?;
            let ring = probes.take_events_ring()?;
            ctx.add_event_source(Box::new(RingBufSource::new(ctx.tuner.name.clone(), ring)));
            self.probes = Some(probes);
        } else {
            debug!(tuner = %ctx.tuner.name, "no probe object next to artifact");
        }
        Ok(())
    }

    fn fini(&mut self, ctx: &mut TunerCtx<'_>) {
        debug!(tuner = %ctx.tuner.name, "calling fini");
        self.probes = None;
    }

    fn event_handler(&mut self, ctx: &mut TunerCtx<'_>, event: &TuningEvent) {
        ctx.logger.log_event(event.scenario_id, &ctx.tuner.name);
    }
}
