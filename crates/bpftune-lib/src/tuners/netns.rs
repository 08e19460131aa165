//! Network namespace tuner
//!
//! Owns the namespace-watch probe. Its events carry no tunable updates; they
//! drive the host's namespace table so other tuners' per-namespace policy has
//! somewhere to hang.

use crate::event::TuningEvent;
use crate::models::ScenarioDesc;
use crate::probe::ProbeSet;
use crate::ring::RingBufSource;
use crate::tuner::{TunerCtx, Tuning};
use std::time::Instant;
use tracing::debug;

pub const NETNS_SCENARIO_CREATE: u32 = 0;
pub const NETNS_SCENARIO_DESTROY: u32 = 1;

#[derive(Default)]
pub struct NetnsTuner {
    probes: Option<ProbeSet>,
}

impl NetnsTuner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tuning for NetnsTuner {
    fn init(&mut self, ctx: &mut TunerCtx<'_>) -> anyhow::Result<()> {
        ctx.declare(
            Vec::new(),
            vec![
                ScenarioDesc::new(
                    NETNS_SCENARIO_CREATE,
                    "network namespace created",
                    "A new network namespace appeared; track it so per-namespace policy applies",
                ),
                ScenarioDesc::new(
                    NETNS_SCENARIO_DESTROY,
                    "network namespace destroyed",
                    "A network namespace went away; its tunable overlays are obsolete",
                ),
            ],
        );

        let object = ctx.tuner.probe_object_path();
        if object.exists() {
            let mut probes = ProbeSet::load(&ctx.tuner.name, &object, &[])?;
            probes.attach_kprobe("netns_created", "setup_net", false)?;
            probes.attach_kprobe("netns_freed", "net_free", true)?;
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
        let now = Instant::now();
        match event.scenario_id {
            NETNS_SCENARIO_CREATE => ctx.namespaces.created(event.netns_cookie, now),
            NETNS_SCENARIO_DESTROY => ctx.namespaces.destroyed(event.netns_cookie, now),
            other => debug!(scenario_id = other, "unknown netns scenario"),
        }
    }
}
