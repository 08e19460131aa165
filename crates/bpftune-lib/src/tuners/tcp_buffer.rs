//! TCP buffer tuner
//!
//! Adjusts `tcp_wmem`/`tcp_rmem` maxima for throughput, backs them off under
//! memory pressure, and sizes `tcp_mem` and the netdev backlog. Increases are
//! suppressed once buffer growth starts to correlate with latency.

use crate::compat::KernelParams;
use crate::corr::CorrKey;
use crate::event::TuningEvent;
use crate::models::{ScenarioDesc, TunableDesc, TunableKind, MAX_ARITY};
use crate::probe::ProbeSet;
use crate::ring::RingBufSource;
use crate::tuner::{TunerCtx, Tuning};
use std::path::Path;
use tracing::debug;

pub const TCP_BUFFER_TCP_WMEM: u32 = 0;
pub const TCP_BUFFER_TCP_RMEM: u32 = 1;
pub const TCP_BUFFER_TCP_MEM: u32 = 2;
pub const TCP_BUFFER_TCP_MAX_ORPHANS: u32 = 3;
pub const NETDEV_MAX_BACKLOG: u32 = 4;

pub const TCP_BUFFER_INCREASE: u32 = 0;
pub const TCP_BUFFER_DECREASE: u32 = 1;
pub const TCP_BUFFER_NOCHANGE_LATENCY: u32 = 2;
pub const TCP_MEM_PRESSURE: u32 = 3;
pub const TCP_MEM_EXHAUSTION: u32 = 4;
pub const TCP_MAX_ORPHANS_INCREASE: u32 = 5;
pub const NETDEV_MAX_BACKLOG_INCREASE: u32 = 6;
pub const NETDEV_MAX_BACKLOG_DECREASE: u32 = 7;

fn descriptors() -> Vec<TunableDesc> {
    vec![
        TunableDesc::new(
            TCP_BUFFER_TCP_WMEM,
            TunableKind::Sysctl,
            "net.ipv4.tcp_wmem",
            true,
            3,
        ),
        TunableDesc::new(
            TCP_BUFFER_TCP_RMEM,
            TunableKind::Sysctl,
            "net.ipv4.tcp_rmem",
            true,
            3,
        ),
        TunableDesc::new(
            TCP_BUFFER_TCP_MEM,
            TunableKind::Sysctl,
            "net.ipv4.tcp_mem",
            false,
            3,
        ),
        TunableDesc::new(
            TCP_BUFFER_TCP_MAX_ORPHANS,
            TunableKind::Sysctl,
            "net.ipv4.tcp_max_orphans",
            false,
            1,
        ),
        TunableDesc::new(
            NETDEV_MAX_BACKLOG,
            TunableKind::Sysctl,
            "net.core.netdev_max_backlog",
            false,
            1,
        ),
    ]
}

fn scenarios() -> Vec<ScenarioDesc> {
    vec![
        ScenarioDesc::new(
            TCP_BUFFER_INCREASE,
            "need to increase TCP buffer size(s)",
            "Need to increase buffer size(s) to maximize throughput",
        ),
        ScenarioDesc::new(
            TCP_BUFFER_DECREASE,
            "need to decrease TCP buffer size(s)",
            "Need to decrease buffer size(s) to reduce memory utilization",
        ),
        ScenarioDesc::new(
            TCP_BUFFER_NOCHANGE_LATENCY,
            "need to retain TCP buffer size due to latency",
            "Latency is starting to correlate with buffer size increases, so do not make buffer size increase to avoid this effect",
        ),
        ScenarioDesc::new(
            TCP_MEM_PRESSURE,
            "approaching TCP memory pressure",
            "Since memory pressure/exhaustion are unstable system states, adjust tcp memory-related tunables",
        ),
        ScenarioDesc::new(
            TCP_MEM_EXHAUSTION,
            "approaching TCP memory exhaustion",
            "Since memory exhaustion is a highly unstable state, adjust TCP memory-related tunables to avoid exhaustion",
        ),
        ScenarioDesc::new(
            TCP_MAX_ORPHANS_INCREASE,
            "increase max number of orphaned sockets",
            "",
        ),
        ScenarioDesc::new(
            NETDEV_MAX_BACKLOG_INCREASE,
            "increase max backlog for received packets",
            "",
        ),
        ScenarioDesc::new(
            NETDEV_MAX_BACKLOG_DECREASE,
            "decrease max backlog for received packets",
            "",
        ),
    ]
}

/// Estimate of the pages TCP can use for buffers
///
/// TCP sizes `tcp_mem` from `nr_free_buffer_pages()` at boot; the same
/// estimate is recoverable from `/proc/zoneinfo`. For the initial estimate the
/// Normal zone's managed pages less its high watermark is used; afterwards the
/// zone's free page count.
pub fn nr_free_buffer_pages(proc_root: &Path, initial: bool) -> i64 {
    let path = proc_root.join("zoneinfo");
    match std::fs::read_to_string(&path) {
        Ok(content) => parse_zoneinfo(&content, initial),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "could not read zoneinfo");
            0
        }
    }
}

fn parse_zoneinfo(content: &str, initial: bool) -> i64 {
    let mut pages: i64 = 0;
    let mut in_normal = false;
    let mut high: i64 = 0;

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 4 && fields[0] == "Node" && fields[2] == "zone" {
            in_normal = fields[3] == "Normal";
            high = 0;
            continue;
        }
        if !in_normal {
            continue;
        }
        match fields.as_slice() {
            ["high", value] => high = value.parse().unwrap_or(0),
            ["managed", value] if initial => {
                let managed: i64 = value.parse().unwrap_or(0);
                if managed > high {
                    pages += managed - high;
                }
            }
            ["nr_free_pages", value] if !initial => {
                pages += value.parse::<i64>().unwrap_or(0);
            }
            _ => {}
        }
    }
    pages
}

#[derive(Default)]
pub struct TcpBufferTuner {
    probes: Option<ProbeSet>,
}

impl TcpBufferTuner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tuning for TcpBufferTuner {
    fn init(&mut self, ctx: &mut TunerCtx<'_>) -> anyhow::Result<()> {
        ctx.declare(descriptors(), scenarios());

        let object = ctx.tuner.probe_object_path();
        if object.exists() {
            let params = KernelParams::detect();
            let free_pages = nr_free_buffer_pages(Path::new("/proc"), true);
            let globals: Vec<(&str, u64)> = vec![
                ("kernel_page_size", params.page_size as u64),
                ("kernel_page_shift", params.page_shift as u64),
                ("sk_mem_quantum", params.sk_mem_quantum as u64),
                ("sk_mem_quantum_shift", params.sk_mem_quantum_shift as u64),
                ("nr_free_buffer_pages", free_pages as u64),
            ];
            let mut probes = ProbeSet::load(&ctx.tuner.name, &object, &globals)?;
            probes.attach_kprobe("tcp_sndbuf_expand", "tcp_sndbuf_expand", false)?;
            probes.attach_kprobe("tcp_rcv_space_adjust", "tcp_rcv_space_adjust", false)?;
            probes.attach_kprobe("tcp_enter_memory_pressure", "tcp_enter_memory_pressure", true)?;
            probes.attach_kprobe("netdev_backlog_drop", "enqueue_to_backlog", true)?;
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

        let update = event.update[0];
        let id = update.id;
        let Some(tunable) = ctx.tuner.tunable_name(id).map(str::to_string) else {
            debug!(tunable_id = id, "unknown tunable for tcp_buffer_tuner");
            return;
        };

        let old = update.old;
        let mut new = update.new;
        let mut scenario = event.scenario_id;

        let lowmem = match scenario {
            TCP_MEM_EXHAUSTION => "near memory exhaustion",
            TCP_MEM_PRESSURE => "under memory pressure",
            _ => "normal memory conditions",
        };

        // Increases that have started to cost latency are downgraded to
        // no-change before the write is attempted.
        let key = CorrKey {
            id,
            netns_cookie: event.netns_cookie,
        };
        if let Some(entry) = ctx.corr.snapshot(&key) {
            let corr = entry.compute();
            ctx.logger
                .log_correlation(&tunable, event.netns_cookie, &new, entry.covar(), corr);
            if corr > ctx.corr_threshold && scenario == TCP_BUFFER_INCREASE {
                scenario = TCP_BUFFER_NOCHANGE_LATENCY;
            }
        }

        match id {
            TCP_BUFFER_TCP_MEM => {
                let reason = format!(
                    "Due to {} change {}(min pressure max) from ({} {} {}) -> ({} {} {})",
                    lowmem, tunable, old[0], old[1], old[2], new[0], new[1], new[2]
                );
                self.write(ctx, id, scenario, event.netns_cookie, new, &reason);
            }
            TCP_BUFFER_TCP_WMEM | TCP_BUFFER_TCP_RMEM => {
                let why = match scenario {
                    TCP_BUFFER_INCREASE => {
                        "need to increase max buffer size to maximize throughput"
                    }
                    TCP_BUFFER_DECREASE => lowmem,
                    TCP_BUFFER_NOCHANGE_LATENCY => {
                        new[2] = old[2];
                        "correlation between buffer size increase and latency"
                    }
                    _ => "unknown reason",
                };
                let reason = format!(
                    "Due to {} change {}(min default max) from ({} {} {}) -> ({} {} {})",
                    why, tunable, old[0], old[1], old[2], new[0], new[1], new[2]
                );
                self.write(ctx, id, scenario, event.netns_cookie, new, &reason);
            }
            NETDEV_MAX_BACKLOG => {
                let reason = format!(
                    "Dropped more than 1/4 of the backlog queue size ({}) in last minute; \
                     increase backlog queue size from {} -> {} to support faster network device.",
                    old[0], old[0], new[0]
                );
                self.write(ctx, id, scenario, event.netns_cookie, new, &reason);
            }
            TCP_BUFFER_TCP_MAX_ORPHANS => {}
            _ => {}
        }
    }
}

impl TcpBufferTuner {
    fn write(
        &self,
        ctx: &mut TunerCtx<'_>,
        id: u32,
        scenario: u32,
        netns_cookie: i64,
        values: [i64; MAX_ARITY],
        reason: &str,
    ) {
        if let Err(e) = ctx.write_tunable(id, scenario, netns_cookie, values, reason) {
            debug!(tunable_id = id, error = %e, "tunable write rejected");
        }
    }
}
