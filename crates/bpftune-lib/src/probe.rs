//! Kernel probe loading and attachment
//!
//! Loads a tuner's compiled BPF object, seeds its globals, attaches its
//! programs, and hands the events ring buffer to the consumer. The probe
//! programs themselves are opaque to the host; only their event output is
//! interpreted.

use crate::errors::TuneError;
use aya::maps::{MapData, RingBuf};
use aya::programs::{KProbe, TracePoint};
use aya::{Ebpf, EbpfLoader};
use std::path::Path;
use tracing::{info, warn};

/// Name of the ring buffer map every probe object exports
pub const EVENTS_MAP: &str = "events";

fn attach_error(tuner: &str, probe: &str, reason: impl Into<String>) -> TuneError {
    TuneError::ProbeAttachFailed {
        tuner: tuner.to_string(),
        probe: probe.to_string(),
        reason: reason.into(),
    }
}

/// A tuner's loaded BPF object and its attachments
#[derive(Debug)]
pub struct ProbeSet {
    tuner: String,
    ebpf: Ebpf,
}

impl ProbeSet {
    /// Load a BPF object file, seeding the given u64 globals before load
    pub fn load(
        tuner: impl Into<String>,
        object_path: &Path,
        globals: &[(&str, u64)],
    ) -> Result<Self, TuneError> {
        let tuner = tuner.into();
        let data = std::fs::read(object_path).map_err(|e| TuneError::ProbeLoadFailed {
            tuner: tuner.clone(),
            reason: format!("cannot read {}: {}", object_path.display(), e),
        })?;

        let mut loader = EbpfLoader::new();
        for (name, value) in globals {
            loader.set_global(name, value, true);
        }
        let ebpf = loader.load(&data).map_err(|e| TuneError::ProbeLoadFailed {
            tuner: tuner.clone(),
            reason: e.to_string(),
        })?;

        info!(tuner = %tuner, object = %object_path.display(), "probe object loaded");
        Ok(Self { tuner, ebpf })
    }

    /// Attach a kprobe program to a kernel function
    ///
    /// Optional probes cover hook points that do not exist on every kernel;
    /// their attach failure is logged and reported as `false` instead of
    /// failing the tuner.
    pub fn attach_kprobe(
        &mut self,
        program: &str,
        func: &str,
        optional: bool,
    ) -> Result<bool, TuneError> {
        let tuner = self.tuner.clone();
        let prog = match self.ebpf.program_mut(program) {
            Some(prog) => prog,
            None if optional => {
                warn!(tuner = %tuner, program, "optional probe program not found");
                return Ok(false);
            }
            None => return Err(attach_error(&tuner, program, "program not found in object")),
        };

        let kprobe: &mut KProbe = prog
            .try_into()
            .map_err(|e: aya::programs::ProgramError| attach_error(&tuner, program, e.to_string()))?;
        kprobe
            .load()
            .map_err(|e| attach_error(&tuner, program, e.to_string()))?;
        match kprobe.attach(func, 0) {
            Ok(_) => {
                info!(tuner = %tuner, program, func, "kprobe attached");
                Ok(true)
            }
            Err(e) if optional => {
                warn!(tuner = %tuner, program, func, error = %e, "optional kprobe not attached");
                Ok(false)
            }
            Err(e) => Err(attach_error(&tuner, program, e.to_string())),
        }
    }

    /// Attach a tracepoint program
    pub fn attach_tracepoint(
        &mut self,
        program: &str,
        category: &str,
        name: &str,
    ) -> Result<(), TuneError> {
        let tuner = self.tuner.clone();
        let prog = self
            .ebpf
            .program_mut(program)
            .ok_or_else(|| attach_error(&tuner, program, "program not found in object"))?;
        let tracepoint: &mut TracePoint = prog
            .try_into()
            .map_err(|e: aya::programs::ProgramError| attach_error(&tuner, program, e.to_string()))?;
        tracepoint
            .load()
            .map_err(|e| attach_error(&tuner, program, e.to_string()))?;
        tracepoint
            .attach(category, name)
            .map_err(|e| attach_error(&tuner, program, e.to_string()))?;
        info!(tuner = %tuner, program, category, name, "tracepoint attached");
        Ok(())
    }

    /// Take ownership of the probe's events ring buffer
    pub fn take_events_ring(&mut self) -> Result<RingBuf<MapData>, TuneError> {
        let map = self
            .ebpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| TuneError::ProbeLoadFailed {
                tuner: self.tuner.clone(),
                reason: format!("{} map not found in object", EVENTS_MAP),
            })?;
        RingBuf::try_from(map).map_err(|e| TuneError::ProbeLoadFailed {
            tuner: self.tuner.clone(),
            reason: e.to_string(),
        })
    }
}
