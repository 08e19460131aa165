//! In-tree tuners
//!
//! Built-in tuners register here; the host resolves plugin artifacts against
//! this table by file stem. The host API makes no distinction between these
//! and dynamically loaded tuners.

pub mod netns;
pub mod sample;
pub mod tcp_buffer;

use crate::tuner::{TunerFactory, Tuning};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory table for every in-tree tuner, keyed by artifact stem
pub fn builtin_factories() -> HashMap<String, TunerFactory> {
    let mut factories: HashMap<String, TunerFactory> = HashMap::new();
    factories.insert(
        "sample_tuner".to_string(),
        Arc::new(|| Box::new(sample::SampleTuner::new()) as Box<dyn Tuning>),
    );
    factories.insert(
        "tcp_buffer_tuner".to_string(),
        Arc::new(|| Box::new(tcp_buffer::TcpBufferTuner::new()) as Box<dyn Tuning>),
    );
    factories.insert(
        "netns_tuner".to_string(),
        Arc::new(|| Box::new(netns::NetnsTuner::new()) as Box<dyn Tuning>),
    );
    factories
}
