//! Sysctl file I/O
//!
//! Reads and writes kernel tunables as newline-terminated whitespace-separated
//! integer tuples under a configurable root (default `/proc/sys`). The root is
//! injectable so tests run against a scratch directory.
//!
//! All I/O is synchronous std::fs on the calling thread: namespaced writes
//! depend on the calling thread's active network namespace, which async file
//! I/O would not preserve.

use crate::errors::TuneError;
use crate::models::MAX_ARITY;
use std::path::{Path, PathBuf};

/// Sysctl reader/writer rooted at a filesystem path
#[derive(Debug, Clone)]
pub struct SysctlIo {
    root: PathBuf,
}

impl Default for SysctlIo {
    fn default() -> Self {
        Self::new()
    }
}

impl SysctlIo {
    /// Reader/writer over the real `/proc/sys`
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc/sys"),
        }
    }

    /// Reader/writer over a custom root (for testing)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for a dotted tunable name
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name.replace('.', "/"))
    }

    /// Read a tunable's integer tuple
    pub fn read(&self, name: &str, arity: usize) -> Result<[i64; MAX_ARITY], TuneError> {
        let path = self.path_for(name);
        let content =
            std::fs::read_to_string(&path).map_err(|e| TuneError::SysctlReadFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Self::parse_tuple(&content, arity).map_err(|reason| TuneError::SysctlReadFailed {
            name: name.to_string(),
            reason,
        })
    }

    /// Write a tunable's integer tuple
    pub fn write(
        &self,
        name: &str,
        arity: usize,
        values: &[i64; MAX_ARITY],
    ) -> Result<(), TuneError> {
        let path = self.path_for(name);
        std::fs::write(&path, Self::format_tuple(arity, values)).map_err(|e| {
            TuneError::SysctlWriteFailed {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Parse whitespace-separated integers into a fixed tuple
    ///
    /// Exactly `arity` leading components are required; unused slots are zero.
    pub fn parse_tuple(content: &str, arity: usize) -> Result<[i64; MAX_ARITY], String> {
        let mut values = [0i64; MAX_ARITY];
        let mut fields = content.split_whitespace();
        for slot in values.iter_mut().take(arity) {
            let field = fields
                .next()
                .ok_or_else(|| format!("expected {} components, got fewer", arity))?;
            *slot = field
                .parse()
                .map_err(|_| format!("non-integer component {:?}", field))?;
        }
        Ok(values)
    }

    /// Render a tuple the way the kernel expects it written back
    pub fn format_tuple(arity: usize, values: &[i64; MAX_ARITY]) -> String {
        let rendered: Vec<String> = values
            .iter()
            .take(arity)
            .map(|v| v.to_string())
            .collect();
        format!("{}\n", rendered.join(" "))
    }
}
