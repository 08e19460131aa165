//! Network namespace tracking and entry
//!
//! The tracker maintains a cookie-keyed table of namespaces observed through
//! create/destroy events or event sightings. The switcher resolves a cookie to
//! a namespace file and moves the calling thread into it for the duration of a
//! guard, restoring the original namespace on drop.

use crate::compat::SO_NETNS_COOKIE;
use crate::errors::TuneError;
use crate::event::NETNS_COOKIE_UNSUPPORTED;
use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a destroyed namespace stays resolvable for late events
pub const TOMBSTONE_GRACE: Duration = Duration::from_secs(30);

/// Lifecycle of one tracked namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsState {
    /// Seen via create event or first sighting
    Live,
    /// Destroy observed; late events still delivered until the grace elapses
    Tombstoned,
    /// Grace elapsed; events referencing this cookie are dropped
    Evicted,
}

/// Per-cookie namespace record
#[derive(Debug, Clone)]
pub struct NamespaceRecord {
    pub state: NsState,
    pub created_at: Instant,
    state_since: Instant,
    /// Tuners that have ever observed this namespace
    observers: HashSet<u32>,
}

impl NamespaceRecord {
    fn new(now: Instant) -> Self {
        Self {
            state: NsState::Live,
            created_at: now,
            state_since: now,
            observers: HashSet::new(),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

/// Cookie-keyed table of network namespaces
///
/// Owned and mutated by the supervisor thread only. The sentinel cookie is
/// never stored; events carrying it are treated as global.
#[derive(Debug)]
pub struct NamespaceTracker {
    grace: Duration,
    table: HashMap<i64, NamespaceRecord>,
}

impl Default for NamespaceTracker {
    fn default() -> Self {
        Self::new(TOMBSTONE_GRACE)
    }
}

impl NamespaceTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            table: HashMap::new(),
        }
    }

    /// Record a namespace creation event
    pub fn created(&mut self, cookie: i64, now: Instant) {
        if cookie == NETNS_COOKIE_UNSUPPORTED {
            return;
        }
        debug!(cookie, "network namespace created");
        self.table
            .entry(cookie)
            .and_modify(|r| {
                r.state = NsState::Live;
                r.state_since = now;
            })
            .or_insert_with(|| NamespaceRecord::new(now));
    }

    /// Record a namespace destruction event
    pub fn destroyed(&mut self, cookie: i64, now: Instant) {
        if cookie == NETNS_COOKIE_UNSUPPORTED {
            return;
        }
        if let Some(record) = self.table.get_mut(&cookie) {
            debug!(cookie, "network namespace destroyed");
            record.state = NsState::Tombstoned;
            record.state_since = now;
        }
    }

    /// Filter an event sighting for `cookie` at `now`
    ///
    /// Returns `true` when the event should be dispatched. Unknown cookies are
    /// inserted live on first sighting; tombstoned cookies are still
    /// deliverable; evicted ones are not. The sentinel always passes through
    /// (the event is global).
    pub fn filter(&mut self, cookie: i64, tuner_id: u32, now: Instant) -> bool {
        if cookie == NETNS_COOKIE_UNSUPPORTED {
            return true;
        }
        let record = self
            .table
            .entry(cookie)
            .or_insert_with(|| NamespaceRecord::new(now));
        record.observers.insert(tuner_id);
        record.state != NsState::Evicted
    }

    /// Advance tombstoned records past the grace period
    pub fn sweep(&mut self, now: Instant) {
        let grace = self.grace;
        for record in self.table.values_mut() {
            if record.state == NsState::Tombstoned
                && now.duration_since(record.state_since) >= grace
            {
                record.state = NsState::Evicted;
                record.state_since = now;
            }
        }
        // Evicted records are only a tombstone of a tombstone; forget them
        // once no stale ring backlog can plausibly reference them.
        let forget_after = grace * 10;
        self.table.retain(|_, record| {
            record.state != NsState::Evicted
                || now.duration_since(record.state_since) < forget_after
        });
    }

    pub fn state(&self, cookie: i64) -> Option<NsState> {
        self.table.get(&cookie).map(|r| r.state)
    }

    pub fn record(&self, cookie: i64) -> Option<&NamespaceRecord> {
        self.table.get(&cookie)
    }

    /// Number of live (non-evicted) namespaces
    pub fn live_count(&self) -> usize {
        self.table
            .values()
            .filter(|r| r.state != NsState::Evicted)
            .count()
    }
}

/// Moves the calling thread between network namespaces
///
/// Cookie-to-file resolution scans the iproute2 runtime directory; resolved
/// paths are cached per cookie.
#[derive(Debug)]
pub struct NetnsSwitcher {
    runtime_dir: PathBuf,
    cache: HashMap<i64, PathBuf>,
}

impl Default for NetnsSwitcher {
    fn default() -> Self {
        Self::new()
    }
}

impl NetnsSwitcher {
    pub fn new() -> Self {
        Self::with_runtime_dir("/run/netns")
    }

    pub fn with_runtime_dir(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            cache: HashMap::new(),
        }
    }

    /// Enter the namespace identified by `cookie`
    ///
    /// The returned guard restores the original namespace when dropped.
    pub fn enter(&mut self, cookie: i64) -> Result<NetnsGuard, TuneError> {
        let original = open_self_netns().map_err(|reason| TuneError::NamespaceEnterFailed {
            cookie,
            reason,
        })?;
        let target = self.resolve(cookie)?;
        let target_fd =
            open_ns_file(&target).map_err(|reason| TuneError::NamespaceEnterFailed {
                cookie,
                reason,
            })?;
        set_netns(&target_fd).map_err(|reason| TuneError::NamespaceEnterFailed {
            cookie,
            reason,
        })?;
        Ok(NetnsGuard { original })
    }

    /// Find the namespace file whose cookie matches
    fn resolve(&mut self, cookie: i64) -> Result<PathBuf, TuneError> {
        if let Some(path) = self.cache.get(&cookie) {
            if path.exists() {
                return Ok(path.clone());
            }
            self.cache.remove(&cookie);
        }

        let entries =
            std::fs::read_dir(&self.runtime_dir).map_err(|e| TuneError::NamespaceEnterFailed {
                cookie,
                reason: format!("cannot list {}: {}", self.runtime_dir.display(), e),
            })?;
        for entry in entries.flatten() {
            let path = entry.path();
            match cookie_of(&path) {
                Ok(found) if found == cookie => {
                    self.cache.insert(cookie, path.clone());
                    return Ok(path);
                }
                Ok(_) => {}
                Err(reason) => debug!(path = %path.display(), reason = %reason, "skipping namespace file"),
            }
        }
        Err(TuneError::NamespaceEnterFailed {
            cookie,
            reason: "no namespace file with matching cookie".to_string(),
        })
    }
}

/// Restores the thread's original network namespace on drop
#[derive(Debug)]
pub struct NetnsGuard {
    original: OwnedFd,
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(reason) = set_netns(&self.original) {
            warn!(reason = %reason, "failed to restore original network namespace");
        }
    }
}

fn open_self_netns() -> Result<OwnedFd, String> {
    open_ns_file(Path::new("/proc/self/ns/net"))
}

fn open_ns_file(path: &Path) -> Result<OwnedFd, String> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| e.to_string())?;
    // SAFETY: cpath is a valid NUL-terminated path.
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().to_string());
    }
    // SAFETY: fd is a freshly opened, owned descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_netns(fd: &OwnedFd) -> Result<(), String> {
    // SAFETY: fd refers to an open netns file.
    let rc = unsafe { libc::setns(fd.as_raw_fd(), libc::CLONE_NEWNET) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().to_string());
    }
    Ok(())
}

/// Read the kernel-assigned cookie of the namespace behind a netns file
///
/// Requires briefly entering the namespace: the cookie is only observable via
/// `SO_NETNS_COOKIE` on a socket created inside it.
fn cookie_of(path: &Path) -> Result<i64, String> {
    let original = open_self_netns()?;
    let target = open_ns_file(path)?;
    set_netns(&target)?;
    let cookie = current_netns_cookie();
    let restore = set_netns(&original);
    restore?;
    cookie
}

fn current_netns_cookie() -> Result<i64, String> {
    // SAFETY: plain socket creation.
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return Err(std::io::Error::last_os_error().to_string());
    }
    // SAFETY: sock was just created above.
    let sock = unsafe { OwnedFd::from_raw_fd(sock) };
    let mut cookie: u64 = 0;
    let mut len = std::mem::size_of::<u64>() as libc::socklen_t;
    // SAFETY: cookie and len describe a valid out-buffer.
    let rc = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            SO_NETNS_COOKIE,
            (&mut cookie as *mut u64).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().to_string());
    }
    Ok(cookie as i64)
}
