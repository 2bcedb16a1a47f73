//! Readiness-handle contract
//!
//! Everything a reactor multiplexes - listeners, connections, the wakeup
//! channel - implements [`ReadinessHandle`]. The reactor owns the boxed
//! handle for the whole registration, asks it which events it wants, and
//! dispatches readiness through the callbacks below. Each event callback
//! answers with a [`Disposition`]: stay registered or leave.
//!
//! Callbacks never touch the reactor directly. They get an [`EventScope`]
//! instead, which carries the cycle timestamp and collects deferred
//! registration changes the reactor applies once the dispatch phase is
//! over. That keeps callback code free of re-entrancy hazards: an accept
//! callback can queue three new connections without the handle table
//! shifting under its feet.

use core::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::clock::MonotonicTime;
use crate::id::HandleId;

/// What the reactor does with a handle after an event callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stay registered. Interest flags are re-read and the idle timer
    /// refreshed.
    Keep,

    /// Unregister now. `on_remove` runs before the cycle ends.
    Remove,
}

/// Why a handle is leaving the reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    /// A callback returned [`Disposition::Remove`], or a caller asked
    Explicit,

    /// Idle timeout expired
    Idle,

    /// Removed after an error report
    Error,

    /// Removed after the peer closed
    RemoteClose,

    /// Reactor shutting down
    Teardown,
}

impl fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoveReason::Explicit => write!(f, "explicit"),
            RemoveReason::Idle => write!(f, "idle"),
            RemoveReason::Error => write!(f, "error"),
            RemoveReason::RemoteClose => write!(f, "remote close"),
            RemoveReason::Teardown => write!(f, "teardown"),
        }
    }
}

/// What happens to the boxed handle after `on_remove`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveDisposition {
    /// Drop the box at the end of the cycle
    Destroy,

    /// Hand the box to the handle's [`HandleRecycler`] at the end of
    /// the cycle
    Recycle,
}

/// Receives handles whose `on_remove` chose [`RemoveDisposition::Recycle`]
///
/// Connection pools implement this to reuse handle allocations. A handle
/// with no recycler is dropped even when it asks to be recycled.
pub trait HandleRecycler: Send + Sync {
    fn recycle(&self, handle: Box<dyn ReadinessHandle>);
}

/// Callback contract between a reactor and one registered endpoint
///
/// **Contract:**
/// - Every callback runs on the owning reactor's thread; handles need no
///   internal synchronization.
/// - Callbacks must not block. Accept/read/write until the OS reports
///   would-block, then return.
/// - `want_*` flags are re-read after every callback that returns
///   [`Disposition::Keep`]; changing them is how a handle switches from
///   read to write interest.
/// - `raw_fd()` must stay valid and fixed for the whole registration.
/// - `on_remove` runs exactly once per registration, whatever the reason.
pub trait ReadinessHandle: Send {
    /// Short label for log lines
    fn name(&self) -> &str;

    /// Descriptor the reactor registers with the poller
    fn raw_fd(&self) -> RawFd;

    /// Listening endpoint: readable means connections are pending
    fn want_accept(&self) -> bool {
        false
    }

    /// Connect in progress: writability (or early data) decides the
    /// outcome
    fn want_connect(&self) -> bool {
        false
    }

    /// Established endpoint wants readable events
    fn want_read(&self) -> bool {
        false
    }

    /// Established endpoint wants writable events
    fn want_write(&self) -> bool {
        false
    }

    /// Permanent handles are never idle-evicted and carry no idle timer
    fn is_permanent(&self) -> bool {
        false
    }

    /// Connections pending. Accept until would-block; queue the accepted
    /// handles through [`EventScope::add`].
    fn on_accept(&mut self, scope: &mut EventScope) -> Disposition {
        let _ = scope;
        Disposition::Remove
    }

    /// Connect attempt resolved successfully
    fn on_connect(&mut self, scope: &mut EventScope) -> Disposition {
        let _ = scope;
        Disposition::Remove
    }

    /// Descriptor readable
    fn on_readable(&mut self, scope: &mut EventScope) -> Disposition {
        let _ = scope;
        Disposition::Remove
    }

    /// Descriptor writable
    fn on_writable(&mut self, scope: &mut EventScope) -> Disposition {
        let _ = scope;
        Disposition::Remove
    }

    /// Error condition reported for the descriptor. `errno` is the
    /// socket's SO_ERROR, zero when none could be fetched.
    fn on_error(&mut self, errno: i32, scope: &mut EventScope) -> Disposition {
        let _ = (errno, scope);
        Disposition::Remove
    }

    /// Peer closed, or a connecting endpoint woke readable with nothing
    /// to read
    fn on_remote_close(&mut self, scope: &mut EventScope) -> Disposition {
        let _ = scope;
        Disposition::Remove
    }

    /// Idle timeout expired without readiness activity. `Keep` schedules
    /// a fresh full idle interval.
    fn on_idle(&mut self, scope: &mut EventScope) -> Disposition {
        let _ = scope;
        Disposition::Remove
    }

    /// Leaving the reactor. Runs in the same cycle as the removal; the
    /// box stays alive until the cycle's dead-handle drain.
    fn on_remove(&mut self, reason: RemoveReason, scope: &mut EventScope) -> RemoveDisposition {
        let _ = (reason, scope);
        RemoveDisposition::Destroy
    }

    /// Recycler consulted when `on_remove` answers `Recycle`
    fn recycler(&self) -> Option<Arc<dyn HandleRecycler>> {
        None
    }
}

/// Per-callback context
///
/// Built by the reactor once per cycle phase. Deferred registration
/// changes collected here are applied after the dispatch phase; the
/// `take_*` accessors are reactor plumbing.
pub struct EventScope {
    now: MonotonicTime,
    current_handles: u32,
    max_handles: u32,
    adds: Vec<Box<dyn ReadinessHandle>>,
    removes: Vec<HandleId>,
    updates: Vec<HandleId>,
}

impl EventScope {
    pub fn new(now: MonotonicTime) -> Self {
        EventScope {
            now,
            current_handles: 0,
            max_handles: 0,
            adds: Vec::new(),
            removes: Vec::new(),
            updates: Vec::new(),
        }
    }

    /// Timestamp of the current cycle phase. Cheaper than a clock read
    /// and stable across one dispatch batch.
    #[inline]
    pub fn now(&self) -> MonotonicTime {
        self.now
    }

    /// Handles registered on this reactor right now
    #[inline]
    pub fn current_handles(&self) -> u32 {
        self.current_handles
    }

    /// Registration limit of this reactor
    #[inline]
    pub fn max_handles(&self) -> u32 {
        self.max_handles
    }

    /// Queue a handle for registration after the dispatch phase
    pub fn add(&mut self, handle: Box<dyn ReadinessHandle>) {
        self.adds.push(handle);
    }

    /// Queue a registered handle for removal after the dispatch phase
    pub fn remove(&mut self, id: HandleId) {
        self.removes.push(id);
    }

    /// Queue an interest-mask refresh after the dispatch phase
    pub fn update(&mut self, id: HandleId) {
        self.updates.push(id);
    }

    /// Reactor plumbing: refresh the phase timestamp
    pub fn set_now(&mut self, now: MonotonicTime) {
        self.now = now;
    }

    /// Reactor plumbing: refresh the gauge snapshot
    pub fn set_handle_counts(&mut self, current: u32, max: u32) {
        self.current_handles = current;
        self.max_handles = max;
    }

    /// Reactor plumbing: drain queued additions
    pub fn take_adds(&mut self) -> Vec<Box<dyn ReadinessHandle>> {
        std::mem::take(&mut self.adds)
    }

    /// Reactor plumbing: drain queued removals
    pub fn take_removes(&mut self) -> Vec<HandleId> {
        std::mem::take(&mut self.removes)
    }

    /// Reactor plumbing: drain queued interest refreshes
    pub fn take_updates(&mut self) -> Vec<HandleId> {
        std::mem::take(&mut self.updates)
    }

    /// True when no deferred work is queued
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty() && self.updates.is_empty()
    }
}
