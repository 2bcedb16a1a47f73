//! # netplex-core
//!
//! Core types for the netplex reactor: the timing wheel, the
//! readiness-handle contract, arena ids and the clock seam.
//!
//! This crate contains no OS-specific code beyond the `RawFd` type in the
//! handle contract. The poller, the reactor loop and the socket plumbing
//! live in `netplex-reactor`.
//!
//! ## Modules
//!
//! - `id` - Handle and timer identifier types (arena indices)
//! - `clock` - Monotonic time source, production and manual test clocks
//! - `list` - Intrusive doubly-linked lists over arena indices
//! - `wheel` - O(1) flat timing wheel for idle-timeout eviction
//! - `handle` - Readiness-handle contract and callback context
//! - `error` - Error types
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

#![allow(dead_code)]

pub mod id;
pub mod clock;
pub mod list;
pub mod wheel;
pub mod handle;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{HandleId, TimerId};
pub use clock::{Clock, ManualClock, MonotonicTime, SystemClock};
pub use wheel::TimingWheel;
pub use handle::{
    Disposition, EventScope, HandleRecycler, ReadinessHandle, RemoveDisposition, RemoveReason,
};
pub use error::{ReactorError, ReactorResult, WheelError};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Shared constants and defaults
pub mod constants {
    /// Default per-reactor handle limit
    pub const DEFAULT_MAX_HANDLES: u32 = 16_384;

    /// Default idle timeout before quiet handles are evicted
    pub const DEFAULT_IDLE_TIMEOUT_MS: u32 = 30_000;

    /// Default timing-wheel tick width
    pub const DEFAULT_TICK_MS: u32 = 100;

    /// Default timing-wheel size. The horizon (tick * size) must clear
    /// the idle timeout with room for scheduling drift.
    pub const DEFAULT_WHEEL_TICKS: u32 = 512;

    /// Default upper bound for a single readiness wait
    pub const DEFAULT_POLL_CEILING_MS: u32 = 1_000;

    /// Default listen backlog for the net plumbing
    pub const DEFAULT_LISTEN_BACKLOG: i32 = 1_024;

    /// Fallback reactor count when the CPU count cannot be read
    pub const DEFAULT_REACTORS: u32 = 2;

    /// Consecutive wait failures tolerated before a reactor loop aborts
    pub const MAX_CONSECUTIVE_WAIT_ERRORS: u32 = 10;

    /// Readiness events drained per wait call
    pub const EVENT_BATCH_SIZE: usize = 1_024;
}
