//! # netplex - Readiness-Driven I/O Reactor
//!
//! Single-threaded epoll event loops with O(1) idle eviction, scaled
//! out as a pool of independent reactors.
//!
//! ## Features
//!
//! - **Readiness dispatch**: one [`ReadinessHandle`] per endpoint;
//!   callbacks decide Keep or Remove, the reactor owns the rest
//! - **O(1) idle eviction**: a flat timing wheel tracks one deadline
//!   per handle; any activity pushes it a full interval out
//! - **Cross-thread commands**: an eventfd-backed channel hands
//!   closures to a reactor from any thread
//! - **Pool scaling**: N reactors on named threads, least-loaded
//!   routing for new handles
//!
//! ## Quick Start
//!
//! ```ignore
//! use netplex::{Netplex, ReactorConfig};
//! use std::net::Ipv4Addr;
//!
//! fn main() {
//!     let config = ReactorConfig::from_env();
//!     let mut netplex = Netplex::new(config).unwrap();
//!     netplex.start().unwrap();
//!
//!     // One handle per accepted connection, built by the factory.
//!     let port = netplex
//!         .listen(Ipv4Addr::UNSPECIFIED, 7, Box::new(|stream| {
//!             Box::new(MyConnection::new(stream))
//!         }))
//!         .unwrap();
//!     println!("listening on {}", port);
//!
//!     // ... run until a signal flips your own flag ...
//!     netplex.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        User Code                            │
//! │         ReadinessHandle impls, Netplex, Acceptor            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Reactor Pool                           │
//! │         least-loaded routing, named threads, stop           │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ Reactor 0 │      │ Reactor 1 │      │ Reactor N │
//!    │ epoll     │      │ epoll     │      │ epoll     │
//!    │ wheel     │      │ wheel     │      │ wheel     │
//!    │ wakeup fd │      │ wakeup fd │      │ wakeup fd │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```

// Re-export core types
pub use netplex_core::{
    Clock, Disposition, EventScope, HandleId, HandleRecycler, ManualClock, MonotonicTime,
    ReactorError, ReactorResult, ReadinessHandle, RemoveDisposition, RemoveReason, SystemClock,
    TimerId, TimingWheel, WheelError,
};
pub use netplex_core::constants;

// Re-export kprint macros for logging
pub use netplex_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use netplex_core::kprint::{
    init as init_logging, set_flush_enabled, set_log_level, set_time_enabled, LogLevel,
};

// Re-export env utilities
pub use netplex_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use netplex_reactor::{
    wakeup_channel, Acceptor, Command, ConfigError, ConnectionFactory, IoOutcome, Listener,
    Reactor, ReactorConfig, ReactorGauges, ReactorPool, Stream, WakeupSender,
};

use std::net::Ipv4Addr;
use std::sync::Arc;

/// Lifecycle wrapper around a validated config and a running pool
///
/// `new` validates, `start` spins the reactors up, `stop` (or drop)
/// tears everything down.
pub struct Netplex {
    config: ReactorConfig,
    pool: Option<ReactorPool>,
}

impl Netplex {
    /// Validate `config` and wrap it; no threads start yet
    pub fn new(config: ReactorConfig) -> Result<Netplex, ConfigError> {
        config.validate()?;
        Ok(Netplex { config, pool: None })
    }

    /// Build the pool and spawn its reactor threads; a second call is
    /// a no-op
    pub fn start(&mut self) -> ReactorResult<()> {
        if self.pool.is_some() {
            return Ok(());
        }
        let mut pool = ReactorPool::new(&self.config, Arc::new(SystemClock::new()))?;
        pool.start()?;
        self.pool = Some(pool);
        Ok(())
    }

    /// Route a handle to the least-loaded reactor
    pub fn add(&self, handle: Box<dyn ReadinessHandle>) -> ReactorResult<()> {
        match &self.pool {
            Some(pool) => pool.add(handle),
            None => Err(ReactorError::Shutdown),
        }
    }

    /// Bind `addr:port` and register an acceptor for it.
    ///
    /// Returns the bound port, which differs from `port` when 0 was
    /// passed. The factory builds one handle per accepted connection.
    pub fn listen(
        &self,
        addr: Ipv4Addr,
        port: u16,
        factory: ConnectionFactory,
    ) -> ReactorResult<u16> {
        let listener = Listener::bind(addr, port, self.config.listen_backlog)?;
        let bound = listener.local_port()?;
        let acceptor = Acceptor::new(format!("acceptor-{}", bound), listener, factory);
        self.add(Box::new(acceptor))?;
        kinfo!("netplex: listening on {}:{}", addr, bound);
        Ok(bound)
    }

    /// Handles registered across all reactors
    pub fn total_handles(&self) -> u32 {
        self.pool
            .as_ref()
            .map(|pool| pool.total_handles())
            .unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_some()
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    /// Stop and join every reactor; idempotent
    pub fn stop(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.stop();
        }
    }
}

impl Drop for Netplex {
    fn drop(&mut self) {
        self.stop();
    }
}
