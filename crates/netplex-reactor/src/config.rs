//! Reactor pool configuration
//!
//! Defaults come from [`netplex_core::constants`]; `from_env` layers
//! `NPX_*` variables on top, and the fluent setters layer programmatic
//! overrides on top of that. Always run [`ReactorConfig::validate`]
//! before handing a config to a pool.

use std::fmt;

use netplex_core::constants::{
    DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_LISTEN_BACKLOG, DEFAULT_MAX_HANDLES, DEFAULT_POLL_CEILING_MS,
    DEFAULT_REACTORS, DEFAULT_TICK_MS, DEFAULT_WHEEL_TICKS,
};
use netplex_core::env::{env_get, env_get_bool};
use netplex_core::kprintln;

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Reactor threads in the pool
    pub reactors: u32,
    /// Registration ceiling per reactor
    pub max_handles: u32,
    /// Idle eviction deadline; 0 disables eviction
    pub idle_timeout_ms: u32,
    /// Timing wheel tick width
    pub tick_ms: u32,
    /// Timing wheel bucket count
    pub wheel_ticks: u32,
    /// Longest single readiness wait
    pub poll_ceiling_ms: u32,
    /// Backlog for listeners created by this process
    pub listen_backlog: i32,
    /// Set TCP_NODELAY on accepted connections
    pub tcp_nodelay: bool,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            reactors: detected_reactors(),
            max_handles: DEFAULT_MAX_HANDLES,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            tick_ms: DEFAULT_TICK_MS,
            wheel_ticks: DEFAULT_WHEEL_TICKS,
            poll_ceiling_ms: DEFAULT_POLL_CEILING_MS,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            tcp_nodelay: false,
        }
    }
}

/// One reactor per available core, capped at the compiled default times 4
fn detected_reactors() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(DEFAULT_REACTORS);
    cores.min(DEFAULT_REACTORS * 4)
}

impl ReactorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from `NPX_*` environment variables
    pub fn from_env() -> Self {
        let base = Self::default();
        ReactorConfig {
            reactors: env_get("NPX_REACTORS", base.reactors),
            max_handles: env_get("NPX_MAX_HANDLES", base.max_handles),
            idle_timeout_ms: env_get("NPX_IDLE_TIMEOUT_MS", base.idle_timeout_ms),
            tick_ms: env_get("NPX_TICK_MS", base.tick_ms),
            wheel_ticks: env_get("NPX_WHEEL_TICKS", base.wheel_ticks),
            poll_ceiling_ms: env_get("NPX_POLL_CEILING_MS", base.poll_ceiling_ms),
            listen_backlog: env_get("NPX_LISTEN_BACKLOG", base.listen_backlog),
            tcp_nodelay: env_get_bool("NPX_TCP_NODELAY", base.tcp_nodelay),
        }
    }

    pub fn reactors(mut self, reactors: u32) -> Self {
        self.reactors = reactors;
        self
    }

    pub fn max_handles(mut self, max_handles: u32) -> Self {
        self.max_handles = max_handles;
        self
    }

    pub fn idle_timeout_ms(mut self, idle_timeout_ms: u32) -> Self {
        self.idle_timeout_ms = idle_timeout_ms;
        self
    }

    pub fn tick_ms(mut self, tick_ms: u32) -> Self {
        self.tick_ms = tick_ms;
        self
    }

    pub fn wheel_ticks(mut self, wheel_ticks: u32) -> Self {
        self.wheel_ticks = wheel_ticks;
        self
    }

    pub fn poll_ceiling_ms(mut self, poll_ceiling_ms: u32) -> Self {
        self.poll_ceiling_ms = poll_ceiling_ms;
        self
    }

    pub fn listen_backlog(mut self, listen_backlog: i32) -> Self {
        self.listen_backlog = listen_backlog;
        self
    }

    pub fn tcp_nodelay(mut self, tcp_nodelay: bool) -> Self {
        self.tcp_nodelay = tcp_nodelay;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reactors == 0 {
            return Err(ConfigError::InvalidValue("reactors must be > 0"));
        }
        if self.max_handles == 0 {
            return Err(ConfigError::InvalidValue("max_handles must be > 0"));
        }
        if self.tick_ms == 0 {
            return Err(ConfigError::InvalidValue("tick_ms must be > 0"));
        }
        if self.wheel_ticks < 2 {
            return Err(ConfigError::InvalidValue("wheel_ticks must be >= 2"));
        }
        if self.poll_ceiling_ms == 0 {
            return Err(ConfigError::InvalidValue("poll_ceiling_ms must be > 0"));
        }
        if self.listen_backlog <= 0 {
            return Err(ConfigError::InvalidValue("listen_backlog must be > 0"));
        }
        if self.idle_timeout_ms > 0 {
            if self.idle_timeout_ms < self.tick_ms {
                return Err(ConfigError::InvalidValue(
                    "idle_timeout_ms must cover at least one tick",
                ));
            }
            // The deadline must stay schedulable even when the wheel
            // lags a full poll ceiling behind the clock.
            let horizon_ms = self.tick_ms as u64 * (self.wheel_ticks as u64 - 1);
            if self.idle_timeout_ms as u64 + self.poll_ceiling_ms as u64 >= horizon_ms {
                return Err(ConfigError::InvalidValue(
                    "wheel horizon must exceed idle_timeout_ms plus poll_ceiling_ms",
                ));
            }
        }
        Ok(())
    }

    /// Dump the effective configuration
    pub fn print(&self) {
        kprintln!("reactor configuration:");
        kprintln!("  reactors:        {}", self.reactors);
        kprintln!("  max_handles:     {}", self.max_handles);
        kprintln!("  idle_timeout_ms: {}", self.idle_timeout_ms);
        kprintln!("  tick_ms:         {}", self.tick_ms);
        kprintln!("  wheel_ticks:     {}", self.wheel_ticks);
        kprintln!("  poll_ceiling_ms: {}", self.poll_ceiling_ms);
        kprintln!("  listen_backlog:  {}", self.listen_backlog);
        kprintln!("  tcp_nodelay:     {}", self.tcp_nodelay);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
