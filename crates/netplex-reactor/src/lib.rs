//! # netplex-reactor
//!
//! Linux runtime for the netplex reactor: the epoll event loop, the
//! eventfd wakeup channel, nonblocking TCP plumbing and the reactor
//! pool.
//!
//! Modules:
//! - `config`: pool configuration from defaults, env and builder
//! - `poller`: thin level-triggered epoll wrapper
//! - `wakeup`: cross-thread command channel (mutex FIFO + eventfd)
//! - `net`: nonblocking TCP sockets and the acceptor handle
//! - `reactor`: the single-threaded event loop
//! - `pool`: N reactors on named threads with least-loaded routing

#![allow(dead_code)]

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod config;
        pub mod net;
        pub mod poller;
        pub mod pool;
        pub mod reactor;
        pub mod wakeup;

        pub use config::{ConfigError, ReactorConfig};
        pub use net::{Acceptor, ConnectionFactory, IoOutcome, Listener, Stream};
        pub use poller::Poller;
        pub use pool::ReactorPool;
        pub use reactor::{Reactor, ReactorGauges};
        pub use wakeup::{wakeup_channel, Command, WakeupHandle, WakeupSender};
    } else {
        compile_error!("netplex-reactor requires Linux (epoll and eventfd)");
    }
}
