//! Reactor pool
//!
//! `config.reactors` reactors, each on its own named thread, sharing
//! one run flag. Handles enter through [`ReactorPool::add`], which
//! routes to the reactor with the fewest registrations at that moment
//! and defers the registration through that reactor's wakeup channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use netplex_core::clock::Clock;
use netplex_core::error::{ReactorError, ReactorResult};
use netplex_core::handle::ReadinessHandle;
use netplex_core::{kerror, kinfo, ktrace};

use crate::config::ReactorConfig;
use crate::reactor::{Reactor, ReactorGauges};
use crate::wakeup::{Command, WakeupSender};

struct Lane {
    name: String,
    sender: WakeupSender,
    gauges: ReactorGauges,
    /// Present until `start` moves the reactor onto its thread
    reactor: Option<Reactor>,
}

pub struct ReactorPool {
    running: Arc<AtomicBool>,
    lanes: Vec<Lane>,
    threads: Vec<JoinHandle<ReactorResult<()>>>,
}

impl ReactorPool {
    /// Build the reactors without starting any threads.
    ///
    /// `config` must already have passed [`ReactorConfig::validate`].
    pub fn new(config: &ReactorConfig, clock: Arc<dyn Clock>) -> ReactorResult<ReactorPool> {
        debug_assert!(config.validate().is_ok(), "unvalidated pool config");
        let mut lanes = Vec::with_capacity(config.reactors as usize);
        for i in 0..config.reactors {
            let name = format!("reactor-{}", i);
            let reactor = Reactor::new(name.clone(), config, Arc::clone(&clock))?;
            lanes.push(Lane {
                sender: reactor.wakeup_sender(),
                gauges: reactor.gauges(),
                reactor: Some(reactor),
                name,
            });
        }
        Ok(ReactorPool {
            running: Arc::new(AtomicBool::new(false)),
            lanes,
            threads: Vec::new(),
        })
    }

    /// Spawn one named thread per reactor; a second call is a no-op
    pub fn start(&mut self) -> ReactorResult<()> {
        if !self.threads.is_empty() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        for lane in &mut self.lanes {
            let mut reactor = match lane.reactor.take() {
                Some(reactor) => reactor,
                None => continue,
            };
            let running = Arc::clone(&self.running);
            let thread = thread::Builder::new()
                .name(format!("netplex-{}", lane.name))
                .spawn(move || reactor.run(&running))
                .map_err(|e| ReactorError::Os(e.raw_os_error().unwrap_or(libc::EAGAIN)))?;
            self.threads.push(thread);
        }
        kinfo!("pool: started {} reactors", self.threads.len());
        Ok(())
    }

    /// Route a handle to the least-loaded reactor.
    ///
    /// Registration is deferred through the target's wakeup channel;
    /// gauges reflect it once that reactor's next cycle runs.
    pub fn add(&self, handle: Box<dyn ReadinessHandle>) -> ReactorResult<()> {
        let lane = self
            .lanes
            .iter()
            .min_by_key(|lane| lane.gauges.current_handles())
            .ok_or(ReactorError::Shutdown)?;
        ktrace!("pool: routing '{}' to {}", handle.name(), lane.name);
        lane.sender.push(Command::new("pool-add", move |scope| {
            scope.add(handle);
        }))
    }

    /// Clear the run flag, wake every reactor and join; idempotent
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if self.threads.is_empty() {
            return;
        }
        // A no-op command kicks each reactor out of its wait; a lane
        // that already shut down rejects the push, which is fine.
        for lane in &self.lanes {
            let _ = lane.sender.push(Command::new("stop-wake", |_scope| {}));
        }
        for thread in self.threads.drain(..) {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => kerror!("pool: reactor exited with error: {}", e),
                Err(_) => kerror!("pool: reactor thread panicked"),
            }
        }
        kinfo!("pool: stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn reactors(&self) -> usize {
        self.lanes.len()
    }

    /// Sum of the per-reactor handle gauges
    pub fn total_handles(&self) -> u32 {
        self.lanes
            .iter()
            .map(|lane| lane.gauges.current_handles())
            .sum()
    }

    pub fn gauges(&self) -> Vec<ReactorGauges> {
        self.lanes.iter().map(|lane| lane.gauges.clone()).collect()
    }

    /// Wakeup sender for one lane, for callers that need a fixed target
    pub fn wakeup_sender(&self, lane: usize) -> Option<WakeupSender> {
        self.lanes.get(lane).map(|lane| lane.sender.clone())
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netplex_core::clock::SystemClock;
    use netplex_core::handle::{EventScope, RemoveDisposition, RemoveReason};
    use std::os::fd::{AsRawFd, RawFd};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Quiet {
        stream: UnixStream,
        removed: Arc<AtomicU32>,
    }

    impl Quiet {
        fn new(stream: UnixStream, removed: Arc<AtomicU32>) -> Quiet {
            stream.set_nonblocking(true).unwrap();
            Quiet { stream, removed }
        }
    }

    impl ReadinessHandle for Quiet {
        fn name(&self) -> &str {
            "quiet"
        }

        fn raw_fd(&self) -> RawFd {
            self.stream.as_raw_fd()
        }

        fn want_read(&self) -> bool {
            true
        }

        fn on_remove(&mut self, _reason: RemoveReason, _scope: &mut EventScope) -> RemoveDisposition {
            self.removed.fetch_add(1, Ordering::SeqCst);
            RemoveDisposition::Destroy
        }
    }

    fn small_config(reactors: u32) -> ReactorConfig {
        ReactorConfig::new()
            .reactors(reactors)
            .max_handles(8)
            .idle_timeout_ms(0)
            .tick_ms(10)
            .wheel_ticks(64)
            .poll_ceiling_ms(20)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..2_000 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for pool state");
    }

    #[test]
    fn test_start_stop_idempotent() {
        let mut pool = ReactorPool::new(&small_config(2), Arc::new(SystemClock::new())).unwrap();
        assert_eq!(pool.reactors(), 2);
        assert!(!pool.is_running());

        pool.start().unwrap();
        assert!(pool.is_running());
        pool.start().unwrap();

        pool.stop();
        assert!(!pool.is_running());
        pool.stop();
    }

    #[test]
    fn test_least_loaded_routing_spreads_handles() {
        let mut pool = ReactorPool::new(&small_config(2), Arc::new(SystemClock::new())).unwrap();
        pool.start().unwrap();
        let removed = Arc::new(AtomicU32::new(0));

        let mut peers = Vec::new();
        for i in 0..4u32 {
            let (peer, stream) = UnixStream::pair().unwrap();
            peers.push(peer);
            pool.add(Box::new(Quiet::new(stream, removed.clone()))).unwrap();
            // Let each registration land so the next routing decision
            // sees it.
            wait_until(|| pool.total_handles() == i + 1);
        }

        let gauges = pool.gauges();
        assert_eq!(gauges.len(), 2);
        assert_eq!(gauges[0].current_handles(), 2);
        assert_eq!(gauges[1].current_handles(), 2);

        pool.stop();
        assert_eq!(removed.load(Ordering::SeqCst), 4);
        assert_eq!(pool.total_handles(), 0);
    }

    #[test]
    fn test_add_after_stop_fails() {
        let mut pool = ReactorPool::new(&small_config(1), Arc::new(SystemClock::new())).unwrap();
        pool.start().unwrap();
        pool.stop();

        let removed = Arc::new(AtomicU32::new(0));
        let (_peer, stream) = UnixStream::pair().unwrap();
        let err = pool
            .add(Box::new(Quiet::new(stream, removed)))
            .unwrap_err();
        assert_eq!(err, ReactorError::Shutdown);
    }
}
