//! Single-threaded readiness reactor
//!
//! One reactor owns an epoll instance, a slot arena of boxed readiness
//! handles, a timing wheel for idle eviction and the consumer end of a
//! wakeup channel. Handles are moved in with [`Reactor::add`] and owned
//! by the reactor until removal; callbacks reach back only through an
//! [`EventScope`], never through the reactor itself, so registration
//! changes made mid-cycle are deferred and applied between phases.
//!
//! A cycle runs wait, dispatch, deferred ops, idle sweep, dead drain.
//! Slot indices retired mid-cycle stay out of the freelist until the
//! drain, so a stale readiness report later in the same batch finds a
//! vacant slot instead of a recycled one.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use nix::sys::epoll::{EpollEvent, EpollFlags};

use netplex_core::clock::Clock;
use netplex_core::constants::{EVENT_BATCH_SIZE, MAX_CONSECUTIVE_WAIT_ERRORS};
use netplex_core::error::{ReactorError, ReactorResult, WheelError};
use netplex_core::handle::{Disposition, EventScope, ReadinessHandle, RemoveDisposition, RemoveReason};
use netplex_core::id::{HandleId, TimerId};
use netplex_core::list::{Linked, Links, ListHead};
use netplex_core::wheel::TimingWheel;
use netplex_core::{kdebug, kerror, kinfo, ktrace, kwarn};

use crate::config::ReactorConfig;
use crate::net;
use crate::poller::Poller;
use crate::wakeup::{wakeup_channel, WakeupSender};

/// Occupancy counters shared with other threads
///
/// The pool reads these for least-loaded routing; they are advisory
/// snapshots, only the owning reactor mutates them.
#[derive(Clone)]
pub struct ReactorGauges {
    inner: Arc<GaugeInner>,
}

struct GaugeInner {
    current: AtomicU32,
    max: u32,
}

impl ReactorGauges {
    fn new(max: u32) -> ReactorGauges {
        ReactorGauges {
            inner: Arc::new(GaugeInner {
                current: AtomicU32::new(0),
                max,
            }),
        }
    }

    pub fn current_handles(&self) -> u32 {
        self.inner.current.load(Ordering::Relaxed)
    }

    pub fn max_handles(&self) -> u32 {
        self.inner.max
    }

    fn inc(&self) {
        self.inner.current.fetch_add(1, Ordering::Relaxed);
    }

    fn dec(&self) {
        self.inner.current.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One arena entry; `handle.is_some()` means live
struct Slot {
    handle: Option<Box<dyn ReadinessHandle>>,
    /// Cached descriptor, for deregistration after the handle is gone
    fd: RawFd,
    timer: TimerId,
    /// Last mask applied to the poller
    interest: EpollFlags,
    /// Whether this slot counts against the public gauge
    counted: bool,
    links: Links,
}

impl Slot {
    fn vacant() -> Slot {
        Slot {
            handle: None,
            fd: -1,
            timer: TimerId::NONE,
            interest: EpollFlags::empty(),
            counted: false,
            links: Links::new(),
        }
    }
}

impl Linked for Slot {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

/// A removed handle awaiting the end-of-cycle drain
struct DeadHandle {
    id: HandleId,
    handle: Box<dyn ReadinessHandle>,
    disposition: RemoveDisposition,
}

pub struct Reactor {
    name: String,
    idle_timeout_ms: u32,
    poll_ceiling_ms: u32,
    clock: Arc<dyn Clock>,
    poller: Poller,
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Live slots in registration order
    active: ListHead,
    wheel: TimingWheel,
    gauges: ReactorGauges,
    dead: Vec<DeadHandle>,
    events: Vec<EpollEvent>,
    consecutive_wait_errors: u32,
    wakeup_sender: WakeupSender,
    wakeup_id: HandleId,
}

impl Reactor {
    pub fn new(
        name: impl Into<String>,
        config: &ReactorConfig,
        clock: Arc<dyn Clock>,
    ) -> ReactorResult<Reactor> {
        let poller = Poller::new()?;
        let (wakeup_sender, wakeup_handle) = wakeup_channel()?;
        let now = clock.now();
        let mut reactor = Reactor {
            name: name.into(),
            idle_timeout_ms: config.idle_timeout_ms,
            poll_ceiling_ms: config.poll_ceiling_ms,
            clock,
            poller,
            slots: Vec::new(),
            free: Vec::new(),
            active: ListHead::new(),
            wheel: TimingWheel::new(config.tick_ms, config.wheel_ticks, now),
            gauges: ReactorGauges::new(config.max_handles),
            dead: Vec::new(),
            events: vec![EpollEvent::empty(); EVENT_BATCH_SIZE],
            consecutive_wait_errors: 0,
            wakeup_sender,
            wakeup_id: HandleId::NONE,
        };
        reactor.wakeup_id = reactor.register(Box::new(wakeup_handle), false)?;
        kdebug!(
            "{}: created (max {} handles, {} ms ticks, {} wheel ticks)",
            reactor.name,
            config.max_handles,
            config.tick_ms,
            config.wheel_ticks
        );
        Ok(reactor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gauges(&self) -> ReactorGauges {
        self.gauges.clone()
    }

    /// Producer end of this reactor's wakeup channel
    pub fn wakeup_sender(&self) -> WakeupSender {
        self.wakeup_sender.clone()
    }

    /// Register a handle and start watching its descriptor.
    ///
    /// The reactor owns the handle until removal. Fails with
    /// [`ReactorError::AtCapacity`] at the registration ceiling, with
    /// all counters unchanged.
    pub fn add(&mut self, handle: Box<dyn ReadinessHandle>) -> ReactorResult<HandleId> {
        self.register(handle, true)
    }

    /// Re-read a handle's interest flags and apply them if they changed
    pub fn update(&mut self, id: HandleId) -> ReactorResult<()> {
        self.update_interest(id)
    }

    /// Remove a handle now, with reason `Explicit`
    pub fn remove(&mut self, id: HandleId) -> ReactorResult<()> {
        if id == self.wakeup_id {
            return Err(ReactorError::NotRegistered);
        }
        let mut scope = EventScope::new(self.clock.now());
        scope.set_handle_counts(self.gauges.current_handles(), self.gauges.max_handles());
        self.remove_with(id, RemoveReason::Explicit, &mut scope)?;
        self.apply_scope(&mut scope);
        self.drain_dead();
        Ok(())
    }

    /// Run cycles until `running` goes false or a fatal error hits,
    /// then tear every handle down
    pub fn run(&mut self, running: &AtomicBool) -> ReactorResult<()> {
        kinfo!(
            "{}: event loop starting (max {} handles)",
            self.name,
            self.gauges.max_handles()
        );
        let result = loop {
            if !running.load(Ordering::Relaxed) {
                break Ok(());
            }
            if let Err(e) = self.run_once() {
                break Err(e);
            }
        };
        self.teardown();
        match &result {
            Ok(()) => kinfo!("{}: event loop stopped", self.name),
            Err(e) => kerror!("{}: event loop failed: {}", self.name, e),
        }
        result
    }

    /// One wait/dispatch/sweep cycle
    ///
    /// Public so embedders and tests can drive the reactor without a
    /// dedicated thread.
    pub fn run_once(&mut self) -> ReactorResult<()> {
        let now = self.clock.now();
        let ceiling = (self.poll_ceiling_ms as u64).min(self.wheel.ms_until_next_expiry(now));

        let n = match self.poller.wait(&mut self.events, ceiling) {
            Ok(n) => {
                self.consecutive_wait_errors = 0;
                n
            }
            Err(e) => {
                self.consecutive_wait_errors += 1;
                kerror!(
                    "{}: wait failed ({} consecutive): {}",
                    self.name,
                    self.consecutive_wait_errors,
                    e
                );
                if self.consecutive_wait_errors >= MAX_CONSECUTIVE_WAIT_ERRORS {
                    return Err(e);
                }
                return Ok(());
            }
        };

        let mut scope = EventScope::new(self.clock.now());
        scope.set_handle_counts(self.gauges.current_handles(), self.gauges.max_handles());

        for i in 0..n {
            let (flags, token) = {
                let event = &self.events[i];
                (event.events(), event.data())
            };
            self.dispatch_event(token, flags, &mut scope);
        }

        self.apply_scope(&mut scope);

        scope.set_now(self.clock.now());
        self.sweep_idle(&mut scope);
        self.apply_scope(&mut scope);

        self.drain_dead();
        Ok(())
    }

    fn register(
        &mut self,
        handle: Box<dyn ReadinessHandle>,
        counted: bool,
    ) -> ReactorResult<HandleId> {
        if counted && self.gauges.current_handles() >= self.gauges.max_handles() {
            return Err(ReactorError::AtCapacity);
        }
        let fd = handle.raw_fd();
        let permanent = handle.is_permanent();

        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot::vacant());
                (self.slots.len() - 1) as u32
            }
        };
        let id = HandleId::new(idx);

        let mut timer = TimerId::NONE;
        if !permanent && self.idle_timeout_ms > 0 {
            let t = self.wheel.alloc(idx);
            if let Err(e) = self.wheel.insert(t, self.idle_timeout_ms, self.clock.now()) {
                self.wheel.release(t);
                self.free.push(idx);
                return Err(e.into());
            }
            timer = t;
        }

        let interest = interest_of(handle.as_ref());
        if let Err(e) = self.poller.add(fd, interest, idx as u64) {
            if timer.is_some() {
                let _ = self.wheel.remove(timer);
                self.wheel.release(timer);
            }
            self.free.push(idx);
            return Err(e);
        }

        ktrace!(
            "{}: add '{}' fd {} as {} ({:?})",
            self.name,
            handle.name(),
            fd,
            id,
            interest
        );
        {
            let slot = &mut self.slots[idx as usize];
            slot.handle = Some(handle);
            slot.fd = fd;
            slot.timer = timer;
            slot.interest = interest;
            slot.counted = counted;
        }
        self.active.push_back(&mut self.slots, idx);
        if counted {
            self.gauges.inc();
        }
        Ok(id)
    }

    fn update_interest(&mut self, id: HandleId) -> ReactorResult<()> {
        let idx = id.as_usize();
        let interest = match self.slots.get(idx).and_then(|s| s.handle.as_ref()) {
            Some(handle) => interest_of(handle.as_ref()),
            None => return Err(ReactorError::NotRegistered),
        };
        if interest == self.slots[idx].interest {
            return Ok(());
        }
        self.poller.modify(self.slots[idx].fd, interest, idx as u64)?;
        self.slots[idx].interest = interest;
        Ok(())
    }

    fn remove_with(
        &mut self,
        id: HandleId,
        reason: RemoveReason,
        scope: &mut EventScope,
    ) -> ReactorResult<()> {
        let idx = id.as_usize();
        let handle = match self.slots.get_mut(idx).and_then(|s| s.handle.take()) {
            Some(handle) => handle,
            None => return Err(ReactorError::NotRegistered),
        };
        self.finish_remove_taken(id, handle, reason, scope);
        Ok(())
    }

    /// Complete a removal whose handle is already out of its slot.
    ///
    /// Runs `on_remove` immediately; the boxed handle parks on the dead
    /// list and its slot index stays reserved until the next drain.
    fn finish_remove_taken(
        &mut self,
        id: HandleId,
        mut handle: Box<dyn ReadinessHandle>,
        reason: RemoveReason,
        scope: &mut EventScope,
    ) {
        let idx = id.as_usize();
        let fd = self.slots[idx].fd;
        if let Err(e) = self.poller.delete(fd) {
            kdebug!("{}: poller delete of fd {} failed: {}", self.name, fd, e);
        }
        self.active.remove(&mut self.slots, id.as_u32());
        let timer = self.slots[idx].timer;
        if timer.is_some() {
            if self.wheel.is_scheduled(timer) {
                let _ = self.wheel.remove(timer);
            }
            self.wheel.release(timer);
            self.slots[idx].timer = TimerId::NONE;
        }
        if self.slots[idx].counted {
            self.gauges.dec();
        }
        self.slots[idx].fd = -1;
        self.slots[idx].interest = EpollFlags::empty();
        scope.set_handle_counts(self.gauges.current_handles(), self.gauges.max_handles());

        kdebug!(
            "{}: remove '{}' fd {} ({})",
            self.name,
            handle.name(),
            fd,
            reason
        );
        let disposition = handle.on_remove(reason, scope);
        self.dead.push(DeadHandle {
            id,
            handle,
            disposition,
        });
    }

    fn dispatch_event(&mut self, token: u64, flags: EpollFlags, scope: &mut EventScope) {
        let idx = token as usize;
        // A slot retired earlier in this batch reads as vacant; its
        // index cannot have been recycled before the drain.
        let mut handle = match self.slots.get_mut(idx).and_then(|s| s.handle.take()) {
            Some(handle) => handle,
            None => {
                ktrace!("{}: stale readiness for slot {}", self.name, token);
                return;
            }
        };
        let id = HandleId::new(idx as u32);
        let fd = self.slots[idx].fd;

        let (disposition, reason) = if flags.contains(EpollFlags::EPOLLERR) {
            let errno = net::socket_error(fd);
            kdebug!(
                "{}: '{}' fd {} error: errno {}",
                self.name,
                handle.name(),
                fd,
                errno
            );
            (handle.on_error(errno, scope), RemoveReason::Error)
        } else if handle.want_accept() {
            if flags.contains(EpollFlags::EPOLLIN) {
                (handle.on_accept(scope), RemoveReason::Explicit)
            } else {
                (Disposition::Keep, RemoveReason::Explicit)
            }
        } else if handle.want_connect() {
            if flags.contains(EpollFlags::EPOLLHUP) {
                (handle.on_remote_close(scope), RemoveReason::RemoteClose)
            } else if flags.contains(EpollFlags::EPOLLIN) {
                // Readability before the connect resolves is either
                // early data or an immediate FIN.
                match net::bytes_readable(fd) {
                    Ok(0) => (handle.on_remote_close(scope), RemoveReason::RemoteClose),
                    Ok(_) => (handle.on_connect(scope), RemoveReason::Explicit),
                    Err(_) => {
                        let errno = net::socket_error(fd);
                        (handle.on_error(errno, scope), RemoveReason::Error)
                    }
                }
            } else if flags.contains(EpollFlags::EPOLLOUT) {
                (handle.on_connect(scope), RemoveReason::Explicit)
            } else {
                (Disposition::Keep, RemoveReason::Explicit)
            }
        } else if flags.contains(EpollFlags::EPOLLHUP) {
            (handle.on_remote_close(scope), RemoveReason::RemoteClose)
        } else {
            // Writable first; a Remove from the write side skips the
            // read.
            let mut verdict = Disposition::Keep;
            if flags.contains(EpollFlags::EPOLLOUT) && handle.want_write() {
                verdict = handle.on_writable(scope);
            }
            if verdict == Disposition::Keep
                && flags.contains(EpollFlags::EPOLLIN)
                && handle.want_read()
            {
                verdict = handle.on_readable(scope);
            }
            (verdict, RemoveReason::Explicit)
        };

        match disposition {
            Disposition::Keep => {
                self.slots[idx].handle = Some(handle);
                self.refresh_keep(id, scope);
            }
            Disposition::Remove => self.finish_remove_taken(id, handle, reason, scope),
        }
    }

    /// Post-callback bookkeeping for a kept handle: push the idle
    /// deadline out a full interval and re-apply interest
    fn refresh_keep(&mut self, id: HandleId, scope: &mut EventScope) {
        let idx = id.as_usize();
        let timer = self.slots[idx].timer;
        if timer.is_some() {
            match self.wheel.update(timer, self.idle_timeout_ms, scope.now()) {
                Ok(()) => {}
                Err(WheelError::Underflow) => {
                    // The fresh deadline is already behind the wheel;
                    // treat it as expired now.
                    self.fire_idle(id, scope);
                    return;
                }
                Err(e) => {
                    kwarn!("{}: timer refresh of {} failed: {}", self.name, id, e);
                    let _ = self.remove_with(id, RemoveReason::Error, scope);
                    return;
                }
            }
        }
        if let Err(e) = self.update_interest(id) {
            kwarn!("{}: interest update of {} failed: {}", self.name, id, e);
            let _ = self.remove_with(id, RemoveReason::Error, scope);
        }
    }

    /// Run `on_idle` for a handle whose timer is currently unscheduled
    fn fire_idle(&mut self, id: HandleId, scope: &mut EventScope) {
        let idx = id.as_usize();
        let mut handle = match self.slots.get_mut(idx).and_then(|s| s.handle.take()) {
            Some(handle) => handle,
            None => return,
        };
        match handle.on_idle(scope) {
            Disposition::Keep => {
                self.slots[idx].handle = Some(handle);
                let timer = self.slots[idx].timer;
                if timer.is_some() {
                    if let Err(e) = self.wheel.insert(timer, self.idle_timeout_ms, scope.now()) {
                        kwarn!("{}: idle re-arm of {} failed: {}", self.name, id, e);
                        let _ = self.remove_with(id, RemoveReason::Idle, scope);
                        return;
                    }
                }
                if let Err(e) = self.update_interest(id) {
                    kwarn!("{}: interest update of {} failed: {}", self.name, id, e);
                    let _ = self.remove_with(id, RemoveReason::Error, scope);
                }
            }
            Disposition::Remove => {
                self.finish_remove_taken(id, handle, RemoveReason::Idle, scope)
            }
        }
    }

    fn sweep_idle(&mut self, scope: &mut EventScope) {
        let now = scope.now();
        while let Some(timer) = self.wheel.next_expired(now) {
            let idx = self.wheel.token(timer);
            self.fire_idle(HandleId::new(idx), scope);
        }
    }

    /// Apply deferred scope operations until none remain
    fn apply_scope(&mut self, scope: &mut EventScope) {
        loop {
            if scope.is_empty() {
                break;
            }
            scope.set_handle_counts(self.gauges.current_handles(), self.gauges.max_handles());
            for handle in scope.take_adds() {
                let label = handle.name().to_string();
                if let Err(e) = self.register(handle, true) {
                    kwarn!("{}: deferred add of '{}' failed: {}", self.name, label, e);
                }
            }
            for id in scope.take_removes() {
                match self.remove_with(id, RemoveReason::Explicit, scope) {
                    Ok(()) => {}
                    Err(ReactorError::NotRegistered) => {
                        // Already gone; deferred removes are idempotent.
                        ktrace!("{}: deferred remove of {} skipped", self.name, id);
                    }
                    Err(e) => {
                        kwarn!("{}: deferred remove of {} failed: {}", self.name, id, e)
                    }
                }
            }
            for id in scope.take_updates() {
                if let Err(e) = self.update_interest(id) {
                    kwarn!(
                        "{}: deferred interest update of {} failed: {}",
                        self.name,
                        id,
                        e
                    );
                }
            }
        }
    }

    /// Release retired slots and dispose of their handles
    fn drain_dead(&mut self) {
        if self.dead.is_empty() {
            return;
        }
        let dead = std::mem::take(&mut self.dead);
        for entry in dead {
            self.free.push(entry.id.as_u32());
            match entry.disposition {
                RemoveDisposition::Destroy => drop(entry.handle),
                RemoveDisposition::Recycle => match entry.handle.recycler() {
                    Some(recycler) => recycler.recycle(entry.handle),
                    None => {
                        ktrace!(
                            "{}: no recycler for '{}', dropping",
                            self.name,
                            entry.handle.name()
                        );
                        drop(entry.handle);
                    }
                },
            }
        }
    }

    /// Remove every handle with reason `Teardown`, the wakeup handle
    /// last; its removal flips the channel to shutdown
    fn teardown(&mut self) {
        let mut scope = EventScope::new(self.clock.now());
        scope.set_handle_counts(self.gauges.current_handles(), self.gauges.max_handles());

        let ids: Vec<u32> = self.active.iter(&self.slots).collect();
        for raw in ids {
            let id = HandleId::new(raw);
            if id == self.wakeup_id {
                continue;
            }
            let _ = self.remove_with(id, RemoveReason::Teardown, &mut scope);
        }
        if self.wakeup_id.is_some() {
            let _ = self.remove_with(self.wakeup_id, RemoveReason::Teardown, &mut scope);
            self.wakeup_id = HandleId::NONE;
        }

        let abandoned = scope.take_adds().len();
        if abandoned > 0 {
            kdebug!(
                "{}: dropped {} deferred adds at teardown",
                self.name,
                abandoned
            );
        }
        scope.take_removes();
        scope.take_updates();
        self.drain_dead();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // No-op when `run` already tore the reactor down.
        self.teardown();
    }
}

/// Interest mask for a handle's current flags: errors always, then the
/// mode decides
fn interest_of(handle: &dyn ReadinessHandle) -> EpollFlags {
    let mut interest = EpollFlags::EPOLLERR;
    if handle.want_accept() {
        interest |= EpollFlags::EPOLLIN;
    } else if handle.want_connect() {
        interest |= EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT | EpollFlags::EPOLLHUP;
    } else {
        if handle.want_write() {
            interest |= EpollFlags::EPOLLOUT | EpollFlags::EPOLLHUP;
        }
        if handle.want_read() {
            interest |= EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP;
        }
    }
    interest
}

#[cfg(test)]
mod tests {
    use super::*;
    use netplex_core::clock::{ManualClock, MonotonicTime, SystemClock};
    use netplex_core::handle::HandleRecycler;
    use std::io::{Read as _, Write as _};
    use std::net::Ipv4Addr;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    type EventLog = Arc<Mutex<Vec<(&'static str, &'static str)>>>;

    fn log() -> EventLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &EventLog) -> Vec<(&'static str, &'static str)> {
        log.lock().unwrap().clone()
    }

    struct Probe {
        tag: &'static str,
        stream: UnixStream,
        log: EventLog,
        on_read: Disposition,
        on_idle_verdict: Disposition,
    }

    impl Probe {
        fn new(tag: &'static str, stream: UnixStream, log: EventLog) -> Probe {
            stream.set_nonblocking(true).unwrap();
            Probe {
                tag,
                stream,
                log,
                on_read: Disposition::Keep,
                on_idle_verdict: Disposition::Remove,
            }
        }

        fn note(&self, what: &'static str) {
            self.log.lock().unwrap().push((self.tag, what));
        }
    }

    impl ReadinessHandle for Probe {
        fn name(&self) -> &str {
            self.tag
        }

        fn raw_fd(&self) -> RawFd {
            self.stream.as_raw_fd()
        }

        fn want_read(&self) -> bool {
            true
        }

        fn on_readable(&mut self, _scope: &mut EventScope) -> Disposition {
            let mut buf = [0u8; 64];
            let _ = self.stream.read(&mut buf);
            self.note("read");
            self.on_read
        }

        fn on_remote_close(&mut self, _scope: &mut EventScope) -> Disposition {
            self.note("close");
            Disposition::Remove
        }

        fn on_error(&mut self, _errno: i32, _scope: &mut EventScope) -> Disposition {
            self.note("error");
            Disposition::Remove
        }

        fn on_idle(&mut self, _scope: &mut EventScope) -> Disposition {
            self.note("idle");
            self.on_idle_verdict
        }

        fn on_remove(&mut self, reason: RemoveReason, _scope: &mut EventScope) -> RemoveDisposition {
            self.note(match reason {
                RemoveReason::Explicit => "remove:explicit",
                RemoveReason::Idle => "remove:idle",
                RemoveReason::Error => "remove:error",
                RemoveReason::RemoteClose => "remove:close",
                RemoveReason::Teardown => "remove:teardown",
            });
            RemoveDisposition::Destroy
        }
    }

    fn quiet_config() -> ReactorConfig {
        ReactorConfig::new()
            .reactors(1)
            .max_handles(8)
            .idle_timeout_ms(0)
            .tick_ms(10)
            .wheel_ticks(64)
            .poll_ceiling_ms(50)
    }

    fn manual_reactor(config: &ReactorConfig) -> (Reactor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(MonotonicTime::ZERO));
        let reactor = Reactor::new("r-test", config, clock.clone()).unwrap();
        (reactor, clock)
    }

    #[test]
    fn test_add_then_capacity_then_reuse() {
        let config = quiet_config().max_handles(2);
        let (mut reactor, _clock) = manual_reactor(&config);
        let log = log();

        let (_peer1, s1) = UnixStream::pair().unwrap();
        let (_peer2, s2) = UnixStream::pair().unwrap();
        let (_peer3, s3) = UnixStream::pair().unwrap();

        let id1 = reactor.add(Box::new(Probe::new("p1", s1, log.clone()))).unwrap();
        let _id2 = reactor.add(Box::new(Probe::new("p2", s2, log.clone()))).unwrap();
        assert_eq!(reactor.gauges().current_handles(), 2);

        let err = reactor
            .add(Box::new(Probe::new("p3", s3, log.clone())))
            .unwrap_err();
        assert_eq!(err, ReactorError::AtCapacity);
        assert_eq!(reactor.gauges().current_handles(), 2);

        reactor.remove(id1).unwrap();
        assert_eq!(reactor.gauges().current_handles(), 1);
        assert!(entries(&log).contains(&("p1", "remove:explicit")));
        assert_eq!(reactor.remove(id1).unwrap_err(), ReactorError::NotRegistered);

        let (_peer4, s4) = UnixStream::pair().unwrap();
        reactor.add(Box::new(Probe::new("p4", s4, log.clone()))).unwrap();
        assert_eq!(reactor.gauges().current_handles(), 2);
    }

    #[test]
    fn test_readable_dispatch_keeps_handle() {
        let (mut reactor, _clock) = manual_reactor(&quiet_config());
        let log = log();

        let (mut peer, stream) = UnixStream::pair().unwrap();
        reactor
            .add(Box::new(Probe::new("p", stream, log.clone())))
            .unwrap();

        peer.write_all(b"x").unwrap();
        reactor.run_once().unwrap();

        assert_eq!(entries(&log), vec![("p", "read")]);
        assert_eq!(reactor.gauges().current_handles(), 1);
    }

    #[test]
    fn test_remove_verdict_evicts_handle() {
        let (mut reactor, _clock) = manual_reactor(&quiet_config());
        let log = log();

        let (mut peer, stream) = UnixStream::pair().unwrap();
        let mut probe = Probe::new("p", stream, log.clone());
        probe.on_read = Disposition::Remove;
        reactor.add(Box::new(probe)).unwrap();

        peer.write_all(b"x").unwrap();
        reactor.run_once().unwrap();

        assert_eq!(entries(&log), vec![("p", "read"), ("p", "remove:explicit")]);
        assert_eq!(reactor.gauges().current_handles(), 0);
    }

    #[test]
    fn test_peer_close_dispatches_remote_close() {
        let (mut reactor, _clock) = manual_reactor(&quiet_config());
        let log = log();

        let (peer, stream) = UnixStream::pair().unwrap();
        reactor
            .add(Box::new(Probe::new("p", stream, log.clone())))
            .unwrap();

        drop(peer);
        reactor.run_once().unwrap();

        assert_eq!(entries(&log), vec![("p", "close"), ("p", "remove:close")]);
        assert_eq!(reactor.gauges().current_handles(), 0);
    }

    #[test]
    fn test_idle_sweep_evicts_quiet_handles() {
        let config = quiet_config().idle_timeout_ms(50);
        let (mut reactor, clock) = manual_reactor(&config);
        let log = log();

        let (_peer1, s1) = UnixStream::pair().unwrap();
        let (_peer2, s2) = UnixStream::pair().unwrap();
        reactor.add(Box::new(Probe::new("p1", s1, log.clone()))).unwrap();
        reactor.add(Box::new(Probe::new("p2", s2, log.clone()))).unwrap();

        clock.advance_millis(60);
        reactor.run_once().unwrap();

        let seen = entries(&log);
        assert!(seen.contains(&("p1", "idle")));
        assert!(seen.contains(&("p1", "remove:idle")));
        assert!(seen.contains(&("p2", "idle")));
        assert!(seen.contains(&("p2", "remove:idle")));
        assert_eq!(reactor.gauges().current_handles(), 0);
    }

    #[test]
    fn test_idle_keep_rearms_full_interval() {
        let config = quiet_config().idle_timeout_ms(50);
        let (mut reactor, clock) = manual_reactor(&config);
        let log = log();

        let (_peer, stream) = UnixStream::pair().unwrap();
        let mut probe = Probe::new("p", stream, log.clone());
        probe.on_idle_verdict = Disposition::Keep;
        reactor.add(Box::new(probe)).unwrap();

        clock.advance_millis(60);
        reactor.run_once().unwrap();
        assert_eq!(entries(&log), vec![("p", "idle")]);
        assert_eq!(reactor.gauges().current_handles(), 1);

        clock.advance_millis(60);
        reactor.run_once().unwrap();
        assert_eq!(entries(&log), vec![("p", "idle"), ("p", "idle")]);
        assert_eq!(reactor.gauges().current_handles(), 1);
    }

    #[test]
    fn test_activity_pushes_idle_deadline_out() {
        let config = quiet_config().idle_timeout_ms(50);
        let (mut reactor, clock) = manual_reactor(&config);
        let log = log();

        let (mut peer, stream) = UnixStream::pair().unwrap();
        reactor
            .add(Box::new(Probe::new("p", stream, log.clone())))
            .unwrap();

        // Activity at 40ms refreshes the deadline to 90ms.
        clock.advance_millis(40);
        peer.write_all(b"x").unwrap();
        reactor.run_once().unwrap();
        assert_eq!(entries(&log), vec![("p", "read")]);

        // 80ms: the original deadline has passed, the refreshed one
        // has not.
        clock.advance_millis(40);
        reactor.run_once().unwrap();
        assert_eq!(entries(&log), vec![("p", "read")]);
        assert_eq!(reactor.gauges().current_handles(), 1);

        clock.advance_millis(15);
        reactor.run_once().unwrap();
        let seen = entries(&log);
        assert!(seen.contains(&("p", "idle")));
        assert!(seen.contains(&("p", "remove:idle")));
        assert_eq!(reactor.gauges().current_handles(), 0);
    }

    struct ScopeProbe {
        stream: UnixStream,
        log: EventLog,
        victim: HandleId,
        spawn: Option<UnixStream>,
    }

    impl ReadinessHandle for ScopeProbe {
        fn name(&self) -> &str {
            "scoped"
        }

        fn raw_fd(&self) -> RawFd {
            self.stream.as_raw_fd()
        }

        fn want_read(&self) -> bool {
            true
        }

        fn on_readable(&mut self, scope: &mut EventScope) -> Disposition {
            let mut buf = [0u8; 64];
            let _ = self.stream.read(&mut buf);
            self.log.lock().unwrap().push(("scoped", "read"));
            scope.remove(self.victim);
            if let Some(stream) = self.spawn.take() {
                scope.add(Box::new(Probe::new("spawned", stream, self.log.clone())));
            }
            Disposition::Keep
        }
    }

    #[test]
    fn test_deferred_scope_ops_apply_after_dispatch() {
        let (mut reactor, _clock) = manual_reactor(&quiet_config());
        let log = log();

        let (_peer_b, sb) = UnixStream::pair().unwrap();
        let victim = reactor
            .add(Box::new(Probe::new("victim", sb, log.clone())))
            .unwrap();

        let (mut peer_a, sa) = UnixStream::pair().unwrap();
        sa.set_nonblocking(true).unwrap();
        let (mut peer_c, sc) = UnixStream::pair().unwrap();
        reactor
            .add(Box::new(ScopeProbe {
                stream: sa,
                log: log.clone(),
                victim,
                spawn: Some(sc),
            }))
            .unwrap();
        assert_eq!(reactor.gauges().current_handles(), 2);

        peer_a.write_all(b"x").unwrap();
        reactor.run_once().unwrap();

        let seen = entries(&log);
        assert!(seen.contains(&("scoped", "read")));
        assert!(seen.contains(&("victim", "remove:explicit")));
        // Victim gone, spawned handle in: still two.
        assert_eq!(reactor.gauges().current_handles(), 2);

        peer_c.write_all(b"y").unwrap();
        reactor.run_once().unwrap();
        assert!(entries(&log).contains(&("spawned", "read")));
    }

    #[test]
    fn test_stale_event_hits_vacant_slot() {
        let (mut reactor, _clock) = manual_reactor(&quiet_config());
        let log = log();

        let (_peer, stream) = UnixStream::pair().unwrap();
        reactor
            .add(Box::new(Probe::new("p", stream, log.clone())))
            .unwrap();

        let mut scope = EventScope::new(MonotonicTime::ZERO);
        reactor.dispatch_event(99, EpollFlags::EPOLLIN, &mut scope);

        assert!(entries(&log).is_empty());
        assert_eq!(reactor.gauges().current_handles(), 1);
    }

    #[test]
    fn test_update_interest_paths() {
        let (mut reactor, _clock) = manual_reactor(&quiet_config());
        let log = log();

        let (_peer, stream) = UnixStream::pair().unwrap();
        let id = reactor
            .add(Box::new(Probe::new("p", stream, log.clone())))
            .unwrap();

        // Unchanged mask is a no-op; unknown ids are rejected.
        reactor.update(id).unwrap();
        assert_eq!(
            reactor.update(HandleId::new(77)).unwrap_err(),
            ReactorError::NotRegistered
        );
    }

    struct Bin {
        names: Mutex<Vec<String>>,
    }

    impl HandleRecycler for Bin {
        fn recycle(&self, handle: Box<dyn ReadinessHandle>) {
            self.names.lock().unwrap().push(handle.name().to_string());
        }
    }

    struct Pooled {
        stream: UnixStream,
        bin: Arc<Bin>,
    }

    impl ReadinessHandle for Pooled {
        fn name(&self) -> &str {
            "pooled"
        }

        fn raw_fd(&self) -> RawFd {
            self.stream.as_raw_fd()
        }

        fn want_read(&self) -> bool {
            true
        }

        fn on_remove(&mut self, _reason: RemoveReason, _scope: &mut EventScope) -> RemoveDisposition {
            RemoveDisposition::Recycle
        }

        fn recycler(&self) -> Option<Arc<dyn HandleRecycler>> {
            Some(self.bin.clone())
        }
    }

    #[test]
    fn test_recycle_disposition_reaches_recycler() {
        let (mut reactor, _clock) = manual_reactor(&quiet_config());
        let bin = Arc::new(Bin {
            names: Mutex::new(Vec::new()),
        });

        let (_peer, stream) = UnixStream::pair().unwrap();
        stream.set_nonblocking(true).unwrap();
        let id = reactor
            .add(Box::new(Pooled {
                stream,
                bin: bin.clone(),
            }))
            .unwrap();

        reactor.remove(id).unwrap();
        assert_eq!(*bin.names.lock().unwrap(), vec!["pooled".to_string()]);
    }

    struct Dialer {
        stream: net::Stream,
        log: EventLog,
        connected: bool,
    }

    impl ReadinessHandle for Dialer {
        fn name(&self) -> &str {
            "dialer"
        }

        fn raw_fd(&self) -> RawFd {
            self.stream.fd()
        }

        fn want_connect(&self) -> bool {
            !self.connected
        }

        fn want_read(&self) -> bool {
            self.connected
        }

        fn on_connect(&mut self, _scope: &mut EventScope) -> Disposition {
            self.connected = true;
            self.log.lock().unwrap().push(("dialer", "connect"));
            Disposition::Keep
        }

        fn on_readable(&mut self, _scope: &mut EventScope) -> Disposition {
            let mut buf = [0u8; 64];
            let _ = self.stream.read(&mut buf);
            self.log.lock().unwrap().push(("dialer", "read"));
            Disposition::Keep
        }

        fn on_error(&mut self, _errno: i32, _scope: &mut EventScope) -> Disposition {
            self.log.lock().unwrap().push(("dialer", "error"));
            Disposition::Remove
        }

        fn on_remote_close(&mut self, _scope: &mut EventScope) -> Disposition {
            self.log.lock().unwrap().push(("dialer", "close"));
            Disposition::Remove
        }

        fn on_remove(&mut self, _reason: RemoveReason, _scope: &mut EventScope) -> RemoveDisposition {
            self.log.lock().unwrap().push(("dialer", "remove"));
            RemoveDisposition::Destroy
        }
    }

    fn run_until(reactor: &mut Reactor, log: &EventLog, what: (&'static str, &'static str)) {
        for _ in 0..100 {
            reactor.run_once().unwrap();
            if entries(log).contains(&what) {
                return;
            }
        }
        panic!("never saw {:?}; log: {:?}", what, entries(log));
    }

    #[test]
    fn test_connect_resolves_to_on_connect() {
        let config = quiet_config();
        let clock = Arc::new(SystemClock::new());
        let mut reactor = Reactor::new("r-test", &config, clock).unwrap();
        let log = log();

        let listener = net::Listener::bind(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
        let port = listener.local_port().unwrap();
        let stream = net::Stream::connect(Ipv4Addr::LOCALHOST, port).unwrap();
        reactor
            .add(Box::new(Dialer {
                stream,
                log: log.clone(),
                connected: false,
            }))
            .unwrap();

        run_until(&mut reactor, &log, ("dialer", "connect"));

        // After the mode flip the handle reads like any other.
        let server = listener.accept().unwrap().unwrap();
        server.write(b"hi").unwrap();
        run_until(&mut reactor, &log, ("dialer", "read"));
    }

    #[test]
    fn test_refused_connect_dispatches_error() {
        let config = quiet_config();
        let clock = Arc::new(SystemClock::new());
        let mut reactor = Reactor::new("r-test", &config, clock).unwrap();
        let log = log();

        // Bind, learn the port, then free it again.
        let port = {
            let listener = net::Listener::bind(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
            listener.local_port().unwrap()
        };
        let stream = net::Stream::connect(Ipv4Addr::LOCALHOST, port).unwrap();
        reactor
            .add(Box::new(Dialer {
                stream,
                log: log.clone(),
                connected: false,
            }))
            .unwrap();

        run_until(&mut reactor, &log, ("dialer", "error"));
        assert!(entries(&log).contains(&("dialer", "remove")));
        assert_eq!(reactor.gauges().current_handles(), 0);
    }

    #[test]
    fn test_command_runs_on_reactor_thread() {
        let config = quiet_config();
        let clock = Arc::new(SystemClock::new());
        let mut reactor = Reactor::new("r-test", &config, clock).unwrap();
        let sender = reactor.wakeup_sender();

        let running = Arc::new(AtomicBool::new(true));
        let run_flag = running.clone();
        let worker = thread::spawn(move || reactor.run(&run_flag));
        let reactor_thread = worker.thread().id();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        sender
            .push(crate::wakeup::Command::new("whoami", move |_scope| {
                seen_in.lock().unwrap().push(thread::current().id());
            }))
            .unwrap();

        for _ in 0..2_000 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        running.store(false, Ordering::SeqCst);
        let _ = sender.push(crate::wakeup::Command::new("stop-wake", |_scope| {}));
        worker.join().unwrap().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], reactor_thread);

        // Channel is shut down with the reactor.
        assert!(sender
            .push(crate::wakeup::Command::new("late", |_scope| {}))
            .is_err());
    }

    #[test]
    fn test_run_with_cleared_flag_tears_down() {
        let (mut reactor, _clock) = manual_reactor(&quiet_config());
        let log = log();

        let (_p1, s1) = UnixStream::pair().unwrap();
        let (_p2, s2) = UnixStream::pair().unwrap();
        reactor.add(Box::new(Probe::new("p1", s1, log.clone()))).unwrap();
        reactor.add(Box::new(Probe::new("p2", s2, log.clone()))).unwrap();

        let running = AtomicBool::new(false);
        reactor.run(&running).unwrap();

        let seen = entries(&log);
        assert!(seen.contains(&("p1", "remove:teardown")));
        assert!(seen.contains(&("p2", "remove:teardown")));
        assert_eq!(reactor.gauges().current_handles(), 0);
    }
}
