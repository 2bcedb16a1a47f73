//! Flat timing wheel for idle-timeout eviction
//!
//! A fixed ring of `max_ticks` buckets, each `tick_ms` wide. A timer lives
//! in the bucket of its absolute target tick; insert, update, remove and
//! expiry-pop are all O(1). The trade for that is a hard horizon: a delay
//! must land strictly between the wheel's current tick and
//! `current_tick + max_ticks`, and the wheel reports [`WheelError`] rather
//! than clamp a delay that does not fit.
//!
//! `current_tick` advances only by draining through [`TimingWheel::next_expired`],
//! one expired timer per call. While every live target sits inside the open
//! window `(current_tick, current_tick + max_ticks)`, bucket residues are
//! unique, so bucket membership alone identifies a timer's tick.
//!
//! Timers are arena slots owned by the wheel. Callers allocate a slot with
//! a `token` payload (the reactor stores the owning handle id there), keep
//! the [`TimerId`], and release the slot when the owner goes away.

use crate::clock::MonotonicTime;
use crate::error::WheelError;
use crate::id::TimerId;
use crate::list::{Linked, Links, ListHead};

/// Tick value meaning "not in any bucket"
const TICK_NONE: u64 = u64::MAX;

/// One timer slot in the wheel's arena
#[derive(Debug, Clone, Copy)]
struct Timer {
    /// Absolute tick of residence, TICK_NONE when unscheduled
    tick: u64,

    /// Bucket linkage
    links: Links,

    /// Caller payload, reported back through [`TimingWheel::token`]
    token: u32,
}

impl Linked for Timer {
    fn links(&self) -> &Links {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

/// O(1) flat timing wheel
#[derive(Debug)]
pub struct TimingWheel {
    tick_ms: u32,
    max_ticks: u32,
    start: MonotonicTime,
    current_tick: u64,
    buckets: Vec<ListHead>,
    timers: Vec<Timer>,
    free: Vec<TimerId>,
    scheduled: u32,
}

impl TimingWheel {
    /// Create a wheel with `max_ticks` buckets of `tick_ms` milliseconds,
    /// with tick 0 anchored at `start`
    pub fn new(tick_ms: u32, max_ticks: u32, start: MonotonicTime) -> Self {
        assert!(tick_ms >= 1, "tick_ms must be at least 1");
        assert!(max_ticks >= 2, "max_ticks must be at least 2");
        TimingWheel {
            tick_ms,
            max_ticks,
            start,
            current_tick: 0,
            buckets: vec![ListHead::new(); max_ticks as usize],
            timers: Vec::new(),
            free: Vec::new(),
            scheduled: 0,
        }
    }

    /// Allocate an unscheduled timer slot carrying `token`
    pub fn alloc(&mut self, token: u32) -> TimerId {
        if let Some(id) = self.free.pop() {
            let timer = &mut self.timers[id.as_usize()];
            debug_assert_eq!(timer.tick, TICK_NONE);
            timer.token = token;
            id
        } else {
            let id = TimerId::new(self.timers.len() as u32);
            self.timers.push(Timer {
                tick: TICK_NONE,
                links: Links::new(),
                token,
            });
            id
        }
    }

    /// Return a timer slot to the free pool. The timer must be unscheduled.
    pub fn release(&mut self, id: TimerId) {
        debug_assert_eq!(
            self.timers[id.as_usize()].tick,
            TICK_NONE,
            "release of a scheduled timer"
        );
        self.free.push(id);
    }

    /// Payload stored at allocation
    pub fn token(&self, id: TimerId) -> u32 {
        self.timers[id.as_usize()].token
    }

    /// Schedule an unscheduled timer `delay_ms` from `now`
    pub fn insert(
        &mut self,
        id: TimerId,
        delay_ms: u32,
        now: MonotonicTime,
    ) -> Result<(), WheelError> {
        if self.timers[id.as_usize()].tick != TICK_NONE {
            return Err(WheelError::AlreadyScheduled);
        }
        let target = self.ticks_since_start(now) + delay_ms as u64 / self.tick_ms as u64;
        self.insert_at(id, target)
    }

    /// Reschedule a timer `delay_ms` from `now`
    ///
    /// An unscheduled timer is plain-inserted. A timer whose new target is
    /// its current tick stays put (no bucket traffic). A new target at or
    /// behind `current_tick` detaches the timer and fails `Underflow`; the
    /// caller must treat it as having expired now.
    pub fn update(
        &mut self,
        id: TimerId,
        delay_ms: u32,
        now: MonotonicTime,
    ) -> Result<(), WheelError> {
        let old_tick = self.timers[id.as_usize()].tick;
        let target = self.ticks_since_start(now) + delay_ms as u64 / self.tick_ms as u64;
        if old_tick == TICK_NONE {
            return self.insert_at(id, target);
        }
        if target == old_tick {
            return Ok(());
        }
        // Detach first; on a range failure the timer stays unscheduled.
        self.detach(id, old_tick);
        self.insert_at(id, target)
    }

    /// Unschedule a timer
    pub fn remove(&mut self, id: TimerId) -> Result<(), WheelError> {
        let tick = self.timers[id.as_usize()].tick;
        if tick == TICK_NONE {
            return Err(WheelError::NotScheduled);
        }
        self.detach(id, tick);
        Ok(())
    }

    /// Pop one expired timer, advancing `current_tick` as buckets drain
    ///
    /// Returns `None` once nothing at or before `now`'s tick remains. Each
    /// call returns at most one timer so the caller can interleave expiry
    /// handling (which may insert or remove other timers) with draining.
    pub fn next_expired(&mut self, now: MonotonicTime) -> Option<TimerId> {
        let now_tick = self.ticks_since_start(now);
        while self.current_tick < now_tick {
            let tick = self.current_tick + 1;
            let bucket = (tick % self.max_ticks as u64) as usize;
            match self.buckets[bucket].pop_front(&mut self.timers) {
                Some(raw) => {
                    self.timers[raw as usize].tick = TICK_NONE;
                    self.scheduled -= 1;
                    if self.buckets[bucket].is_empty() {
                        self.current_tick = tick;
                    }
                    return Some(TimerId::new(raw));
                }
                None => {
                    self.current_tick = tick;
                }
            }
        }
        None
    }

    /// Whether the timer currently sits in a bucket
    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.timers[id.as_usize()].tick != TICK_NONE
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    pub fn tick_ms(&self) -> u32 {
        self.tick_ms
    }

    /// Number of timers currently scheduled
    pub fn scheduled_len(&self) -> usize {
        self.scheduled as usize
    }

    /// Largest delay guaranteed schedulable from a caught-up wheel
    pub fn max_delay_ms(&self) -> u64 {
        self.tick_ms as u64 * (self.max_ticks as u64 - 1)
    }

    /// Milliseconds until the earliest scheduled timer expires
    ///
    /// Zero when something is already expired, the full wheel horizon when
    /// nothing is scheduled. This is the reactor's poll-ceiling input, so
    /// it rounds up: sleeping the returned amount never overshoots an
    /// expiry by more than the rounding.
    pub fn ms_until_next_expiry(&self, now: MonotonicTime) -> u64 {
        if self.scheduled == 0 {
            return self.tick_ms as u64 * self.max_ticks as u64;
        }
        let mut next = None;
        for k in 1..=self.max_ticks as u64 {
            let tick = self.current_tick + k;
            if !self.buckets[(tick % self.max_ticks as u64) as usize].is_empty() {
                next = Some(tick);
                break;
            }
        }
        // scheduled > 0 guarantees some bucket is non-empty
        let tick = match next {
            Some(t) => t,
            None => return 0,
        };
        let target_micros = tick * self.tick_ms as u64 * 1_000;
        let elapsed_micros = now.micros_since(self.start);
        target_micros.saturating_sub(elapsed_micros).div_ceil(1_000)
    }

    /// Tick containing `now`. Each component truncates on its own:
    /// whole seconds contribute `secs * 1000 / tick_ms` and the sub-second
    /// remainder `micros / 1000 / tick_ms`.
    fn ticks_since_start(&self, now: MonotonicTime) -> u64 {
        let elapsed = now.micros_since(self.start);
        let secs = elapsed / 1_000_000;
        let micros = elapsed % 1_000_000;
        let tick = self.tick_ms as u64;
        secs * 1_000 / tick + micros / 1_000 / tick
    }

    fn insert_at(&mut self, id: TimerId, target: u64) -> Result<(), WheelError> {
        if target <= self.current_tick {
            return Err(WheelError::Underflow);
        }
        if target >= self.current_tick + self.max_ticks as u64 {
            return Err(WheelError::Overflow);
        }
        let bucket = (target % self.max_ticks as u64) as usize;
        self.timers[id.as_usize()].tick = target;
        self.buckets[bucket].push_back(&mut self.timers, id.as_u32());
        self.scheduled += 1;
        Ok(())
    }

    fn detach(&mut self, id: TimerId, tick: u64) {
        let bucket = (tick % self.max_ticks as u64) as usize;
        self.buckets[bucket].remove(&mut self.timers, id.as_u32());
        self.timers[id.as_usize()].tick = TICK_NONE;
        self.scheduled -= 1;
    }
}
