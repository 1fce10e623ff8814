use super::slot::SlotSpace;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    /// Delay at or beyond the wheel horizon. Misusing the wheel is a
    /// programming error; callers with constant delays may unwrap.
    #[error("delay {delay:?} outside wheel horizon {horizon:?}")]
    InvalidDelay { delay: Duration, horizon: Duration },
}

/// Cancellation key for a scheduled entry.
///
/// Encodes the slot, the index within the slot, and a per-entry sequence
/// number. The sequence number is the identity check: after the entry fires
/// (or its index is reused), cancellation with a stale handle fails instead
/// of removing somebody else's entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    slot: u32,
    index: u32,
    seq: u64,
}

struct Entry<T> {
    seq: u64,
    value: T,
}

/// Hashed timing wheel: a circular array of slots, each a [`SlotSpace`].
///
/// `slot_count * tick` is the horizon; delays must be shorter than it.
/// Readiness is collected by [`tick`](Self::tick) into an internal list and
/// handed out by [`take_ready`](Self::take_ready); the wheel never invokes
/// anything itself, so the caller decides how firing interleaves with other
/// work.
pub struct TimingWheel<T> {
    tick: Duration,
    slots: Vec<SlotSpace<Entry<T>>>,
    cursor: usize,
    next_tick_at: Instant,
    last_seen: Instant,
    len: usize,
    next_seq: u64,
    ready: Vec<T>,
}

impl<T> TimingWheel<T> {
    pub fn new(now: Instant, tick: Duration, slot_count: usize) -> Self {
        assert!(!tick.is_zero(), "tick duration must be non-zero");
        assert!(slot_count > 0, "wheel must have at least one slot");
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, SlotSpace::new);
        Self {
            tick,
            slots,
            cursor: 0,
            next_tick_at: now + tick,
            last_seen: now,
            len: 0,
            next_seq: 0,
            ready: Vec::new(),
        }
    }

    /// Total delay range: `tick * slot_count`.
    pub fn horizon(&self) -> Duration {
        self.tick * self.slots.len() as u32
    }

    /// Number of scheduled entries not yet ready.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Schedules `value` to become ready after `delay`, rounded up to the
    /// next tick boundary.
    pub fn add(&mut self, now: Instant, delay: Duration, value: T) -> Result<TimerHandle, TimerError> {
        self.advance(now);

        let due = now + delay;
        // Ticks past the next boundary; anything due before it fires on the
        // next tick.
        let ticks = if due <= self.next_tick_at {
            0
        } else {
            (due - self.next_tick_at).as_nanos() as u64 / self.tick.as_nanos() as u64 + 1
        } as usize;
        // Delays within one tick of the horizon can round onto the cursor
        // slot and fire a whole rotation early; reject those too.
        if delay >= self.horizon() || ticks >= self.slots.len() {
            return Err(TimerError::InvalidDelay {
                delay,
                horizon: self.horizon(),
            });
        }
        let slot = (self.cursor + ticks) % self.slots.len();

        let seq = self.next_seq;
        self.next_seq += 1;
        let index = self.slots[slot].insert(Entry { seq, value });
        self.len += 1;
        Ok(TimerHandle {
            slot: slot as u32,
            index: index as u32,
            seq,
        })
    }

    /// Cancels a scheduled entry, returning its value, or `None` if the
    /// entry already fired (or was already cancelled).
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        let entry = slot.remove_if(handle.index as usize, |e| e.seq == handle.seq)?;
        self.len -= 1;
        Some(entry.value)
    }

    /// Rotates the wheel up to `now`, moving due entries to the ready list.
    /// Returns how many entries became ready.
    pub fn tick(&mut self, now: Instant) -> usize {
        let before = self.ready.len();
        self.advance(now);
        self.ready.len() - before
    }

    /// Takes everything collected as ready so far.
    pub fn take_ready(&mut self) -> Vec<T> {
        std::mem::take(&mut self.ready)
    }

    /// Time until the next slot boundary; zero if it already passed.
    pub fn next_tick_in(&self, now: Instant) -> Duration {
        self.next_tick_at.saturating_duration_since(now)
    }

    /// Detaches every unexpired entry, leaving the wheel empty.
    pub fn clear(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        for slot in &mut self.slots {
            values.extend(std::mem::take(slot).into_iter().map(|e| e.value));
        }
        self.len = 0;
        values
    }

    fn advance(&mut self, now: Instant) {
        // A jump past the whole horizon (process suspended) or a clock that
        // went backwards would make slot-by-slot rotation meaningless: every
        // slot is due, or tick accounting is broken. Drain everything at
        // once and restart the cadence from `now`. Precise ordering is
        // deliberately given up in this degenerate case.
        if now < self.last_seen
            || now.saturating_duration_since(self.next_tick_at) >= self.horizon()
        {
            let drained = self.clear();
            self.ready.extend(drained);
            self.cursor = 0;
            self.next_tick_at = now + self.tick;
            self.last_seen = now;
            return;
        }
        self.last_seen = now;

        while now >= self.next_tick_at {
            let due = std::mem::take(&mut self.slots[self.cursor]);
            self.len -= due.len();
            self.ready.extend(due.into_iter().map(|e| e.value));
            self.cursor = (self.cursor + 1) % self.slots.len();
            self.next_tick_at += self.tick;
        }
    }
}
