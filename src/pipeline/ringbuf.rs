//! Fixed-capacity slot ring for stage hand-off

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::atomic::AtomicCell;
use crossbeam::utils::CachePadded;

use crate::error::{Error, Result};

/// Smallest ring able to hold a three-field deinterlace window
pub const MIN_CAPACITY: usize = 3;

/// Returned by [`SlotRing::push`] when the producer slot is still pending.
/// Carries the rejected value back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull<T>(pub T);

impl<T> fmt::Display for RingFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ring slot still filled")
    }
}

struct Slot<T> {
    filled: AtomicBool,
    value: AtomicCell<Option<T>>,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicUsize,
    popped: AtomicUsize,
    rejected: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub pushed: usize,
    pub popped: usize,
    pub rejected: usize,
}

/// Single-producer single-consumer ring of `filled` slots.
///
/// A producer never advances onto a slot whose `filled` flag is set; it is
/// told the ring is full and retries on its next cycle. The flag is the only
/// synchronization between the two sides.
pub struct SlotRing<T: Copy> {
    slots: Box<[Slot<T>]>,
    /// Producer cursor
    head: CachePadded<AtomicUsize>,
    /// Consumer cursor
    tail: CachePadded<AtomicUsize>,
    stats: CachePadded<Stats>,
}

impl<T: Copy> SlotRing<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < MIN_CAPACITY {
            return Err(Error::InvalidArgument(format!(
                "ring capacity {capacity} is below {MIN_CAPACITY}"
            )));
        }
        let slots = (0..capacity)
            .map(|_| Slot {
                filled: AtomicBool::new(false),
                value: AtomicCell::new(None),
            })
            .collect();
        Ok(Self {
            slots,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            stats: CachePadded::new(Stats::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index the next push will land in, if that slot is free.
    pub fn producer_slot(&self) -> Option<usize> {
        let idx = self.head.load(Ordering::Relaxed);
        (!self.slots[idx].filled.load(Ordering::Acquire)).then_some(idx)
    }

    /// Producer: fill the slot at the producer cursor and advance.
    pub fn push(&self, value: T) -> Result<usize, RingFull<T>> {
        let idx = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[idx];
        if slot.filled.load(Ordering::Acquire) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(RingFull(value));
        }
        slot.value.store(Some(value));
        slot.filled.store(true, Ordering::Release);
        self.head.store(self.next(idx), Ordering::Relaxed);
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(idx)
    }

    /// Consumer: look at the slot under the consumer cursor without taking it.
    pub fn peek(&self) -> Option<(usize, T)> {
        let idx = self.tail.load(Ordering::Relaxed);
        self.load_filled(idx).map(|v| (idx, v))
    }

    /// Consumer: the `k` consecutive slots starting at the consumer cursor,
    /// oldest first, if every one of them is filled.
    pub fn peek_window(&self, k: usize) -> Option<Vec<(usize, T)>> {
        if k == 0 || k > self.capacity() {
            return None;
        }
        let mut idx = self.tail.load(Ordering::Relaxed);
        let mut window = Vec::with_capacity(k);
        for _ in 0..k {
            window.push((idx, self.load_filled(idx)?));
            idx = self.next(idx);
        }
        Some(window)
    }

    /// Consumer: take the slot under the consumer cursor, clear it, advance.
    pub fn pop(&self) -> Option<(usize, T)> {
        let idx = self.tail.load(Ordering::Relaxed);
        let slot = &self.slots[idx];
        let value = self.load_filled(idx)?;
        slot.value.store(None);
        slot.filled.store(false, Ordering::Release);
        self.tail.store(self.next(idx), Ordering::Relaxed);
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some((idx, value))
    }

    pub fn is_filled(&self, idx: usize) -> bool {
        self.slots
            .get(idx)
            .is_some_and(|s| s.filled.load(Ordering::Acquire))
    }

    /// Number of filled slots
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.filled.load(Ordering::Acquire))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop everything still pending. Only valid once both sides are stopped.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some((_, v)) = self.pop() {
            out.push(v);
        }
        out
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }

    fn load_filled(&self, idx: usize) -> Option<T> {
        let slot = &self.slots[idx];
        if slot.filled.load(Ordering::Acquire) {
            slot.value.load()
        } else {
            None
        }
    }

    fn next(&self, idx: usize) -> usize {
        (idx + 1) % self.slots.len()
    }
}

impl<T: Copy> fmt::Debug for SlotRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotRing")
            .field("capacity", &self.capacity())
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .field("filled", &self.len())
            .finish()
    }
}
