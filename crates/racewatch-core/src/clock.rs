//! Vector clocks: the happens-before bookkeeping primitive.
//!
//! A [`VectorClock`] maps thread identity to a monotonically increasing tick.
//! Missing entries read as zero, so a clock observed before a thread's first
//! event compares as "before everything that thread has done".

use ahash::AHashMap;

use crate::thread_state::ThreadId;

/// A per-thread-indexed tuple of ticks summarizing an event's happens-before
/// past.
///
/// Invariant: for any live thread `t` that owns this clock, `V[t]` is
/// strictly monotonic across calls to [`VectorClock::tick`]. Entries for
/// threads other than the owner only ever grow via [`VectorClock::join`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    ticks: AHashMap<ThreadId, u64>,
}

impl VectorClock {
    /// A new clock with all components implicitly zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read thread `t`'s component. Threads never observed default to 0.
    pub fn get(&self, t: ThreadId) -> u64 {
        self.ticks.get(&t).copied().unwrap_or(0)
    }

    /// Increment `V[t]` by one and return the new value.
    ///
    /// This is the only operation that advances a thread's own component; it
    /// is what keeps the monotonicity invariant for the owning thread.
    pub fn tick(&mut self, t: ThreadId) -> u64 {
        let entry = self.ticks.entry(t).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Pointwise max: `self[x] <- max(self[x], other[x])` for every `x`.
    pub fn join(&mut self, other: &VectorClock) {
        for (&t, &v) in &other.ticks {
            let entry = self.ticks.entry(t).or_insert(0);
            if v > *entry {
                *entry = v;
            }
        }
    }

    /// `self <= other` iff every component of `self` is `<=` the matching
    /// component of `other`. Missing components read as zero on both sides.
    pub fn leq(&self, other: &VectorClock) -> bool {
        self.ticks.iter().all(|(&t, &v)| v <= other.get(t))
            && other
                .ticks
                .iter()
                .all(|(&t, _)| self.get(t) <= other.get(t))
    }

    /// Two clocks are concurrent iff neither `leq`s the other.
    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        !self.leq(other) && !other.leq(self)
    }

    /// Ensure `V[t] >= v`, without touching any other component. Used to
    /// fold a handful of discrete `(thread, tick)` observations into one
    /// summary clock (the shadow memory's many-readers fallback), not for
    /// advancing a thread's own working clock.
    pub fn observe(&mut self, t: ThreadId, v: u64) {
        let entry = self.ticks.entry(t).or_insert(0);
        if v > *entry {
            *entry = v;
        }
    }

    /// Cheap, fully independent copy — used whenever a clock value needs to
    /// be captured and outlive the structure it was read from (installed into
    /// a `SyncObject`'s release clock, stamped onto an `AccessRecord`, etc).
    pub fn snapshot(&self) -> VectorClock {
        self.clone()
    }
}
