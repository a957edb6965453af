//! Per-thread state: the data an application thread owns exclusively between
//! `fork` and `join`.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::clock::VectorClock;

/// Opaque integer identity assigned at `fork`, stable for the thread's life,
/// released at `join`.
pub type ThreadId = u32;

/// Default capacity of the inline shadow-call-stack before it spills to the
/// heap. Matches the teacher-stack depth most real call chains stay within.
const SHADOW_STACK_INLINE: usize = 16;

/// Default number of buffered memory references before a flush is forced.
/// The instrumenter is expected to query this via [`EventIngest::CAPACITY`]
/// rather than hard-coding it — see module docs on the control block.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// One buffered memory reference, as appended by inline instrumentation code.
///
/// `stack` is a snapshot of the shadow call stack taken at the moment of the
/// access, not at flush time — buffering can delay `process_buffer` well
/// past any `func_exit` calls that follow the access, so the live shadow
/// stack at flush time would no longer match what the instrumenter actually
/// saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRef {
    pub addr: u64,
    pub pc: u64,
    pub size: u8,
    pub is_write: bool,
    pub stack: SmallVec<[u64; SHADOW_STACK_INLINE]>,
}

/// The per-thread control block the instrumenter reads at fixed, documented
/// offsets from inline code: a `{buf_ptr, buf_end, control_word}` triple.
///
/// This crate does not generate inline code, so there is no pointer pair to
/// expose; instead the buffer lives behind [`ThreadState::event_buffer`] and
/// [`EventIngest`] documents the equivalent control-word semantics an
/// instrumenter-side implementation would mirror at fixed offsets.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlWord(u64);

impl ControlWord {
    const DISABLED_BIT: u64 = 1 << 63;
    const BUDGET_MASK: u64 = 0xFFFF_FFFF;

    pub fn new(sampling_budget: u32, disabled: bool) -> Self {
        let mut word = sampling_budget as u64 & Self::BUDGET_MASK;
        if disabled {
            word |= Self::DISABLED_BIT;
        }
        ControlWord(word)
    }

    pub fn disabled(self) -> bool {
        self.0 & Self::DISABLED_BIT != 0
    }

    pub fn sampling_budget(self) -> u32 {
        (self.0 & Self::BUDGET_MASK) as u32
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        if disabled {
            self.0 |= Self::DISABLED_BIT;
        } else {
            self.0 &= !Self::DISABLED_BIT;
        }
    }

    pub fn set_sampling_budget(&mut self, budget: u32) {
        self.0 = (self.0 & Self::DISABLED_BIT) | (budget as u64 & Self::BUDGET_MASK);
    }
}

/// Contract the instrumenter uses to batch-submit memory references.
///
/// `EventIngest` is a documentation anchor, not a struct: the constants below
/// are what an inline-code generator needs to agree on with this crate so
/// that "buffer full" can be tested without calling back into Rust for every
/// access.
pub struct EventIngest;

impl EventIngest {
    /// Number of `MemRef` slots per thread before `process_buffer` is forced.
    pub const CAPACITY: usize = DEFAULT_BUFFER_CAPACITY;
    /// Bit layout: bit 63 marks the thread disabled (`ENTER_EXCLUDE`); the
    /// low 32 bits hold the remaining sampling budget.
    pub const DISABLED_BIT: u64 = ControlWord::DISABLED_BIT;
    pub const BUDGET_MASK: u64 = ControlWord::BUDGET_MASK;
}

/// Per-thread state, exclusively mutated by its owning application thread
/// except at `join` and during a global `finalize` flush.
pub struct ThreadState {
    pub tid: ThreadId,
    pub clock: VectorClock,
    pub shadow_stack: SmallVec<[u64; SHADOW_STACK_INLINE]>,
    pub event_buffer: Vec<MemRef>,
    pub sampling_counter: u32,
    pub sampling_period: u32,
    pub enabled: bool,
    /// Recursion depth per mutex handle this thread currently holds.
    pub mutex_book: AHashMap<u64, u32>,
}

impl ThreadState {
    pub fn new(tid: ThreadId, sampling_period: u32) -> Self {
        ThreadState {
            tid,
            clock: VectorClock::new(),
            shadow_stack: SmallVec::new(),
            event_buffer: Vec::with_capacity(EventIngest::CAPACITY),
            sampling_counter: sampling_period,
            sampling_period,
            enabled: true,
            mutex_book: AHashMap::new(),
        }
    }

    /// Deep-copy a thread's clock for a child at `fork`; nothing else carries
    /// over (fresh stack, fresh buffer, fresh mutex bookkeeping).
    pub fn fork_child(tid: ThreadId, parent_clock: &VectorClock, sampling_period: u32) -> Self {
        let mut child = ThreadState::new(tid, sampling_period);
        child.clock = parent_clock.snapshot();
        child
    }

    /// Sampling filter: decrements the counter and reports whether this event
    /// should be admitted. Deterministic given `sampling_period` and the
    /// sequence of calls — never applied to synchronization events.
    pub fn sample(&mut self) -> bool {
        if self.sampling_period <= 1 {
            return true;
        }
        self.sampling_counter -= 1;
        if self.sampling_counter == 0 {
            self.sampling_counter = self.sampling_period;
            true
        } else {
            false
        }
    }

    pub fn buffer_full(&self) -> bool {
        self.event_buffer.len() >= EventIngest::CAPACITY
    }

    pub fn push_ref(&mut self, r: MemRef) {
        self.event_buffer.push(r);
    }

    pub fn drain_buffer(&mut self) -> Vec<MemRef> {
        std::mem::take(&mut self.event_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_word_round_trips_budget_and_flag() {
        let mut cw = ControlWord::new(42, false);
        assert_eq!(cw.sampling_budget(), 42);
        assert!(!cw.disabled());

        cw.set_disabled(true);
        assert!(cw.disabled());
        assert_eq!(cw.sampling_budget(), 42, "disabling must not clobber budget");

        cw.set_sampling_budget(7);
        assert_eq!(cw.sampling_budget(), 7);
        assert!(cw.disabled(), "changing budget must not clobber the flag");
    }

    #[test]
    fn fork_child_copies_parent_clock_not_reference() {
        let mut parent = VectorClock::new();
        parent.tick(1);
        let child = ThreadState::fork_child(2, &parent, 1);
        assert_eq!(child.clock.get(1), 1);

        parent.tick(1);
        assert_eq!(child.clock.get(1), 1, "child clock must be a deep copy");
    }

    #[test]
    fn sampling_admits_every_nth_event() {
        let mut ts = ThreadState::new(1, 3);
        let admitted: Vec<bool> = (0..9).map(|_| ts.sample()).collect();
        assert_eq!(
            admitted,
            vec![false, false, true, false, false, true, false, false, true]
        );
    }

    #[test]
    fn sampling_period_one_admits_every_event() {
        let mut ts = ThreadState::new(1, 1);
        assert!((0..5).all(|_| ts.sample()));
    }

    #[test]
    fn buffer_drains_in_fifo_order() {
        let mut ts = ThreadState::new(1, 1);
        ts.push_ref(MemRef { addr: 1, pc: 0, size: 1, is_write: false, stack: SmallVec::new() });
        ts.push_ref(MemRef { addr: 2, pc: 0, size: 1, is_write: false, stack: SmallVec::new() });
        let drained = ts.drain_buffer();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].addr, 1);
        assert_eq!(drained[1].addr, 2);
        assert!(ts.event_buffer.is_empty());
    }
}
