//! Shadow memory: address-keyed access history with allocation-scoped
//! lifetime, sharded for concurrent per-thread access.
//!
//! Granularity is word-sized (8-byte aligned). An access spanning multiple
//! words is decomposed per word; on_write/on_read walk the touched words in
//! ascending shard order so cross-shard updates never deadlock (§5 of the
//! design: "cross-shard operations MUST acquire locks in ascending shard
//! index").

use std::sync::Mutex;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::clock::VectorClock;
use crate::race::{AccessSnapshot, Race};
use crate::thread_state::ThreadId;

const WORD_SIZE: u64 = 8;
const SHARD_BITS: u32 = 6;
const SHARD_COUNT: usize = 1 << SHARD_BITS;

/// At most this many distinct concurrent readers are tracked exactly per
/// shadow cell; beyond that the cell falls back to a per-thread summary
/// clock (see [`ReaderSet`]).
const MAX_EXACT_READERS: usize = 4;

fn word_addr(addr: u64) -> u64 {
    addr & !(WORD_SIZE - 1)
}

fn words_touched(addr: u64, size: u8) -> impl Iterator<Item = u64> {
    let first = word_addr(addr);
    let last = word_addr(addr + size.max(1) as u64 - 1);
    (first..=last).step_by(WORD_SIZE as usize)
}

fn shard_of(word: u64) -> usize {
    // High bits select the shard so that sequential accesses from one
    // allocation tend to land in the same shard, not scatter across all of
    // them.
    ((word >> 16) as usize) & (SHARD_COUNT - 1)
}

/// Reader bookkeeping for one shadow cell.
///
/// The source this crate is modeled on mixes strategies for tracking
/// concurrent readers of a cell; this implementation picks one and
/// documents it, as the design notes allow: a small exact set of
/// `(ThreadId, tick)` pairs, falling back once `MAX_EXACT_READERS` is
/// exceeded to a summary vector clock plus the identity of the most recent
/// reader (used only as the reported "other side" of a race against the
/// summary — once merged, individual reader identity beyond that is lost,
/// which is the accepted cost of the O(1)-space fallback).
type Stack = SmallVec<[u64; 8]>;

#[derive(Debug, Clone, Default)]
enum ReaderSet {
    #[default]
    Empty,
    Few(SmallVec<[(ThreadId, u64, u64, Stack); MAX_EXACT_READERS]>),
    Many {
        clock: VectorClock,
        last_tid: ThreadId,
        last_pc: u64,
        last_stack: Stack,
    },
}

impl ReaderSet {
    fn observe(&mut self, tid: ThreadId, tick: u64, pc: u64, stack: &[u64]) {
        match self {
            ReaderSet::Empty => {
                let mut v = SmallVec::new();
                v.push((tid, tick, pc, stack.iter().copied().collect()));
                *self = ReaderSet::Few(v);
            }
            ReaderSet::Few(v) => {
                if let Some(entry) = v.iter_mut().find(|(t, ..)| *t == tid) {
                    entry.1 = tick;
                    entry.2 = pc;
                    entry.3 = stack.iter().copied().collect();
                } else if v.len() < MAX_EXACT_READERS {
                    v.push((tid, tick, pc, stack.iter().copied().collect()));
                } else {
                    let mut clock = VectorClock::new();
                    for (t, tk, ..) in v.iter() {
                        clock.observe(*t, *tk);
                    }
                    clock.observe(tid, tick);
                    *self = ReaderSet::Many {
                        clock,
                        last_tid: tid,
                        last_pc: pc,
                        last_stack: stack.iter().copied().collect(),
                    };
                }
            }
            ReaderSet::Many {
                clock,
                last_tid,
                last_pc,
                last_stack,
            } => {
                clock.observe(tid, tick);
                *last_tid = tid;
                *last_pc = pc;
                *last_stack = stack.iter().copied().collect();
            }
        }
    }

    /// Returns the racing reader's `(tid, pc, stack)` if `t_clock` does not
    /// dominate every retained read.
    fn racing_reader(&self, t_clock: &VectorClock) -> Option<(ThreadId, u64, Stack)> {
        match self {
            ReaderSet::Empty => None,
            ReaderSet::Few(v) => v
                .iter()
                .find(|(tid, tick, ..)| *tick > t_clock.get(*tid))
                .map(|(tid, _, pc, stack)| (*tid, *pc, stack.clone())),
            ReaderSet::Many {
                clock,
                last_tid,
                last_pc,
                last_stack,
            } => {
                if clock.leq(t_clock) {
                    None
                } else {
                    Some((*last_tid, *last_pc, last_stack.clone()))
                }
            }
        }
    }
}

/// Per shadow-cell access history.
#[derive(Debug, Clone, Default)]
pub struct AccessRecord {
    last_writer: Option<ThreadId>,
    last_writer_pc: u64,
    last_writer_stack: Stack,
    write_clock: VectorClock,
    readers: ReaderSet,
}

struct Shard {
    cells: Mutex<AHashMap<u64, AccessRecord>>,
}

impl Default for Shard {
    fn default() -> Self {
        Shard {
            cells: Mutex::new(AHashMap::new()),
        }
    }
}

/// Sparse, sharded address -> [`AccessRecord`] map with allocation-scoped
/// lifetime.
pub struct ShadowMemory {
    shards: Vec<Shard>,
    /// base address -> size, for `deallocate`'s range lookup.
    extents: Mutex<AHashMap<u64, u64>>,
}

impl Default for ShadowMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowMemory {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        shards.resize_with(SHARD_COUNT, Shard::default);
        ShadowMemory {
            shards,
            extents: Mutex::new(AHashMap::new()),
        }
    }

    fn words_in_shard_order(addr: u64, size: u8) -> SmallVec<[u64; 8]> {
        let mut words: SmallVec<[u64; 8]> = words_touched(addr, size).collect();
        words.sort_unstable_by_key(|&w| shard_of(w));
        words
    }

    /// Record a write, reporting a race if any retained write or read is not
    /// ordered before it. `stack` is the writer's current shadow call stack,
    /// retained alongside the write so a later race against it can report
    /// both sides' stacks.
    pub fn on_write(
        &self,
        tid: ThreadId,
        t_clock: &VectorClock,
        addr: u64,
        size: u8,
        pc: u64,
        stack: &[u64],
    ) -> Option<Race> {
        let mut race = None;
        for word in Self::words_in_shard_order(addr, size) {
            let shard = &self.shards[shard_of(word)];
            let mut cells = shard.cells.lock().unwrap();
            let record = cells.entry(word).or_default();

            if race.is_none() {
                if let Some(writer) = record.last_writer {
                    if writer != tid && !record.write_clock.leq(t_clock) {
                        race = Some(Race {
                            first: AccessSnapshot {
                                tid: writer,
                                pc: record.last_writer_pc,
                                addr: word,
                                size: WORD_SIZE as u8,
                                is_write: true,
                                captured_stack: record.last_writer_stack.clone(),
                            },
                            second: AccessSnapshot {
                                tid,
                                pc,
                                addr,
                                size,
                                is_write: true,
                                captured_stack: stack.iter().copied().collect(),
                            },
                        });
                    }
                }
                if race.is_none() {
                    if let Some((reader_tid, reader_pc, reader_stack)) =
                        record.readers.racing_reader(t_clock)
                    {
                        race = Some(Race {
                            first: AccessSnapshot {
                                tid: reader_tid,
                                pc: reader_pc,
                                addr: word,
                                size: WORD_SIZE as u8,
                                is_write: false,
                                captured_stack: reader_stack,
                            },
                            second: AccessSnapshot {
                                tid,
                                pc,
                                addr,
                                size,
                                is_write: true,
                                captured_stack: stack.iter().copied().collect(),
                            },
                        });
                    }
                }
            }

            record.last_writer = Some(tid);
            record.last_writer_pc = pc;
            record.last_writer_stack = stack.iter().copied().collect();
            record.write_clock = t_clock.snapshot();
            record.readers = ReaderSet::Empty;
        }
        race
    }

    /// Record a read, reporting a race if the retained write is not ordered
    /// before it. Re-reading one's own prior write is never a race.
    pub fn on_read(
        &self,
        tid: ThreadId,
        t_clock: &VectorClock,
        addr: u64,
        size: u8,
        pc: u64,
        stack: &[u64],
    ) -> Option<Race> {
        let mut race = None;
        for word in Self::words_in_shard_order(addr, size) {
            let shard = &self.shards[shard_of(word)];
            let mut cells = shard.cells.lock().unwrap();
            let record = cells.entry(word).or_default();

            if race.is_none() {
                if let Some(writer) = record.last_writer {
                    if writer != tid && !record.write_clock.leq(t_clock) {
                        race = Some(Race {
                            first: AccessSnapshot {
                                tid: writer,
                                pc: record.last_writer_pc,
                                addr: word,
                                size: WORD_SIZE as u8,
                                is_write: true,
                                captured_stack: record.last_writer_stack.clone(),
                            },
                            second: AccessSnapshot {
                                tid,
                                pc,
                                addr,
                                size,
                                is_write: false,
                                captured_stack: stack.iter().copied().collect(),
                            },
                        });
                    }
                }
            }

            record.readers.observe(tid, t_clock.get(tid), pc, stack);
        }
        race
    }

    /// Zero all shadow state in `[addr, addr+size)`. Used by both `allocate`
    /// (fresh extent) and `deallocate` (retiring one), so a re-allocated
    /// range never inherits its predecessor's access history.
    pub fn invalidate(&self, addr: u64, size: u64) {
        if size == 0 {
            return;
        }
        for word in (word_addr(addr)..word_addr(addr + size - 1) + WORD_SIZE).step_by(WORD_SIZE as usize)
        {
            let shard = &self.shards[shard_of(word)];
            shard.cells.lock().unwrap().remove(&word);
        }
    }

    pub fn allocate(&self, addr: u64, size: u64) {
        self.invalidate(addr, size);
        self.extents.lock().unwrap().insert(addr, size);
    }

    /// Returns the freed extent's size, or `None` if `addr` was not a known
    /// live allocation base (a usage error: double-free or unknown address).
    pub fn deallocate(&self, addr: u64) -> Option<u64> {
        let size = self.extents.lock().unwrap().remove(&addr)?;
        self.invalidate(addr, size);
        Some(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock_at(tid: ThreadId, tick: u64) -> VectorClock {
        let mut v = VectorClock::new();
        for _ in 0..tick {
            v.tick(tid);
        }
        v
    }

    #[test]
    fn unordered_write_write_races() {
        let mem = ShadowMemory::new();
        let c1 = clock_at(1, 1);
        let c2 = clock_at(2, 1);
        assert!(mem.on_write(1, &c1, 0x1000, 8, 0xA, &[]).is_none());
        assert!(mem.on_write(2, &c2, 0x1000, 8, 0xB, &[]).is_some());
    }

    #[test]
    fn same_thread_write_write_never_races() {
        let mem = ShadowMemory::new();
        let mut c = VectorClock::new();
        c.tick(1);
        assert!(mem.on_write(1, &c, 0x2000, 8, 0xA, &[]).is_none());
        c.tick(1);
        assert!(mem.on_write(1, &c, 0x2000, 8, 0xB, &[]).is_none());
    }

    #[test]
    fn ordered_write_then_read_does_not_race() {
        let mem = ShadowMemory::new();
        let mut writer_clock = VectorClock::new();
        writer_clock.tick(1);
        assert!(mem.on_write(1, &writer_clock, 0x3000, 8, 0xA, &[]).is_none());

        // reader's clock dominates the writer's (simulating a join/release-acquire)
        let mut reader_clock = writer_clock.snapshot();
        reader_clock.tick(2);
        assert!(mem.on_read(2, &reader_clock, 0x3000, 8, 0xB, &[]).is_none());
    }

    #[test]
    fn unordered_write_then_read_races() {
        let mem = ShadowMemory::new();
        let c1 = clock_at(1, 1);
        let c2 = clock_at(2, 1);
        assert!(mem.on_write(1, &c1, 0x4000, 8, 0xA, &[]).is_none());
        assert!(mem.on_read(2, &c2, 0x4000, 8, 0xB, &[]).is_some());
    }

    #[test]
    fn rereading_own_write_is_not_a_race() {
        let mem = ShadowMemory::new();
        let mut c = VectorClock::new();
        c.tick(1);
        assert!(mem.on_write(1, &c, 0x5000, 8, 0xA, &[]).is_none());
        assert!(mem.on_read(1, &c, 0x5000, 8, 0xB, &[]).is_none());
    }

    #[test]
    fn overlapping_unaligned_sizes_still_race() {
        let mem = ShadowMemory::new();
        let c1 = clock_at(1, 1);
        let c2 = clock_at(2, 1);
        assert!(mem.on_write(1, &c1, 0x6003, 4, 0xA, &[]).is_none());
        assert!(mem.on_read(2, &c2, 0x6000, 8, 0xB, &[]).is_some());
    }

    #[test]
    fn many_readers_fall_back_to_summary_and_still_detect_race() {
        let mem = ShadowMemory::new();
        for t in 1..=(MAX_EXACT_READERS as ThreadId + 3) {
            let c = clock_at(t, 1);
            assert!(mem.on_read(t, &c, 0x7000, 8, t as u64, &[]).is_none());
        }
        let writer_clock = clock_at(99, 1);
        assert!(mem.on_write(99, &writer_clock, 0x7000, 8, 0xFF, &[]).is_some());
    }

    #[test]
    fn race_retains_both_sides_captured_stacks() {
        let mem = ShadowMemory::new();
        let c1 = clock_at(1, 1);
        let c2 = clock_at(2, 1);
        assert!(mem.on_write(1, &c1, 0x9000, 8, 0xA, &[0x1, 0x2, 0xA]).is_none());
        let race = mem.on_read(2, &c2, 0x9000, 8, 0xB, &[0x3, 0xB]).unwrap();
        assert_eq!(race.first.captured_stack.as_slice(), &[0x1, 0x2, 0xA]);
        assert_eq!(race.second.captured_stack.as_slice(), &[0x3, 0xB]);
    }

    #[test]
    fn deallocate_then_reallocate_clears_history() {
        let mem = ShadowMemory::new();
        mem.allocate(0x8000, 0x10);
        let c1 = clock_at(1, 1);
        mem.on_write(1, &c1, 0x8000, 8, 0xA, &[]);
        assert!(mem.deallocate(0x8000).is_some());

        mem.allocate(0x8000, 0x4);
        let c2 = clock_at(2, 1);
        // A fresh allocation must not inherit the old writer's history.
        assert!(mem.on_write(2, &c2, 0x8000, 4, 0xB, &[]).is_none());
    }

    #[test]
    fn deallocate_of_unknown_address_returns_none() {
        let mem = ShadowMemory::new();
        assert!(mem.deallocate(0xDEAD).is_none());
    }
}
