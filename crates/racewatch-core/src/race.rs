//! Race pairs, their dedup/rate-limit bookkeeping, and the collector that
//! hands finalized reports to a [`Sink`].

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use smallvec::SmallVec;

use crate::sink::Sink;
use crate::thread_state::ThreadId;

/// Default number of distinct races ever needed in a single process run
/// before dedup keys start aging out. Chosen generously; a real run rarely
/// has more than a few hundred distinct racing pairs.
const DEFAULT_DEDUP_CAPACITY: usize = 4096;

/// One side of a race: the access and (if retained) the call stack active
/// when it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessSnapshot {
    pub tid: ThreadId,
    pub pc: u64,
    pub addr: u64,
    pub size: u8,
    pub is_write: bool,
    /// Ordered call-site pcs, outermost frame first. Empty when the other
    /// side's stack was not retained (e.g. its shadow cell aged out).
    pub captured_stack: SmallVec<[u64; 8]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Race {
    pub first: AccessSnapshot,
    pub second: AccessSnapshot,
}

/// Dedup key: `spec.md` §4.5 defines it as `(min_pc, max_pc, min_tid,
/// max_tid)`, order-independent so A-races-B and B-races-A collapse.
type RaceKey = (u64, u64, ThreadId, ThreadId);

fn race_key(race: &Race) -> RaceKey {
    let (pc_lo, pc_hi) = if race.first.pc <= race.second.pc {
        (race.first.pc, race.second.pc)
    } else {
        (race.second.pc, race.first.pc)
    };
    let (tid_lo, tid_hi) = if race.first.tid <= race.second.tid {
        (race.first.tid, race.second.tid)
    } else {
        (race.second.tid, race.first.tid)
    };
    (pc_lo, pc_hi, tid_lo, tid_hi)
}

/// Counts accumulated across a run, surfaced in the `finalize()` log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeSummary {
    pub races_reported: u64,
    pub races_deduplicated: u64,
    pub races_rate_limited: u64,
    pub sink_errors: u64,
}

struct Inner {
    dedup_order: VecDeque<RaceKey>,
    dedup_seen: AHashSet<RaceKey>,
    dedup_capacity: usize,
    races: Vec<Race>,
    window_start: Instant,
    window_count: u32,
    rate_limit_per_second: u32,
    summary: FinalizeSummary,
}

impl Inner {
    fn evict_if_over_capacity(&mut self) {
        while self.dedup_order.len() > self.dedup_capacity {
            if let Some(old) = self.dedup_order.pop_front() {
                self.dedup_seen.remove(&old);
            }
        }
    }

    fn admit_by_rate_limit(&mut self, now: Instant) -> bool {
        if self.rate_limit_per_second == 0 {
            return true;
        }
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.window_count = 0;
        }
        if self.window_count < self.rate_limit_per_second {
            self.window_count += 1;
            true
        } else {
            false
        }
    }
}

/// Deduplicates, rate-limits, and retains race reports in first-seen order
/// until `finalize` hands them to one or more [`Sink`]s.
///
/// Mutex-guarded: acquired only on the race-report path, which the
/// concurrency model treats as rare relative to ordinary memory accesses.
pub struct RaceCollector {
    inner: Mutex<Inner>,
}

impl RaceCollector {
    pub fn new(rate_limit_per_second: u32) -> Self {
        Self::with_dedup_capacity(rate_limit_per_second, DEFAULT_DEDUP_CAPACITY)
    }

    pub fn with_dedup_capacity(rate_limit_per_second: u32, dedup_capacity: usize) -> Self {
        RaceCollector {
            inner: Mutex::new(Inner {
                dedup_order: VecDeque::new(),
                dedup_seen: AHashSet::new(),
                dedup_capacity,
                races: Vec::new(),
                window_start: Instant::now(),
                window_count: 0,
                rate_limit_per_second,
                summary: FinalizeSummary::default(),
            }),
        }
    }

    /// Record a race, subject to dedup and rate limiting. Returns `true` if
    /// it was newly retained.
    pub fn record(&self, race: Race) -> bool {
        let key = race_key(&race);
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if inner.dedup_seen.contains(&key) {
            inner.summary.races_deduplicated += 1;
            return false;
        }

        if !inner.admit_by_rate_limit(now) {
            inner.summary.races_rate_limited += 1;
            log::warn!("race rate limit exceeded, suppressing report for tid {}/{}", race.first.tid, race.second.tid);
            return false;
        }

        inner.dedup_seen.insert(key);
        inner.dedup_order.push_back(key);
        inner.evict_if_over_capacity();
        inner.summary.races_reported += 1;
        inner.races.push(race);
        true
    }

    /// Drain every retained race into each sink in turn, in first-seen
    /// order. Sink errors are logged and counted, never propagated: a
    /// failing sink does not stop the others or abort the run.
    pub fn finalize(&self, sinks: &mut [Box<dyn Sink>]) -> FinalizeSummary {
        let mut inner = self.inner.lock().unwrap();
        for race in &inner.races {
            for sink in sinks.iter_mut() {
                if let Err(e) = sink.write_race(race) {
                    e.log();
                    inner.summary.sink_errors += 1;
                }
            }
        }
        for sink in sinks.iter_mut() {
            if let Err(e) = sink.flush() {
                e.log();
                inner.summary.sink_errors += 1;
            }
            if let Err(e) = sink.close() {
                e.log();
                inner.summary.sink_errors += 1;
            }
        }
        let summary = inner.summary;
        log::info!(
            "finalize: {} races reported, {} deduplicated, {} rate-limited, {} sink errors",
            summary.races_reported,
            summary.races_deduplicated,
            summary.races_rate_limited,
            summary.sink_errors,
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DetectorError;

    fn snap(tid: ThreadId, pc: u64) -> AccessSnapshot {
        AccessSnapshot {
            tid,
            pc,
            addr: 0x1000,
            size: 8,
            is_write: true,
            captured_stack: SmallVec::new(),
        }
    }

    fn race(tid_a: ThreadId, pc_a: u64, tid_b: ThreadId, pc_b: u64) -> Race {
        Race {
            first: snap(tid_a, pc_a),
            second: snap(tid_b, pc_b),
        }
    }

    #[derive(Clone, Default)]
    struct Recorded {
        written: std::sync::Arc<Mutex<Vec<Race>>>,
        flushed: std::sync::Arc<Mutex<bool>>,
        closed: std::sync::Arc<Mutex<bool>>,
    }

    struct RecordingSink(Recorded);

    impl Sink for RecordingSink {
        fn write_race(&mut self, race: &Race) -> Result<(), DetectorError> {
            self.0.written.lock().unwrap().push(race.clone());
            Ok(())
        }
        fn flush(&mut self) -> Result<(), DetectorError> {
            *self.0.flushed.lock().unwrap() = true;
            Ok(())
        }
        fn close(&mut self) -> Result<(), DetectorError> {
            *self.0.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    #[test]
    fn identical_race_key_collapses_to_one() {
        let collector = RaceCollector::new(0);
        assert!(collector.record(race(1, 0xA, 2, 0xB)));
        assert!(!collector.record(race(1, 0xA, 2, 0xB)));
        assert!(!collector.record(race(2, 0xB, 1, 0xA))); // order-independent key
    }

    #[test]
    fn distinct_races_are_both_retained() {
        let collector = RaceCollector::new(0);
        assert!(collector.record(race(1, 0xA, 2, 0xB)));
        assert!(collector.record(race(3, 0xC, 4, 0xD)));
    }

    #[test]
    fn rate_limit_suppresses_beyond_window_budget() {
        let collector = RaceCollector::new(1);
        assert!(collector.record(race(1, 0x1, 2, 0x2)));
        // Second distinct race within the same second is rate-limited, not deduped.
        assert!(!collector.record(race(3, 0x3, 4, 0x4)));
    }

    #[test]
    fn finalize_writes_in_first_seen_order() {
        let collector = RaceCollector::new(0);
        collector.record(race(1, 0x1, 2, 0x2));
        collector.record(race(3, 0x3, 4, 0x4));

        let recorded = Recorded::default();
        let sink: Box<dyn Sink> = Box::new(RecordingSink(recorded.clone()));
        let mut sinks: Vec<Box<dyn Sink>> = vec![sink];
        let summary = collector.finalize(&mut sinks);

        assert_eq!(summary.races_reported, 2);
        let written = recorded.written.lock().unwrap();
        assert_eq!(written[0].first.pc, 0x1);
        assert_eq!(written[1].first.pc, 0x3);
        assert!(*recorded.flushed.lock().unwrap());
        assert!(*recorded.closed.lock().unwrap());
    }
}
