//! The detector façade: the surface the instrumenter actually calls.
//!
//! Every public method here is infallible from the caller's point of view,
//! per the detector contract — internal faults are logged via
//! [`DetectorError`] and recovered locally, never propagated or panicking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use ahash::AHashMap;

use crate::config::Config;
use crate::error::DetectorError;
use crate::race::RaceCollector;
use crate::shadow::ShadowMemory;
use crate::sink::Sink;
use crate::sync_table::SyncObjectTable;
use crate::thread_state::{MemRef, ThreadId, ThreadState};

/// Opaque per-thread handle returned by [`Engine::fork`] (or
/// [`Engine::register_thread`] for the thread that called `init`), required
/// on every subsequent per-thread call.
#[derive(Clone)]
pub struct Tls(Arc<Mutex<ThreadState>>);

/// Process-wide detector state: one owned value, not a collection of
/// mutable globals — ModuleTracker/Symbols/RaceCollector/Engine singletons
/// in the source this is modeled on collapse into this struct and its
/// fields.
pub struct Engine {
    config: Config,
    threads: RwLock<AHashMap<ThreadId, Arc<Mutex<ThreadState>>>>,
    shadow: ShadowMemory,
    sync_table: SyncObjectTable,
    collector: RaceCollector,
    dropped_events: AtomicU64,
}

impl Engine {
    pub fn init(config: Config) -> Self {
        let rate_limit = config.output.rate_limit_per_second;
        Engine {
            config,
            threads: RwLock::new(AHashMap::new()),
            shadow: ShadowMemory::new(),
            sync_table: SyncObjectTable::new(),
            collector: RaceCollector::new(rate_limit),
            dropped_events: AtomicU64::new(0),
        }
    }

    /// Register the thread that called `init`, which never goes through
    /// `fork`. Honors `exclude.master_thread`.
    pub fn register_thread(&self, tid: ThreadId) -> Tls {
        let mut state = ThreadState::new(tid, self.config.sampling.period.max(1));
        if self.config.exclude.master_thread {
            state.enabled = false;
        }
        let handle = Arc::new(Mutex::new(state));
        self.threads.write().unwrap().insert(tid, handle.clone());
        Tls(handle)
    }

    /// Allocate state for `child_tid`, seeded with a deep copy of the
    /// parent's clock, then tick the parent's own component.
    pub fn fork(&self, parent: &Tls, child_tid: ThreadId) -> Tls {
        let mut parent_state = parent.0.lock().unwrap();
        let child_state = ThreadState::fork_child(
            child_tid,
            &parent_state.clock,
            self.config.sampling.period.max(1),
        );
        parent_state.clock.tick(parent_state.tid);
        drop(parent_state);

        let handle = Arc::new(Mutex::new(child_state));
        self.threads
            .write()
            .unwrap()
            .insert(child_tid, handle.clone());
        Tls(handle)
    }

    /// `parent.clock ⊔= child.clock`, then the child's `ThreadState` is
    /// retired after its buffer is drained.
    pub fn join(&self, parent: &Tls, child_tid: ThreadId) {
        let child_handle = match self.threads.write().unwrap().remove(&child_tid) {
            Some(h) => h,
            None => {
                DetectorError::usage(format!("join of unknown child tid {child_tid}")).log();
                return;
            }
        };
        let mut child_state = child_handle.lock().unwrap();
        self.drain(&mut child_state);

        let mut parent_state = parent.0.lock().unwrap();
        parent_state.clock.join(&child_state.clock);
    }

    pub fn read(&self, tls: &Tls, pc: u64, addr: u64, size: u8) {
        self.record_access(tls, pc, addr, size, false);
    }

    pub fn write(&self, tls: &Tls, pc: u64, addr: u64, size: u8) {
        self.record_access(tls, pc, addr, size, true);
    }

    fn record_access(&self, tls: &Tls, pc: u64, addr: u64, size: u8, is_write: bool) {
        let mut state = tls.0.lock().unwrap();
        if !state.enabled {
            return;
        }
        if !state.sample() {
            return;
        }
        let stack = state.shadow_stack.clone();
        state.push_ref(MemRef { addr, pc, size, is_write, stack });
        if state.buffer_full() {
            self.drain(&mut state);
        }
    }

    /// Flush `state`'s buffer into shadow memory, handing any detected race
    /// to the collector. Lossy mode skips every other buffered event
    /// instead of walking all of them, trading precision for throughput
    /// when the buffer is backed up.
    fn drain(&self, state: &mut ThreadState) {
        let refs = state.drain_buffer();
        for (i, r) in refs.iter().enumerate() {
            if self.config.sampling.lossy && i % 2 == 1 {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let race = if r.is_write {
                self.shadow
                    .on_write(state.tid, &state.clock, r.addr, r.size, r.pc, &r.stack)
            } else {
                self.shadow
                    .on_read(state.tid, &state.clock, r.addr, r.size, r.pc, &r.stack)
            };
            if let Some(race) = race {
                self.collector.record(race);
            }
        }
    }

    fn flush(&self, tls: &Tls) -> std::sync::MutexGuard<'_, ThreadState> {
        let mut state = tls.0.lock().unwrap();
        self.drain(&mut state);
        state
    }

    pub fn acquire(&self, tls: &Tls, handle: u64) {
        let mut state = self.flush(tls);
        self.sync_table.acquire(&mut state, handle);
    }

    pub fn release(&self, tls: &Tls, handle: u64) {
        let mut state = self.flush(tls);
        self.sync_table.release(&mut state, handle);
    }

    pub fn happens_before(&self, tls: &Tls, id: u64) {
        let mut state = self.flush(tls);
        self.sync_table.happens_before(&mut state, id);
    }

    pub fn happens_after(&self, tls: &Tls, id: u64) {
        let mut state = self.flush(tls);
        self.sync_table.happens_after(&mut state, id);
    }

    pub fn allocate(&self, _tls: &Tls, addr: u64, size: u64) {
        self.shadow.allocate(addr, size);
    }

    pub fn deallocate(&self, _tls: &Tls, addr: u64) {
        if self.shadow.deallocate(addr).is_none() {
            DetectorError::usage(format!("deallocate of unknown address {addr:#x}")).log();
        }
    }

    pub fn func_enter(&self, tls: &Tls, pc: u64) {
        let mut state = tls.0.lock().unwrap();
        if state.enabled {
            state.shadow_stack.push(pc);
        }
    }

    pub fn func_exit(&self, tls: &Tls) {
        let mut state = tls.0.lock().unwrap();
        if state.enabled {
            state.shadow_stack.pop();
        }
    }

    pub fn enter_exclude(&self, tls: &Tls) {
        tls.0.lock().unwrap().enabled = false;
    }

    pub fn leave_exclude(&self, tls: &Tls) {
        tls.0.lock().unwrap().enabled = true;
    }

    /// Drain every live thread's buffer, then hand the full race collection
    /// to each sink. Idempotent; safe to call more than once.
    pub fn finalize(&self, sinks: &mut [Box<dyn Sink>]) -> crate::race::FinalizeSummary {
        let threads = self.threads.read().unwrap();
        for handle in threads.values() {
            let mut state = handle.lock().unwrap();
            self.drain(&mut state);
        }
        drop(threads);

        self.collector.finalize(sinks)
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::race::Race;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};

    struct MemorySink {
        races: StdArc<StdMutex<Vec<Race>>>,
    }

    impl Sink for MemorySink {
        fn write_race(&mut self, race: &Race) -> Result<(), DetectorError> {
            self.races.lock().unwrap().push(race.clone());
            Ok(())
        }
        fn flush(&mut self) -> Result<(), DetectorError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), DetectorError> {
            Ok(())
        }
    }

    fn engine_with_config(mut cfg: Config) -> Engine {
        cfg.sampling.period = 1;
        Engine::init(cfg)
    }

    #[test]
    fn wr_race_scenario_reports_one_race() {
        let engine = engine_with_config(Config::default());
        let master = engine.register_thread(1);
        let t10 = engine.fork(&master, 10);
        let t11 = engine.fork(&master, 11);

        engine.write(&t10, 0xAAAA, 0x100000, 8);
        engine.read(&t11, 0xBBBB, 0x100000, 8);

        let races = StdArc::new(StdMutex::new(Vec::new()));
        let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(MemorySink { races: races.clone() })];
        let summary = engine.finalize(&mut sinks);
        assert_eq!(summary.races_reported, 1);
        assert_eq!(races.lock().unwrap().len(), 1);
    }

    #[test]
    fn locked_scenario_reports_no_races() {
        let engine = engine_with_config(Config::default());
        let master = engine.register_thread(1);
        let t20 = engine.fork(&master, 20);
        let t21 = engine.fork(&master, 21);

        engine.acquire(&t20, 0xF00D);
        engine.write(&t20, 0x1, 0x200000, 8);
        engine.read(&t20, 0x2, 0x200000, 8);
        engine.release(&t20, 0xF00D);

        engine.acquire(&t21, 0xF00D);
        engine.write(&t21, 0x3, 0x200000, 8);
        engine.read(&t21, 0x4, 0x200000, 8);
        engine.release(&t21, 0xF00D);

        let mut sinks: Vec<Box<dyn Sink>> = vec![];
        let summary = engine.finalize(&mut sinks);
        assert_eq!(summary.races_reported, 0);
    }

    #[test]
    fn thread_exit_ordering_scenario_reports_no_races() {
        let engine = engine_with_config(Config::default());
        let master = engine.register_thread(1);
        let t30 = engine.fork(&master, 30);

        engine.write(&t30, 0x10, 0x320000, 8);
        let t31 = engine.fork(&t30, 31);
        engine.write(&t31, 0x11, 0x320000, 8);
        engine.join(&t30, 31);
        engine.read(&t30, 0x12, 0x320000, 8);

        let mut sinks: Vec<Box<dyn Sink>> = vec![];
        let summary = engine.finalize(&mut sinks);
        assert_eq!(summary.races_reported, 0);
    }

    #[test]
    fn happens_before_annotation_scenario_reports_no_races() {
        let engine = engine_with_config(Config::default());
        let master = engine.register_thread(1);
        let t50 = engine.fork(&master, 50);
        let t51 = engine.fork(&master, 51);

        engine.write(&t50, 0x20, 0x500000, 8);
        engine.happens_before(&t50, 0x50510000);
        engine.happens_after(&t51, 0x50510000);
        engine.write(&t51, 0x21, 0x500000, 8);

        let mut sinks: Vec<Box<dyn Sink>> = vec![];
        let summary = engine.finalize(&mut sinks);
        assert_eq!(summary.races_reported, 0);
    }

    #[test]
    fn barrier_scenario_reports_one_race_for_the_non_participant() {
        let engine = engine_with_config(Config::default());
        let master = engine.register_thread(1);
        let t70 = engine.fork(&master, 70);
        let t71 = engine.fork(&master, 71);
        let t72 = engine.fork(&master, 72);

        engine.write(&t70, 0x30, 0x700000, 8);
        engine.write(&t71, 0x31, 0x700001, 8);
        engine.write(&t72, 0x32, 0x700002, 8);

        engine.happens_before(&t70, 0x0700);
        engine.happens_after(&t71, 0x0700);
        // t72 never participates in the barrier

        engine.write(&t72, 0x33, 0x700000, 8);

        let mut sinks: Vec<Box<dyn Sink>> = vec![];
        let summary = engine.finalize(&mut sinks);
        assert_eq!(summary.races_reported, 1);
    }

    #[test]
    fn reset_on_free_scenario_reports_no_races() {
        let engine = engine_with_config(Config::default());
        let master = engine.register_thread(1);
        let t80 = engine.fork(&master, 80);
        let t81 = engine.fork(&master, 81);

        engine.allocate(&t80, 0x800000, 0x10);
        engine.write(&t80, 0x40, 0x800000, 8);
        engine.deallocate(&t80, 0x800000);
        engine.happens_before(&t80, 0x800000);
        engine.happens_after(&t81, 0x800000);

        engine.allocate(&t81, 0x800000, 0x2);
        engine.write(&t81, 0x41, 0x800000, 2);

        let mut sinks: Vec<Box<dyn Sink>> = vec![];
        let summary = engine.finalize(&mut sinks);
        assert_eq!(summary.races_reported, 0);
    }

    #[test]
    fn inspection_scenario_captures_stack_depths() {
        let engine = engine_with_config(Config::default());
        let master = engine.register_thread(1);
        let t90 = engine.fork(&master, 90);
        let t91 = engine.fork(&master, 91);

        engine.func_enter(&t90, 0x01);
        engine.func_enter(&t90, 0x02);
        engine.func_enter(&t90, 0x0090);
        engine.write(&t90, 0x0090, 0x900000, 8);
        engine.func_exit(&t90);
        engine.func_exit(&t90);
        engine.func_exit(&t90);

        engine.func_enter(&t91, 0x03);
        engine.func_enter(&t91, 0x0091);
        engine.read(&t91, 0x0091, 0x900000, 8);
        engine.func_exit(&t91);
        engine.func_exit(&t91);

        let races = StdArc::new(StdMutex::new(Vec::new()));
        let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(MemorySink { races: races.clone() })];
        engine.finalize(&mut sinks);

        let recorded = races.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        let race = &recorded[0];
        // whichever side is the write (t90) vs the read (t91)
        let (write_side, read_side) = if race.first.is_write {
            (&race.first, &race.second)
        } else {
            (&race.second, &race.first)
        };
        assert_eq!(write_side.captured_stack.len(), 3);
        assert_eq!(*write_side.captured_stack.last().unwrap(), 0x0090);
        assert_eq!(read_side.captured_stack.len(), 2);
        assert_eq!(*read_side.captured_stack.last().unwrap(), 0x0091);
    }

    #[test]
    fn disabled_thread_drops_memory_events_but_not_sync() {
        let engine = engine_with_config(Config::default());
        let master = engine.register_thread(1);
        let t1 = engine.fork(&master, 100);
        let t2 = engine.fork(&master, 101);

        engine.enter_exclude(&t1);
        engine.write(&t1, 0x1, 0xA00000, 8); // dropped, thread disabled
        engine.acquire(&t1, 0xBEEF); // still processed
        engine.release(&t1, 0xBEEF);
        engine.leave_exclude(&t1);

        engine.acquire(&t2, 0xBEEF);
        engine.write(&t2, 0x2, 0xA00000, 8);
        engine.release(&t2, 0xBEEF);

        let mut sinks: Vec<Box<dyn Sink>> = vec![];
        let summary = engine.finalize(&mut sinks);
        assert_eq!(summary.races_reported, 0);
    }
}
