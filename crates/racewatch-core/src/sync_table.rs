//! Synchronization object table: per-handle last-release clocks, keyed by
//! whatever identity the instrumenter uses for a lock, event, or barrier.

use std::sync::RwLock;

use ahash::AHashMap;

use crate::clock::VectorClock;
use crate::thread_state::ThreadState;

#[derive(Debug, Clone, Default)]
struct SyncObject {
    last_release_clock: VectorClock,
    recursion_depth: u32,
    owner: Option<u32>,
}

/// Reader-writer locked map from sync handle to its [`SyncObject`]. Readers
/// (the common case: most acquires/releases touch distinct handles and
/// only need to look one up) dominate, per the concurrency model.
pub struct SyncObjectTable {
    objects: RwLock<AHashMap<u64, SyncObject>>,
}

impl Default for SyncObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncObjectTable {
    pub fn new() -> Self {
        SyncObjectTable {
            objects: RwLock::new(AHashMap::new()),
        }
    }

    /// Join the thread's clock with the handle's last release, track
    /// recursion depth via `thread.mutex_book`. Only the first (non-nested)
    /// acquire installs the happens-before edge — a recursive re-acquire by
    /// the same thread already observed it.
    pub fn acquire(&self, thread: &mut ThreadState, handle: u64) {
        let depth = thread.mutex_book.entry(handle).or_insert(0);
        let was_unlocked_by_this_thread = *depth == 0;
        *depth += 1;

        if was_unlocked_by_this_thread {
            let mut objects = self.objects.write().unwrap();
            let obj = objects.entry(handle).or_default();
            thread.clock.join(&obj.last_release_clock);
            obj.recursion_depth += 1;
            obj.owner = Some(thread.tid);
        }
    }

    /// Requires the thread to currently own `handle`. A release without a
    /// matching acquire is a usage error: logged, no clock effect. Only the
    /// transition to depth 0 publishes `thread.clock` as the new release
    /// clock and ticks the thread's own component — a nested release still
    /// held by the same thread leaves the object, and the clock, untouched.
    pub fn release(&self, thread: &mut ThreadState, handle: u64) {
        let depth = match thread.mutex_book.get_mut(&handle) {
            Some(d) if *d > 0 => d,
            _ => {
                log::warn!("release of handle {handle:#x} by tid {} without a matching acquire", thread.tid);
                return;
            }
        };
        *depth -= 1;
        let reached_zero = *depth == 0;
        if reached_zero {
            thread.mutex_book.remove(&handle);
        } else {
            return;
        }

        let mut objects = self.objects.write().unwrap();
        let Some(obj) = objects.get_mut(&handle) else {
            log::warn!("release of handle {handle:#x} with no tracked sync object");
            return;
        };
        if obj.owner != Some(thread.tid) {
            log::warn!("release of handle {handle:#x} by tid {} while not owner", thread.tid);
            return;
        }
        obj.last_release_clock = thread.clock.snapshot();
        obj.recursion_depth = 0;
        obj.owner = None;
        thread.clock.tick(thread.tid);
    }

    /// Publish the current thread clock into `handle`'s release clock, then
    /// tick the thread's own component. Used by the `HAPPENS_BEFORE`
    /// annotation, independent of the acquire/release recursion bookkeeping.
    pub fn happens_before(&self, thread: &mut ThreadState, id: u64) {
        let mut objects = self.objects.write().unwrap();
        let obj = objects.entry(id).or_default();
        obj.last_release_clock = thread.clock.snapshot();
        thread.clock.tick(thread.tid);
    }

    /// Join the thread's clock with `id`'s release clock. A no-op if `id`
    /// was never published via `happens_before` (id not found reads as a
    /// zero clock).
    pub fn happens_after(&self, thread: &mut ThreadState, id: u64) {
        let objects = self.objects.read().unwrap();
        if let Some(obj) = objects.get(&id) {
            thread.clock.join(&obj.last_release_clock);
        }
    }

    /// Drop a handle's bookkeeping entirely (explicit forget, or teardown).
    pub fn forget(&self, handle: u64) {
        self.objects.write().unwrap().remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(tid: u32) -> ThreadState {
        ThreadState::new(tid, 1)
    }

    #[test]
    fn acquire_joins_release_clock() {
        let table = SyncObjectTable::new();
        let mut t1 = thread(1);
        let mut t2 = thread(2);

        t1.clock.tick(1);
        table.acquire(&mut t1, 0xAA);
        table.release(&mut t1, 0xAA);

        table.acquire(&mut t2, 0xAA);
        assert!(t2.clock.get(1) >= 1, "acquirer must observe the releaser's clock");
    }

    #[test]
    fn recursive_acquire_tracks_depth_and_releases_only_at_zero() {
        let table = SyncObjectTable::new();
        let mut t1 = thread(1);
        table.acquire(&mut t1, 0xBB);
        table.acquire(&mut t1, 0xBB);
        assert_eq!(*t1.mutex_book.get(&0xBB).unwrap(), 2);

        table.release(&mut t1, 0xBB);
        assert_eq!(*t1.mutex_book.get(&0xBB).unwrap(), 1);

        let clock_before = t1.clock.snapshot();
        table.release(&mut t1, 0xBB);
        assert!(t1.mutex_book.get(&0xBB).is_none());
        assert!(clock_before.leq(&t1.clock), "final release must tick the thread's own clock");
    }

    #[test]
    fn release_without_acquire_is_a_harmless_no_op() {
        let table = SyncObjectTable::new();
        let mut t1 = thread(1);
        let before = t1.clock.snapshot();
        table.release(&mut t1, 0xCC);
        assert_eq!(before, t1.clock);
    }

    #[test]
    fn happens_before_after_establishes_edge() {
        let table = SyncObjectTable::new();
        let mut t1 = thread(1);
        let mut t2 = thread(2);

        t1.clock.tick(1);
        table.happens_before(&mut t1, 0xDEAD);
        table.happens_after(&mut t2, 0xDEAD);
        assert!(t2.clock.get(1) >= 1);
    }

    #[test]
    fn happens_after_on_unpublished_id_is_a_no_op() {
        let table = SyncObjectTable::new();
        let mut t2 = thread(2);
        let before = t2.clock.snapshot();
        table.happens_after(&mut t2, 0x1234);
        assert_eq!(before, t2.clock);
    }
}
