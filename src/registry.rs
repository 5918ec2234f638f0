//! The live-allocation registry.
//!
//! One process-wide instance owns the live table, the history log and the
//! byte counters. All mutations are serialized behind a single mutex, so
//! the externally observable state is linearizable. Internal containers
//! allocate through [`BookkeepingAlloc`] only, never through the
//! intercepted path.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use ahash::AHasher;

use crate::alloc::bookkeeping::BookkeepingAlloc;
use crate::capture::capture;
use crate::record::{AllocationRecord, CallSite, MAX_STACK_DEPTH};

/// Hasher state with no runtime randomness. The registry is a static that
/// must be constructible without touching any lazily seeded global.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedState;

impl BuildHasher for FixedState {
    type Hasher = AHasher;

    fn build_hasher(&self) -> AHasher {
        AHasher::default()
    }
}

type BookVec<T> = allocator_api2::vec::Vec<T, BookkeepingAlloc>;
type LiveTable = hashbrown::HashMap<usize, AllocationRecord, FixedState, BookkeepingAlloc>;

/// Innermost frames belonging to the tracker itself (hook, record,
/// capture), excluded from captured stacks.
const TRACKER_FRAMES: usize = 3;

struct RegistryInner {
    /// Currently outstanding allocations, keyed by address. Insert
    /// overwrites, so a reused address always maps to its freshest record.
    live: LiveTable,
    /// Append-only log of every record ever created; never searched.
    history: BookVec<AllocationRecord>,
    /// Monotone sum of every recorded size.
    total_allocated: u64,
    /// Sum of sizes currently in `live`.
    total_leaked: u64,
}

impl RegistryInner {
    fn new() -> Self {
        Self {
            live: LiveTable::with_hasher_in(FixedState, BookkeepingAlloc),
            history: BookVec::new_in(BookkeepingAlloc),
            total_allocated: 0,
            total_leaked: 0,
        }
    }
}

/// Stable copy of the registry state, taken under the lock.
///
/// The copies live in bookkeeping-allocated vectors, so taking a snapshot
/// never allocates through the hooked path. `live` is sorted by address
/// ascending; that ordering is incidental, not a contract.
pub struct RegistrySnapshot {
    pub live: BookVec<AllocationRecord>,
    pub history: BookVec<AllocationRecord>,
    pub total_allocated: u64,
    pub total_leaked: u64,
}

/// Thread-safe bookkeeping for every allocation made through the hooked
/// path. The process-wide instance is reached through [`registry()`];
/// standalone instances can be constructed for tests.
pub struct AllocationRegistry {
    inner: Mutex<Option<RegistryInner>>,
    enabled: AtomicBool,
}

static REGISTRY: AllocationRegistry = AllocationRegistry::new();

/// The process-wide registry. Const-constructed, so it outlives every
/// tracked allocation by construction.
pub fn registry() -> &'static AllocationRegistry {
    &REGISTRY
}

impl AllocationRegistry {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            enabled: AtomicBool::new(true),
        }
    }

    /// While disabled, hooked calls still allocate and deallocate but
    /// [`record`](Self::record) is skipped. Used so report generation does
    /// not track the symbol backend's own allocations.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Records an allocation with a freshly captured call stack.
    /// No-op while the registry is disabled.
    pub fn record(&self, address: usize, size: usize) {
        if !self.is_enabled() {
            return;
        }
        self.insert(Self::new_record(address, size, None));
    }

    /// Like [`record`](Self::record), with the annotated path's site info.
    pub fn record_with_site(
        &self,
        address: usize,
        size: usize,
        category: u32,
        file: &'static str,
        line: u32,
    ) {
        if !self.is_enabled() {
            return;
        }
        let site = CallSite {
            category,
            file,
            line,
        };
        self.insert(Self::new_record(address, size, Some(site)));
    }

    /// Removes the live record for `address` and subtracts its size from
    /// the leaked counter. An address the registry never saw (allocated
    /// before tracking, or a double free) is a defined no-op. Runs
    /// regardless of the enabled gate.
    pub fn release(&self, address: usize) {
        let mut guard = self.lock();
        let Some(inner) = guard.as_mut() else {
            return;
        };
        if let Some(record) = inner.live.remove(&address) {
            inner.total_leaked -= record.size as u64;
        }
    }

    /// Stable copy of the current state, blocking on the lock.
    pub fn snapshot(&self) -> RegistrySnapshot {
        Self::snapshot_inner(self.lock().as_ref())
    }

    /// Busy-retry variant of [`snapshot`](Self::snapshot): invokes
    /// `backoff` between failed lock attempts instead of blocking. An
    /// alternative acquisition mode for teardown readers; not used on the
    /// allocation path.
    pub fn snapshot_with_backoff<F: FnMut()>(&self, mut backoff: F) -> RegistrySnapshot {
        let guard = loop {
            match self.inner.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::Poisoned(poisoned)) => break poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => backoff(),
            }
        };
        Self::snapshot_inner(guard.as_ref())
    }

    fn new_record(address: usize, size: usize, site: Option<CallSite>) -> AllocationRecord {
        // Capture before taking the lock; the stack walk is the expensive
        // part and needs no shared state.
        let mut frames = [0usize; MAX_STACK_DEPTH];
        let depth = capture(&mut frames, TRACKER_FRAMES);
        AllocationRecord {
            address,
            size,
            frames,
            depth,
            site,
        }
    }

    fn insert(&self, record: AllocationRecord) {
        let mut guard = self.lock();
        let inner = guard.get_or_insert_with(RegistryInner::new);
        inner.total_allocated += record.size as u64;
        inner.total_leaked += record.size as u64;
        inner.history.push(record);
        inner.live.insert(record.address, record);
    }

    fn snapshot_inner(inner: Option<&RegistryInner>) -> RegistrySnapshot {
        let Some(inner) = inner else {
            return RegistrySnapshot {
                live: BookVec::new_in(BookkeepingAlloc),
                history: BookVec::new_in(BookkeepingAlloc),
                total_allocated: 0,
                total_leaked: 0,
            };
        };

        let mut live = BookVec::with_capacity_in(inner.live.len(), BookkeepingAlloc);
        for record in inner.live.values() {
            live.push(*record);
        }
        live.sort_unstable_by_key(|record| record.address);

        let mut history = BookVec::with_capacity_in(inner.history.len(), BookkeepingAlloc);
        for record in inner.history.iter() {
            history.push(*record);
        }

        RegistrySnapshot {
            live,
            history,
            total_allocated: inner.total_allocated,
            total_leaked: inner.total_leaked,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<RegistryInner>> {
        // Poisoning would mean a panic inside bookkeeping; losing that one
        // mutation beats taking the program down from the tracking layer.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AllocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn paired_record_release_leaves_no_leaks() {
        let reg = AllocationRegistry::new();
        for i in 0..64usize {
            reg.record(0x1000 + i * 0x10, 8 + i);
        }
        for i in 0..64usize {
            reg.release(0x1000 + i * 0x10);
        }

        let snap = reg.snapshot();
        assert!(snap.live.is_empty());
        assert_eq!(snap.total_leaked, 0);
        assert_eq!(snap.total_allocated, (0..64u64).map(|i| 8 + i).sum::<u64>());
        assert_eq!(snap.history.len(), 64);
    }

    #[test]
    fn concurrent_paired_operations_balance() {
        const THREADS: usize = 4;
        const OPS: usize = 200;

        let reg = Arc::new(AllocationRegistry::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    let base = 0x10_0000 * (t + 1);
                    for i in 0..OPS {
                        let addr = base + i * 0x40;
                        reg.record(addr, 32);
                        reg.release(addr);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = reg.snapshot();
        assert!(snap.live.is_empty());
        assert_eq!(snap.total_leaked, 0);
        assert_eq!(snap.total_allocated, (THREADS * OPS * 32) as u64);
    }

    #[test]
    fn leaked_set_is_exact() {
        let reg = AllocationRegistry::new();
        let leaked = [(0x2000usize, 7usize), (0x3000, 13), (0x4000, 21)];
        for (addr, size) in leaked {
            reg.record(addr, size);
        }
        reg.record(0x5000, 100);
        reg.release(0x5000);

        let snap = reg.snapshot();
        assert_eq!(snap.total_leaked, 7 + 13 + 21);
        let addresses: Vec<usize> = snap.live.iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![0x2000, 0x3000, 0x4000]);
        assert!(snap.total_allocated >= snap.total_leaked);
    }

    #[test]
    fn untracked_release_is_a_noop() {
        let reg = AllocationRegistry::new();
        reg.record(0x1000, 16);

        reg.release(0xdead_0000);
        // Double free of a tracked address: second release is untracked.
        reg.release(0x1000);
        reg.release(0x1000);

        let snap = reg.snapshot();
        assert!(snap.live.is_empty());
        assert_eq!(snap.total_leaked, 0);
        assert_eq!(snap.total_allocated, 16);
    }

    #[test]
    fn release_on_untouched_registry_is_safe() {
        let reg = AllocationRegistry::new();
        reg.release(0x1234);
        let snap = reg.snapshot();
        assert_eq!(snap.total_allocated, 0);
        assert!(snap.history.is_empty());
    }

    #[test]
    fn reused_address_gets_a_fresh_record() {
        let reg = AllocationRegistry::new();
        reg.record(0x8000, 16);
        reg.release(0x8000);
        reg.record(0x8000, 64);

        let snap = reg.snapshot();
        assert_eq!(snap.live.len(), 1);
        assert_eq!(snap.live[0].size, 64);
        assert_eq!(snap.history.len(), 2);
        assert_eq!(snap.total_leaked, 64);
        assert_eq!(snap.total_allocated, 80);
    }

    #[test]
    fn site_info_round_trips() {
        let reg = AllocationRegistry::new();
        reg.record_with_site(0x6000, 8, 1, "x.c", 42);

        let snap = reg.snapshot();
        let site = snap.live[0].site.expect("annotated record carries a site");
        assert_eq!(site.category, 1);
        assert_eq!(site.file, "x.c");
        assert_eq!(site.line, 42);
        assert!(snap.history[0].site.is_some());
    }

    #[test]
    fn teardown_scenario_three_blocks_one_freed() {
        let reg = AllocationRegistry::new();
        let (a, b, c) = (0xa000usize, 0xb000usize, 0xc000usize);
        reg.record(a, 16);
        reg.record(b, 32);
        reg.record(c, 64);
        reg.release(b);

        let snap = reg.snapshot();
        assert_eq!(snap.total_allocated, 112);
        assert_eq!(snap.total_leaked, 80);
        assert_eq!(snap.history.len(), 3);
        assert_eq!(
            snap.history.iter().map(|r| r.size).collect::<Vec<_>>(),
            vec![16, 32, 64]
        );
        let leaked: Vec<(usize, usize)> = snap.live.iter().map(|r| (r.address, r.size)).collect();
        assert_eq!(leaked, vec![(a, 16), (c, 64)]);
    }

    #[test]
    fn disabled_gate_skips_recording_but_not_release() {
        let reg = AllocationRegistry::new();
        reg.record(0x9000, 10);

        reg.set_enabled(false);
        reg.record(0x9100, 20);
        reg.release(0x9000);
        reg.set_enabled(true);

        let snap = reg.snapshot();
        assert!(snap.live.is_empty());
        assert_eq!(snap.total_allocated, 10);
        assert_eq!(snap.total_leaked, 0);
    }

    #[test]
    fn records_carry_a_captured_stack() {
        let reg = AllocationRegistry::new();
        reg.record(0x7000, 4);
        let snap = reg.snapshot();
        let record = &snap.live[0];
        assert!(record.depth as usize <= MAX_STACK_DEPTH);
        assert_eq!(record.stack().len(), record.depth as usize);
    }

    #[test]
    fn snapshot_with_backoff_matches_snapshot() {
        let reg = AllocationRegistry::new();
        reg.record(0x100, 1);
        reg.record(0x200, 2);

        let mut retries = 0usize;
        let snap = reg.snapshot_with_backoff(|| retries += 1);
        assert_eq!(retries, 0);
        assert_eq!(snap.total_allocated, 3);
        assert_eq!(snap.live.len(), 2);
    }
}
