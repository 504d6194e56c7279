//! Partitioned allocation for the immutable heap.
//!
//! ## Design
//!
//! - **Parts**: each worker thread checks out a [`Part`] with a private byte
//!   budget and bump-allocates inside it with no locking at all
//! - **Conservative accounting**: an outstanding part is counted at its full
//!   budget, so [`ImmutableHeap::estimated_used`] never under-reports
//! - **Merge protocol**: released parts queue on an unmerged registry and are
//!   folded into one traceable heap before any whole-heap operation
//! - **Budget-driven triggering**: [`ImmutableHeap::release_part`] tells the
//!   caller when an immutable collection is due
//!
//! The manager's mutex covers only the bookkeeping sections of
//! acquire/release/merge, never an allocation inside a part. Whole-heap
//! operations require the collector driver to have reached a stop-the-world
//! state first; violations fail fast.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_utils::CachePadded;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::object::Address;
use crate::space::Space;

/// Tuning knobs for the immutable heap.
#[derive(Debug, Clone)]
pub struct ImmutableHeapConfig {
    /// Number of worker threads that may hold parts concurrently.
    pub workers: usize,
    /// Allocation limit in effect until the first collection recomputes it.
    pub initial_limit: usize,
    /// Smallest budget a part is ever issued with.
    pub min_part_budget: usize,
    /// Memory budget shared with the mutable generation; growth of the
    /// mutable heap narrows the immutable heap's headroom under this cap.
    pub combined_budget: usize,
}

impl Default for ImmutableHeapConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            workers,
            initial_limit: 32 * 1024 * workers,
            min_part_budget: 256,
            combined_budget: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// Per-part budget policy.
///
/// The default divides the allocation limit evenly over the worker count. A
/// scheduler that tracks its active thread count can substitute a policy
/// keyed on that instead.
pub trait BudgetPolicy: Send + Sync {
    /// Budget for the next part, given the current allocation limit and the
    /// configured worker count.
    fn part_budget(&self, allocation_limit: usize, workers: usize) -> usize;
}

/// Default policy: every worker gets an equal share of the allocation limit,
/// so N threads allocating in parallel reach the limit at roughly the same
/// time. This approximates a 2x growth strategy per collection cycle.
#[derive(Debug, Default)]
pub struct FairShare;

impl BudgetPolicy for FairShare {
    fn part_budget(&self, allocation_limit: usize, workers: usize) -> usize {
        allocation_limit / workers.max(1)
    }
}

/// A unit of thread-local allocation capacity: a budgeted [`Space`] plus the
/// usage snapshot taken when the part was handed out.
///
/// A part is in exactly one of three states: *outstanding* (moved out to a
/// worker thread), *unmerged* (moved back into the manager's registry), or
/// freed (dropped during [`ImmutableHeap::merge_parts`]). Ownership transfers
/// are Rust moves, so no aliasing of an outstanding part is possible.
pub struct Part {
    space: Space,
    budget: usize,
    /// Baseline for [`Part::newly_allocated`]; moves on [`Part::reset_used`].
    used_at_acquire: usize,
    /// Usage when the manager handed the part out. Fixed while the part is
    /// outstanding; the release-side accounting subtracts exactly this value.
    acquired_used: usize,
}

impl Part {
    fn new(budget: usize) -> Self {
        Self {
            space: Space::with_budget(budget),
            budget,
            used_at_acquire: 0,
            acquired_used: 0,
        }
    }

    /// The part's block allocator.
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// The part's block allocator, for allocation.
    pub fn space_mut(&mut self) -> &mut Space {
        &mut self.space
    }

    /// Maximum bytes this part may allocate before its owner should release
    /// it.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Cumulative bytes allocated in this part.
    pub fn used(&self) -> usize {
        self.space.used()
    }

    /// Bytes allocated since the last [`Part::reset_used`] (or since the
    /// part was handed out).
    pub fn newly_allocated(&self) -> usize {
        self.space.used() - self.used_at_acquire
    }

    /// Re-snapshot the usage baseline. Used when a part is reissued without
    /// being destroyed. Bytes allocated before the reset stay in the space
    /// and reappear in the accounting once the part is merged.
    pub fn reset_used(&mut self) {
        self.used_at_acquire = self.space.used();
    }

    fn into_space(self) -> Space {
        self.space
    }
}

/// Counters describing manager activity since startup.
#[derive(Debug, Default, Clone)]
pub struct ImmutableHeapStats {
    /// Parts handed out.
    pub parts_acquired: u64,
    /// Parts returned.
    pub parts_released: u64,
    /// Releases that signaled "collect now".
    pub collect_requests: u64,
    /// Calls to [`ImmutableHeap::merge_parts`].
    pub merges: u64,
    /// Bytes folded into the accumulated heap across all merges.
    pub bytes_merged: usize,
}

/// State reachable only through the manager's mutex.
struct MergedState {
    /// The accumulated, collector-visible heap. Grows only via merge.
    heap: Space,
    /// Released parts awaiting fold-in.
    unmerged: Vec<Part>,
    stats: ImmutableHeapStats,
}

/// Pressure counters mirrored outside the mutex so the estimates are plain
/// atomic reads. All writes happen while the mutex is held; within one
/// operation, additions are ordered before subtractions so a concurrent
/// reader can only ever over-count.
struct Counters {
    outstanding_parts: CachePadded<AtomicUsize>,
    outstanding_allocated: CachePadded<AtomicUsize>,
    outstanding_budget: CachePadded<AtomicUsize>,
    unmerged_allocated: CachePadded<AtomicUsize>,
    unmerged_size: CachePadded<AtomicUsize>,
    merged_used: CachePadded<AtomicUsize>,
    merged_size: CachePadded<AtomicUsize>,
    allocation_limit: CachePadded<AtomicUsize>,
}

/// Manager for the immutable-object heap.
///
/// Constructed once at VM startup and shared (behind an `Arc`) with worker
/// threads and the collector driver.
pub struct ImmutableHeap {
    config: ImmutableHeapConfig,
    policy: Box<dyn BudgetPolicy>,
    state: Mutex<MergedState>,
    counters: Counters,
}

impl Default for ImmutableHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl ImmutableHeap {
    /// New manager with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ImmutableHeapConfig::default())
    }

    /// New manager with a custom configuration.
    pub fn with_config(config: ImmutableHeapConfig) -> Self {
        Self::with_policy(config, Box::new(FairShare))
    }

    /// New manager with a custom configuration and budget policy.
    pub fn with_policy(config: ImmutableHeapConfig, policy: Box<dyn BudgetPolicy>) -> Self {
        assert!(config.workers > 0, "worker count must be non-zero");
        let counters = Counters {
            outstanding_parts: CachePadded::new(AtomicUsize::new(0)),
            outstanding_allocated: CachePadded::new(AtomicUsize::new(0)),
            outstanding_budget: CachePadded::new(AtomicUsize::new(0)),
            unmerged_allocated: CachePadded::new(AtomicUsize::new(0)),
            unmerged_size: CachePadded::new(AtomicUsize::new(0)),
            merged_used: CachePadded::new(AtomicUsize::new(0)),
            merged_size: CachePadded::new(AtomicUsize::new(0)),
            allocation_limit: CachePadded::new(AtomicUsize::new(config.initial_limit)),
        };
        Self {
            config,
            policy,
            state: Mutex::new(MergedState {
                heap: Space::unlimited(),
                unmerged: Vec::new(),
                stats: ImmutableHeapStats::default(),
            }),
            counters,
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &ImmutableHeapConfig {
        &self.config
    }

    /// Check out a part for thread-local allocation.
    ///
    /// The budget is the policy's share of the current allocation limit,
    /// clamped up to the minimum so a worker always gets a usable part even
    /// under extreme memory pressure.
    pub fn acquire_part(&self) -> Part {
        let budget = self
            .next_part_budget()
            .max(self.config.min_part_budget);
        let part = Part::new(budget);

        let mut state = self.state.lock();
        self.counters
            .outstanding_parts
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .outstanding_budget
            .fetch_add(budget, Ordering::Relaxed);
        self.counters
            .outstanding_allocated
            .fetch_add(part.acquired_used, Ordering::Relaxed);
        state.stats.parts_acquired += 1;
        drop(state);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "stoat::gc",
            budget,
            outstanding = self.outstanding_parts(),
            "immutable part acquired"
        );

        part
    }

    /// Return a part to the manager.
    ///
    /// The caller contract is that this is called after an allocation failure
    /// inside the part; that is how the manager learns a budget was consumed
    /// under real pressure. Returns `true` when the caller should trigger an
    /// immutable collection: estimated usage has crossed the allocation
    /// limit, or no further part could be issued with a non-trivial budget.
    pub fn release_part(&self, part: Part) -> bool {
        let mut state = self.state.lock();
        assert!(
            self.counters.outstanding_parts.load(Ordering::Relaxed) > 0,
            "release_part called with no parts outstanding"
        );

        let newly_allocated = part.newly_allocated();
        // Additions first: a concurrent estimate may double-count this part
        // for a moment but never drops it.
        self.counters
            .unmerged_allocated
            .fetch_add(newly_allocated, Ordering::Relaxed);
        self.counters
            .unmerged_size
            .fetch_add(part.space().size(), Ordering::Relaxed);
        // Subtract exactly the hand-out snapshot recorded at acquire; the
        // reset baseline can move while the part is outstanding.
        self.counters
            .outstanding_allocated
            .fetch_sub(part.acquired_used, Ordering::Relaxed);
        self.counters
            .outstanding_budget
            .fetch_sub(part.budget(), Ordering::Relaxed);
        self.counters
            .outstanding_parts
            .fetch_sub(1, Ordering::Relaxed);

        state.unmerged.push(part);
        state.stats.parts_released += 1;

        let should_collect = self.estimated_used() >= self.allocation_limit()
            || self.next_part_budget() < self.config.min_part_budget;
        if should_collect {
            state.stats.collect_requests += 1;
        }
        drop(state);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "stoat::gc",
            newly_allocated,
            estimated_used = self.estimated_used(),
            limit = self.allocation_limit(),
            should_collect,
            "immutable part released"
        );

        should_collect
    }

    /// Fold every released part into the accumulated heap.
    ///
    /// Must not be called while any part is outstanding; that is a
    /// coordination bug in the collector driver and fails fast. Calling with
    /// nothing released is a no-op.
    pub fn merge_parts(&self) {
        let mut state = self.state.lock();
        assert_eq!(
            self.counters.outstanding_parts.load(Ordering::Relaxed),
            0,
            "merge_parts requires all parts to be released"
        );

        let parts = std::mem::take(&mut state.unmerged);
        let part_count = parts.len();
        let mut merged_bytes = 0;
        for part in parts {
            merged_bytes += part.used();
            let space = part.into_space();
            state.heap.adopt(space);
        }

        // Refresh the merged mirrors before zeroing the unmerged counters;
        // a concurrent estimate may briefly double-count, never under-count.
        self.counters
            .merged_used
            .store(state.heap.used(), Ordering::Relaxed);
        self.counters
            .merged_size
            .store(state.heap.size(), Ordering::Relaxed);
        self.counters.unmerged_allocated.store(0, Ordering::Relaxed);
        self.counters.unmerged_size.store(0, Ordering::Relaxed);

        state.stats.merges += 1;
        state.stats.bytes_merged += merged_bytes;
        drop(state);

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "stoat::gc",
            parts = part_count,
            merged_bytes,
            heap_used = self.counters.merged_used.load(Ordering::Relaxed),
            "unmerged parts folded into immutable heap"
        );
        #[cfg(not(feature = "gc_logging"))]
        let _ = part_count;
    }

    /// Invoke `visitor` on every traceable pointer slot in the accumulated
    /// heap. Requires zero outstanding and zero unmerged parts.
    pub fn iterate_program_pointers(&self, visitor: &mut dyn FnMut(*mut Address)) {
        let mut state = self.state.lock();
        self.assert_whole_heap(&state);
        state.heap.iterate_pointers(visitor);
    }

    /// The accumulated heap, for low-level collector operations. Requires
    /// zero outstanding and zero unmerged parts.
    pub fn heap(&self) -> MappedMutexGuard<'_, Space> {
        let state = self.state.lock();
        self.assert_whole_heap(&state);
        MutexGuard::map(state, |state| &mut state.heap)
    }

    /// Recompute the allocation limit after an immutable collection.
    ///
    /// The immutable and mutable generations share `combined_budget`; the new
    /// limit is the doubling-growth target capped by whatever headroom the
    /// mutable heap left, floored at one minimum part budget per worker.
    /// Requires zero outstanding and zero unmerged parts.
    pub fn update_limit_after_gc(&self, mutable_size_at_last_gc: usize) {
        let state = self.state.lock();
        self.assert_whole_heap(&state);

        let floor = self.config.min_part_budget * self.config.workers;
        let grown = state.heap.used().saturating_mul(2);
        let headroom = self
            .config
            .combined_budget
            .saturating_sub(mutable_size_at_last_gc);
        let limit = grown.min(headroom).max(floor);
        self.counters
            .allocation_limit
            .store(limit, Ordering::Relaxed);
        drop(state);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "stoat::gc",
            limit,
            mutable_size_at_last_gc,
            "immutable allocation limit updated"
        );
    }

    /// Over-approximation of used bytes: accumulated heap usage, plus
    /// unmerged allocations, plus outstanding parts counted at allocated +
    /// full budget. Safe to call at any time; never under-reports.
    pub fn estimated_used(&self) -> usize {
        let c = &self.counters;
        c.merged_used.load(Ordering::Relaxed)
            + c.unmerged_allocated.load(Ordering::Relaxed)
            + c.outstanding_allocated.load(Ordering::Relaxed)
            + c.outstanding_budget.load(Ordering::Relaxed)
    }

    /// Over-approximation of the heap's total size, including bump slack in
    /// merged and unmerged chunks. Safe to call at any time.
    pub fn estimated_size(&self) -> usize {
        let c = &self.counters;
        c.merged_size.load(Ordering::Relaxed)
            + c.unmerged_size.load(Ordering::Relaxed)
            + c.outstanding_allocated.load(Ordering::Relaxed)
            + c.outstanding_budget.load(Ordering::Relaxed)
    }

    /// Total-bytes threshold above which a collection should be triggered.
    pub fn allocation_limit(&self) -> usize {
        self.counters.allocation_limit.load(Ordering::Relaxed)
    }

    /// Number of parts currently checked out.
    pub fn outstanding_parts(&self) -> usize {
        self.counters.outstanding_parts.load(Ordering::Relaxed)
    }

    /// Number of released parts not yet merged.
    pub fn unmerged_parts(&self) -> usize {
        self.state.lock().unmerged.len()
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> ImmutableHeapStats {
        self.state.lock().stats.clone()
    }

    fn next_part_budget(&self) -> usize {
        self.policy
            .part_budget(self.allocation_limit(), self.config.workers)
    }

    fn assert_whole_heap(&self, state: &MergedState) {
        assert_eq!(
            self.counters.outstanding_parts.load(Ordering::Relaxed),
            0,
            "whole-heap operation requires all parts to be released"
        );
        assert!(
            state.unmerged.is_empty(),
            "whole-heap operation requires merge_parts to have run"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(workers: usize, initial_limit: usize) -> ImmutableHeapConfig {
        ImmutableHeapConfig {
            workers,
            initial_limit,
            min_part_budget: 256,
            combined_budget: 1024 * 1024,
        }
    }

    #[test]
    fn test_part_budget_is_fair_share_of_limit() {
        let heap = ImmutableHeap::with_config(config(4, 4096));
        let part = heap.acquire_part();
        assert_eq!(part.budget(), 1024);
        heap.release_part(part);
    }

    #[test]
    fn test_part_budget_clamped_to_minimum() {
        let heap = ImmutableHeap::with_config(config(4, 100));
        let part = heap.acquire_part();
        assert_eq!(part.budget(), 256);
        heap.release_part(part);
    }

    #[test]
    fn test_acquire_release_accounting() {
        let heap = ImmutableHeap::with_config(config(2, 8192));
        assert_eq!(heap.outstanding_parts(), 0);
        assert_eq!(heap.estimated_used(), 0);

        let mut part = heap.acquire_part();
        assert_eq!(heap.outstanding_parts(), 1);
        // An outstanding part counts at its full budget.
        assert_eq!(heap.estimated_used(), 4096);

        part.space_mut().allocate_object(0, 56).unwrap();
        // Allocations inside an outstanding part do not move the estimate.
        assert_eq!(heap.estimated_used(), 4096);

        heap.release_part(part);
        assert_eq!(heap.outstanding_parts(), 0);
        assert_eq!(heap.unmerged_parts(), 1);
        // After release only the actually allocated bytes remain counted.
        assert_eq!(heap.estimated_used(), 64);
    }

    #[test]
    fn test_release_below_limit_does_not_request_collection() {
        let heap = ImmutableHeap::with_config(config(2, 65536));
        let mut part = heap.acquire_part();
        part.space_mut().allocate_object(0, 92).unwrap();
        assert!(!heap.release_part(part));
        assert_eq!(heap.stats().collect_requests, 0);
    }

    #[test]
    fn test_release_past_limit_requests_collection() {
        let heap = ImmutableHeap::with_config(config(1, 1024));
        let mut part = heap.acquire_part();
        while part.space_mut().allocate_object(0, 120).is_ok() {}
        assert!(heap.release_part(part));
        assert_eq!(heap.stats().collect_requests, 1);
    }

    #[test]
    fn test_degenerate_budget_biases_toward_collection() {
        // Limit so small that the fair share rounds below the minimum.
        let heap = ImmutableHeap::with_config(config(8, 64));
        let part = heap.acquire_part();
        assert_eq!(part.budget(), 256);
        assert!(heap.release_part(part));
    }

    #[test]
    fn test_merge_folds_parts_and_resets_counters() {
        let heap = ImmutableHeap::with_config(config(2, 8192));
        for _ in 0..3 {
            let mut part = heap.acquire_part();
            part.space_mut().allocate_object(1, 48).unwrap();
            heap.release_part(part);
        }
        assert_eq!(heap.unmerged_parts(), 3);

        heap.merge_parts();
        assert_eq!(heap.unmerged_parts(), 0);
        // 8 header + 8 slot + 48 payload = 64 bytes per part.
        assert_eq!(heap.estimated_used(), 192);

        let stats = heap.stats();
        assert_eq!(stats.merges, 1);
        assert_eq!(stats.bytes_merged, 192);
    }

    #[test]
    fn test_merge_with_nothing_released_is_noop() {
        let heap = ImmutableHeap::with_config(config(2, 8192));
        heap.merge_parts();
        heap.merge_parts();
        assert_eq!(heap.estimated_used(), 0);
        assert_eq!(heap.unmerged_parts(), 0);
    }

    #[test]
    fn test_update_limit_doubles_merged_usage() {
        let heap = ImmutableHeap::with_config(config(2, 8192));
        let mut part = heap.acquire_part();
        for _ in 0..16 {
            part.space_mut().allocate_object(0, 120).unwrap();
        }
        heap.release_part(part);
        heap.merge_parts();

        heap.update_limit_after_gc(0);
        // 16 * 128 = 2048 merged bytes, doubled.
        assert_eq!(heap.allocation_limit(), 4096);
    }

    #[test]
    fn test_update_limit_narrowed_by_mutable_growth() {
        let mut cfg = config(2, 8192);
        cfg.combined_budget = 4096;
        let heap = ImmutableHeap::with_config(cfg);
        let mut part = heap.acquire_part();
        for _ in 0..16 {
            part.space_mut().allocate_object(0, 120).unwrap();
        }
        heap.release_part(part);
        heap.merge_parts();

        // The mutable generation consumed most of the combined budget.
        heap.update_limit_after_gc(3584);
        assert_eq!(heap.allocation_limit(), 512);

        // Fully consumed: the limit floors at one minimum budget per worker.
        heap.update_limit_after_gc(4096);
        assert_eq!(heap.allocation_limit(), 512);
    }

    #[test]
    fn test_custom_budget_policy() {
        struct Fixed(usize);
        impl BudgetPolicy for Fixed {
            fn part_budget(&self, _limit: usize, _workers: usize) -> usize {
                self.0
            }
        }

        let heap = ImmutableHeap::with_policy(config(4, 4096), Box::new(Fixed(2048)));
        let part = heap.acquire_part();
        assert_eq!(part.budget(), 2048);
        heap.release_part(part);
    }

    #[test]
    fn test_part_reset_used() {
        let heap = ImmutableHeap::with_config(config(2, 8192));
        let mut part = heap.acquire_part();
        part.space_mut().allocate_object(0, 24).unwrap();
        assert_eq!(part.newly_allocated(), 32);

        part.reset_used();
        assert_eq!(part.newly_allocated(), 0);
        assert_eq!(part.used(), 32);

        // Only bytes new since the baseline are attributed at release; no
        // counter may wrap.
        heap.release_part(part);
        assert_eq!(heap.estimated_used(), 0);
        assert_eq!(heap.outstanding_parts(), 0);

        // The merge recomputes from the space itself, so the pre-reset
        // bytes reappear.
        heap.merge_parts();
        assert_eq!(heap.estimated_used(), 32);
    }

    #[test]
    #[should_panic(expected = "release_part called with no parts outstanding")]
    fn test_release_without_acquire_panics() {
        let heap = ImmutableHeap::with_config(config(2, 8192));
        // Forge a part that the manager never issued.
        let part = Part::new(1024);
        heap.release_part(part);
    }

    #[test]
    #[should_panic(expected = "merge_parts requires all parts to be released")]
    fn test_merge_with_outstanding_part_panics() {
        let heap = ImmutableHeap::with_config(config(2, 8192));
        let _part = heap.acquire_part();
        heap.merge_parts();
    }
}
