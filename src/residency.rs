//! Explicit residency tracking context.
//!
//! On platforms without full GPU virtual memory, allocations in
//! non-CPU-accessible memory must be tracked so the OS can page them in and
//! out. This crate only owns the bookkeeping side: strictly paired
//! begin/end tracking per allocation, and per-submission working sets that
//! name the allocations an upcoming submission will touch.
//!
//! The manager is an explicit context object constructed alongside the
//! owning device and passed by reference to resource and heap creation; it
//! is not process-global state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Handle to a tracked allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResidencyHandle(u64);

struct TrackedObject {
    name: String,
    size: u64,
}

/// Tracks which allocations are resident in device-accessible memory.
///
/// Tracking must be strictly paired: every [`begin_tracking`] gets exactly
/// one [`end_tracking`] when the allocation is physically destroyed. A
/// missing end is a leak in this manager; an end without a begin (or a
/// second end) is a fatal misuse and panics.
///
/// [`begin_tracking`]: ResidencyManager::begin_tracking
/// [`end_tracking`]: ResidencyManager::end_tracking
pub struct ResidencyManager {
    next_id: AtomicU64,
    tracked: Mutex<HashMap<u64, TrackedObject>>,
    resident_bytes: AtomicU64,
}

impl ResidencyManager {
    /// Create an empty residency manager.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tracked: Mutex::new(HashMap::new()),
            resident_bytes: AtomicU64::new(0),
        }
    }

    /// Start tracking an allocation of `size` bytes.
    ///
    /// Returns the handle the owner must pass to [`end_tracking`] exactly
    /// once when the allocation is destroyed.
    ///
    /// [`end_tracking`]: ResidencyManager::end_tracking
    pub fn begin_tracking(&self, name: &str, size: u64) -> ResidencyHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tracked.lock().insert(
            id,
            TrackedObject {
                name: name.to_string(),
                size,
            },
        );
        self.resident_bytes.fetch_add(size, Ordering::Relaxed);
        log::trace!("ResidencyManager: begin tracking '{name}' ({size} bytes) as {id}");
        ResidencyHandle(id)
    }

    /// Stop tracking an allocation.
    ///
    /// # Panics
    ///
    /// Panics if the handle is not currently tracked (double end, or end
    /// without a paired begin) — the residency invariants are already broken
    /// and continuing is unsafe.
    pub fn end_tracking(&self, handle: ResidencyHandle) {
        let removed = self.tracked.lock().remove(&handle.0);
        match removed {
            Some(object) => {
                self.resident_bytes.fetch_sub(object.size, Ordering::Relaxed);
                log::trace!(
                    "ResidencyManager: end tracking '{}' ({} bytes)",
                    object.name,
                    object.size
                );
            }
            None => panic!(
                "residency mismatch: end_tracking({}) without a live begin",
                handle.0
            ),
        }
    }

    /// Insert a tracked handle into a per-submission working set.
    ///
    /// # Panics
    ///
    /// Panics if the handle is not tracked: the submission would reference
    /// an allocation whose residency lifetime already ended.
    pub fn insert_into_working_set(&self, set: &mut ResidencySet, handle: ResidencyHandle) {
        assert!(
            self.tracked.lock().contains_key(&handle.0),
            "residency mismatch: working set references untracked handle {}",
            handle.0
        );
        set.handles.insert(handle);
    }

    /// Number of allocations currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Total bytes currently tracked as resident.
    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Relaxed)
    }
}

impl Default for ResidencyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResidencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidencyManager")
            .field("tracked_count", &self.tracked_count())
            .field("resident_bytes", &self.resident_bytes())
            .finish()
    }
}

/// Working set of allocations referenced by one upcoming GPU submission.
///
/// Built on the submitting thread, then handed to the OS residency API as a
/// unit. Inserting the same handle twice is fine; the set deduplicates.
#[derive(Debug, Default)]
pub struct ResidencySet {
    handles: HashSet<ResidencyHandle>,
}

impl ResidencySet {
    /// Create an empty working set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct handles in the set.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Whether the set contains the given handle.
    pub fn contains(&self, handle: ResidencyHandle) -> bool {
        self.handles.contains(&handle)
    }

    /// Clear the set for reuse by the next submission.
    pub fn clear(&mut self) {
        self.handles.clear();
    }
}

static_assertions::assert_impl_all!(ResidencyManager: Send, Sync);
