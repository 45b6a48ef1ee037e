//! GPU fence abstraction.
//!
//! A fence is a monotonically increasing counter tied to a device command
//! queue. The CPU side advances the *target* value when work is submitted;
//! the device writes the *completed* value once all work up to a submission
//! point has finished. Deferred deletion captures the target value at
//! enqueue time and only frees once that value is observed as complete.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic timeline fence consumed by the deletion queue.
///
/// Implementations wrap the native primitive (a D3D12 fence, a Vulkan
/// timeline semaphore). Values are nondecreasing and signal in submission
/// order, so `is_complete(v)` implies `is_complete(w)` for all `w <= v`.
pub trait Fence: Send + Sync {
    /// The value the fence will hold once all GPU work submitted up to this
    /// point has finished.
    fn current_target_value(&self) -> u64;

    /// The highest value the device has signaled so far.
    fn last_completed_value(&self) -> u64;

    /// Whether all work up to `value` has completed on the device.
    fn is_complete(&self, value: u64) -> bool {
        value <= self.last_completed_value()
    }
}

/// CPU-driven fence for the dummy backend and tests.
///
/// The "GPU" side is simulated by calling [`ManualFence::signal`]; the
/// submitting side advances the target with [`ManualFence::advance_target`].
#[derive(Debug)]
pub struct ManualFence {
    target: AtomicU64,
    completed: AtomicU64,
}

impl ManualFence {
    /// Create a fence with target and completed values both at zero.
    pub fn new() -> Self {
        Self {
            target: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Advance the target value by one, as a queue submission would, and
    /// return the new target.
    pub fn advance_target(&self) -> u64 {
        self.target.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Simulate device progress: mark all values up to `value` complete.
    ///
    /// Completed values never move backwards; signaling a lower value than
    /// already observed is a no-op.
    pub fn signal(&self, value: u64) {
        self.completed.fetch_max(value, Ordering::AcqRel);
    }

    /// Mark everything submitted so far as complete.
    pub fn signal_to_target(&self) {
        self.signal(self.target.load(Ordering::Acquire));
    }
}

impl Default for ManualFence {
    fn default() -> Self {
        Self::new()
    }
}

impl Fence for ManualFence {
    fn current_target_value(&self) -> u64 {
        self.target.load(Ordering::Acquire)
    }

    fn last_completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

static_assertions::assert_impl_all!(ManualFence: Send, Sync);
