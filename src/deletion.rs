//! Fence-gated deferred deletion.
//!
//! GPU command execution is asynchronous relative to the submitting thread:
//! freeing backing memory as soon as the last CPU-side reference drops would
//! corrupt the device if a submitted command list still reads it. Instead,
//! the final release is enqueued here together with the fence value the
//! command queue will reach once all work submitted so far has finished.
//! An entry is only physically freed once that value is observed as
//! complete.
//!
//! The sweep that checks completion and frees entries can run in three
//! modes (see [`DeferredDeletionQueue::release_resources`]): a synchronous
//! sweep on the calling thread, a batched one-shot background worker that
//! takes the walk off the critical rendering path, and an unconditional
//! shutdown drain used at device teardown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::backend::{NativeBackend, NativeResourceHandle};
use crate::fence::Fence;
use crate::residency::ResidencyManager;
use crate::resource::{GpuHeap, GpuResource};

/// Upper bound on entries handed to one background batch.
pub const ASYNC_DELETION_BATCH_SIZE: usize = 4096;

/// What a deletion entry refers to.
pub enum DeletionPayload {
    /// A logical resource; the entry owns its final reference.
    Resource(Arc<GpuResource>),
    /// A heap; released without an ownership assertion.
    Heap(Arc<GpuHeap>),
    /// A raw native handle with no logical wrapper.
    Native(NativeResourceHandle),
}

struct DeletionEntry {
    payload: DeletionPayload,
    fence: Arc<dyn Fence>,
    /// Fence target value captured at enqueue time.
    value: u64,
}

impl DeletionEntry {
    fn is_fence_complete(&self) -> bool {
        self.fence.is_complete(self.value)
    }
}

/// Per-device queue of resources awaiting a safe point to be freed.
///
/// Multi-producer: [`enqueue`] may be called from any thread.
/// Single-active-consumer: at most one sweep (foreground or background) is
/// releasing entries at a time.
///
/// [`enqueue`]: DeferredDeletionQueue::enqueue
pub struct DeferredDeletionQueue {
    backend: Arc<dyn NativeBackend>,
    residency: Arc<ResidencyManager>,
    entries: Mutex<VecDeque<DeletionEntry>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Read once at device creation; selects the async worker path.
    async_enabled: bool,
}

impl DeferredDeletionQueue {
    /// Create an empty queue bound to a backend and residency context.
    pub fn new(
        backend: Arc<dyn NativeBackend>,
        residency: Arc<ResidencyManager>,
        async_enabled: bool,
    ) -> Self {
        Self {
            backend,
            residency,
            entries: Mutex::new(VecDeque::new()),
            worker: Mutex::new(None),
            async_enabled,
        }
    }

    /// Enqueue a payload, capturing the fence's current target value.
    ///
    /// The captured value is the value the fence will hold once all GPU work
    /// submitted up to this point has finished; the payload is not freed
    /// before that value completes. Once enqueued an entry cannot be
    /// withdrawn — it already has no remaining external references.
    pub fn enqueue(&self, payload: DeletionPayload, fence: &Arc<dyn Fence>) {
        if let DeletionPayload::Resource(resource) = &payload {
            debug_assert_eq!(
                resource.ref_count(),
                1,
                "enqueued resource '{}' must be solely owned by its queue entry",
                resource.name()
            );
            log::trace!(
                "DeferredDeletionQueue: enqueued '{}' at fence value {}",
                resource.name(),
                fence.current_target_value()
            );
        }
        self.entries.lock().push_back(DeletionEntry {
            payload,
            value: fence.current_target_value(),
            fence: Arc::clone(fence),
        });
    }

    /// Number of entries still awaiting release.
    pub fn pending_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether a background batch is currently running.
    pub fn worker_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Release queue entries. The only per-frame entry point.
    ///
    /// - `shutdown == true`: joins any in-flight background batch, then
    ///   synchronously releases *everything* regardless of fence state,
    ///   logging each forcibly released object. Blocking; teardown only.
    /// - `shutdown == false`, async disabled: releases the fence-complete
    ///   prefix of the queue on the calling thread. Non-blocking; partial
    ///   progress is normal.
    /// - `shutdown == false`, async enabled: if no batch is running, moves
    ///   up to [`ASYNC_DELETION_BATCH_SIZE`] fence-complete entries into a
    ///   private batch and spawns a one-shot worker thread to release them.
    ///   The calling thread never blocks.
    pub fn release_resources(&self, shutdown: bool) {
        if shutdown {
            self.join_worker();
            self.drain_all();
            return;
        }

        if self.async_enabled {
            self.spawn_async_batch();
        } else {
            self.sweep_completed();
        }
    }

    /// Synchronous sweep: release the fence-complete prefix of the queue.
    ///
    /// Fence values signal in submission order, so once the head entry's
    /// value is incomplete every later entry on the same fence is too.
    fn sweep_completed(&self) {
        loop {
            let entry = {
                let mut entries = self.entries.lock();
                match entries.front() {
                    Some(head) if head.is_fence_complete() => entries.pop_front(),
                    _ => None,
                }
            };
            match entry {
                Some(entry) => release_payload(entry.payload, &*self.backend, &self.residency),
                None => break,
            }
        }
    }

    /// Collect a batch of fence-complete entries and release them on a
    /// one-shot background thread.
    fn spawn_async_batch(&self) {
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                // A batch is still in flight; the next call will pick up.
                return;
            }
            // Reap the finished thread before starting another.
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }

        let mut batch = Vec::new();
        {
            let mut entries = self.entries.lock();
            while batch.len() < ASYNC_DELETION_BATCH_SIZE {
                match entries.front() {
                    Some(head) if head.is_fence_complete() => {
                        batch.push(entries.pop_front().expect("head checked above"));
                    }
                    _ => break,
                }
            }
        }
        if batch.is_empty() {
            return;
        }

        log::trace!(
            "DeferredDeletionQueue: spawning async batch of {} entries",
            batch.len()
        );
        let batch_worker = AsyncDeletionWorker {
            batch,
            backend: Arc::clone(&self.backend),
            residency: Arc::clone(&self.residency),
        };
        *worker = Some(std::thread::spawn(move || batch_worker.do_work()));
    }

    /// Shutdown drain: release everything, fence-complete or not.
    fn drain_all(&self) {
        let drained: Vec<DeletionEntry> = self.entries.lock().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        log::debug!(
            "DeferredDeletionQueue: shutdown drain releasing {} entries",
            drained.len()
        );
        for entry in drained {
            match &entry.payload {
                DeletionPayload::Resource(resource) => {
                    let desc = resource.descriptor();
                    log::warn!(
                        "force-releasing '{}' at shutdown ({:?} {}x{}x{}, {:?}, fence value {})",
                        resource.name(),
                        desc.dimension,
                        desc.width,
                        desc.height,
                        desc.depth_or_array_size,
                        desc.format,
                        entry.value
                    );
                }
                DeletionPayload::Heap(heap) => {
                    log::warn!(
                        "force-releasing heap '{}' at shutdown ({} bytes)",
                        heap.name(),
                        heap.size()
                    );
                }
                DeletionPayload::Native(handle) => {
                    log::warn!("force-releasing native handle {} at shutdown", handle.raw());
                }
            }
            release_payload(entry.payload, &*self.backend, &self.residency);
        }
    }

    /// Block until any in-flight background batch has completed.
    fn join_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for DeferredDeletionQueue {
    fn drop(&mut self) {
        // The queue must outlive its worker; join before the fields it
        // borrows from go away.
        self.join_worker();
        if self.pending_count() != 0 {
            log::warn!(
                "DeferredDeletionQueue dropped with {} pending entries; draining",
                self.pending_count()
            );
            self.drain_all();
        }
    }
}

impl std::fmt::Debug for DeferredDeletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredDeletionQueue")
            .field("pending_count", &self.pending_count())
            .field("async_enabled", &self.async_enabled)
            .field("worker_running", &self.worker_running())
            .finish()
    }
}

/// One-shot background task that releases a private batch of entries whose
/// fence has already completed.
struct AsyncDeletionWorker {
    batch: Vec<DeletionEntry>,
    backend: Arc<dyn NativeBackend>,
    residency: Arc<ResidencyManager>,
}

impl AsyncDeletionWorker {
    fn do_work(self) {
        let count = self.batch.len();
        for entry in self.batch {
            debug_assert!(entry.is_fence_complete());
            release_payload(entry.payload, &*self.backend, &self.residency);
        }
        log::trace!("AsyncDeletionWorker: released {count} entries");
    }
}

/// Final-release checkpoint shared by all three release modes.
///
/// Logical resource entries must be solely owned by their queue entry; a
/// count other than one here means an `alias`/`transfer_ownership`
/// bookkeeping step was missed and the free cannot proceed safely.
fn release_payload(payload: DeletionPayload, backend: &dyn NativeBackend, residency: &ResidencyManager) {
    match payload {
        DeletionPayload::Resource(resource) => {
            assert_eq!(
                resource.ref_count(),
                1,
                "ownership corruption: deferred '{}' released with {} references",
                resource.name(),
                resource.ref_count()
            );
            resource.release();
            resource.destroy_native(backend, residency);
        }
        DeletionPayload::Heap(heap) => {
            heap.destroy_native(backend, residency);
        }
        DeletionPayload::Native(handle) => {
            backend.release_resource(handle);
        }
    }
}

static_assertions::assert_impl_all!(DeferredDeletionQueue: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::NativeBackend as _;
    use crate::fence::ManualFence;
    use crate::types::{DeviceMask, HeapFlags, HeapProperties, HeapType, ResourceDescriptor, ResourceFlags, ResourceState};

    struct TestContext {
        backend: Arc<DummyBackend>,
        residency: Arc<ResidencyManager>,
        fence_impl: Arc<ManualFence>,
        fence: Arc<dyn Fence>,
    }

    impl TestContext {
        fn new() -> Self {
            let fence_impl = Arc::new(ManualFence::new());
            Self {
                backend: Arc::new(DummyBackend::new()),
                residency: Arc::new(ResidencyManager::new()),
                fence: fence_impl.clone(),
                fence_impl,
            }
        }

        fn queue(&self, async_enabled: bool) -> DeferredDeletionQueue {
            DeferredDeletionQueue::new(self.backend.clone(), self.residency.clone(), async_enabled)
        }

        fn create_resource(&self, name: &str) -> Arc<GpuResource> {
            let desc = ResourceDescriptor::buffer(128, ResourceFlags::empty()).with_name(name);
            let created = self
                .backend
                .create_committed_resource(
                    &desc,
                    &HeapProperties::new(HeapType::Default, 0),
                    HeapFlags::empty(),
                    ResourceState::COMMON,
                    None,
                )
                .unwrap();
            Arc::new(GpuResource::new(
                created,
                desc,
                None,
                None,
                DeviceMask::for_device(0),
                ResourceState::COMMON,
            ))
        }
    }

    #[test]
    fn test_fence_gated_release() {
        let ctx = TestContext::new();
        let queue = ctx.queue(false);

        // Submit work up to fence value 5; device has only reached 3.
        for _ in 0..5 {
            ctx.fence_impl.advance_target();
        }
        ctx.fence_impl.signal(3);

        let resource = ctx.create_resource("gated");
        queue.enqueue(DeletionPayload::Resource(resource), &ctx.fence);
        assert_eq!(queue.pending_count(), 1);

        // Fence not complete yet: the sweep must leave the entry alone.
        queue.release_resources(false);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(ctx.backend.live_resource_count(), 1);

        // Device reaches the captured value: a subsequent call frees it.
        ctx.fence_impl.signal(5);
        queue.release_resources(false);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(ctx.backend.live_resource_count(), 0);
    }

    #[test]
    fn test_sweep_stops_at_incomplete_prefix() {
        let ctx = TestContext::new();
        let queue = ctx.queue(false);

        ctx.fence_impl.advance_target(); // value 1
        let first = ctx.create_resource("first");
        queue.enqueue(DeletionPayload::Resource(first), &ctx.fence);

        ctx.fence_impl.advance_target(); // value 2
        let second = ctx.create_resource("second");
        queue.enqueue(DeletionPayload::Resource(second), &ctx.fence);

        ctx.fence_impl.signal(1);
        queue.release_resources(false);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(ctx.backend.live_resource_count(), 1);

        ctx.fence_impl.signal(2);
        queue.release_resources(false);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_shutdown_drain_ignores_fences() {
        let ctx = TestContext::new();
        let queue = ctx.queue(true);

        ctx.fence_impl.advance_target();
        for i in 0..4 {
            let resource = ctx.create_resource(&format!("leak_{i}"));
            queue.enqueue(DeletionPayload::Resource(resource), &ctx.fence);
        }
        // Fence never signals, but shutdown releases everything anyway.
        queue.release_resources(true);
        assert_eq!(queue.pending_count(), 0);
        assert!(!queue.worker_running());
        assert_eq!(ctx.backend.live_resource_count(), 0);
    }

    #[test]
    fn test_async_batch_releases_off_thread() {
        let ctx = TestContext::new();
        let queue = ctx.queue(true);

        ctx.fence_impl.advance_target();
        for i in 0..16 {
            let resource = ctx.create_resource(&format!("async_{i}"));
            queue.enqueue(DeletionPayload::Resource(resource), &ctx.fence);
        }
        ctx.fence_impl.signal_to_target();

        queue.release_resources(false);
        // The batch was taken out of the queue synchronously...
        assert_eq!(queue.pending_count(), 0);
        // ...and the shutdown join guarantees the worker finished its frees.
        queue.release_resources(true);
        assert!(!queue.worker_running());
        assert_eq!(ctx.backend.live_resource_count(), 0);
    }

    #[test]
    fn test_async_incomplete_entries_stay_queued() {
        let ctx = TestContext::new();
        let queue = ctx.queue(true);

        ctx.fence_impl.advance_target();
        let resource = ctx.create_resource("pending");
        queue.enqueue(DeletionPayload::Resource(resource), &ctx.fence);

        queue.release_resources(false);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(ctx.backend.live_resource_count(), 1);

        ctx.fence_impl.signal_to_target();
        queue.release_resources(true);
        assert_eq!(ctx.backend.live_resource_count(), 0);
    }

    #[test]
    fn test_native_handle_entry() {
        let ctx = TestContext::new();
        let queue = ctx.queue(false);

        let resource = ctx.create_resource("raw");
        let handle = resource.native();
        // Hand the raw handle over; the logical wrapper is forgotten on
        // purpose (this path exists for allocations with no wrapper at all).
        resource.release();
        std::mem::forget(resource);

        queue.enqueue(DeletionPayload::Native(handle), &ctx.fence);
        queue.release_resources(false);
        assert!(!ctx.backend.is_resource_live(handle));
    }

    #[test]
    fn test_enqueue_from_multiple_threads() {
        let ctx = TestContext::new();
        let queue = Arc::new(ctx.queue(false));

        ctx.fence_impl.advance_target();
        let mut handles = Vec::new();
        for t in 0..4 {
            let queue = Arc::clone(&queue);
            let fence = Arc::clone(&ctx.fence);
            let backend = Arc::clone(&ctx.backend);
            handles.push(std::thread::spawn(move || {
                for i in 0..8 {
                    let desc = ResourceDescriptor::buffer(64, ResourceFlags::empty())
                        .with_name(&format!("t{t}_{i}"));
                    let created = backend
                        .create_committed_resource(
                            &desc,
                            &HeapProperties::new(HeapType::Default, 0),
                            HeapFlags::empty(),
                            ResourceState::COMMON,
                            None,
                        )
                        .unwrap();
                    let resource = Arc::new(GpuResource::new(
                        created,
                        desc,
                        None,
                        None,
                        DeviceMask::for_device(0),
                        ResourceState::COMMON,
                    ));
                    queue.enqueue(DeletionPayload::Resource(resource), &fence);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.pending_count(), 32);

        ctx.fence_impl.signal_to_target();
        queue.release_resources(false);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(ctx.backend.live_resource_count(), 0);
    }
}
