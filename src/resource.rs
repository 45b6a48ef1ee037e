//! GPU resource and heap wrappers.
//!
//! [`GpuResource`] is a thin wrapper over a native allocation plus the
//! lifetime state this crate manages: an intrusive logical reference count,
//! a defer-delete flag, and an optional residency handle. The *logical*
//! count tracks ownership obligations held by [`ResourceLocation`] values
//! and the deletion queue; the surrounding `Arc` only keeps the Rust object
//! alive and has no bearing on when the native handle is released.
//!
//! [`ResourceLocation`]: crate::location::ResourceLocation

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::backend::{CreatedResource, NativeBackend, NativeHeapHandle, NativeResourceHandle};
use crate::residency::{ResidencyHandle, ResidencyManager, ResidencySet};
use crate::types::{DeviceMask, HeapDescriptor, ResourceDescriptor, ResourceState};

/// A native GPU allocation with intrusive lifetime state.
///
/// Created by the resource factory with a logical reference count of one;
/// the creator (usually a `ResourceLocation`) owns that first reference.
/// When the count reaches zero the native handle is released, either
/// immediately or through the deferred deletion queue depending on the
/// defer-delete flag.
pub struct GpuResource {
    native: NativeResourceHandle,
    desc: ResourceDescriptor,
    /// Backing heap for placed resources; `None` for committed resources.
    heap: Option<Arc<GpuHeap>>,
    ref_count: AtomicU32,
    defer_delete: AtomicBool,
    residency: Option<ResidencyHandle>,
    /// Opaque synchronization state, owned by the caller's barrier tracking.
    sync_state: AtomicU32,
    gpu_virtual_address: u64,
    mapped_ptr: Option<*mut u8>,
    visible_mask: DeviceMask,
    destroyed: AtomicBool,
}

// SAFETY: the mapped pointer is a persistently mapped allocation owned by
// the backend; it is only dereferenced by callers that already synchronize
// CPU access. All other fields are atomics or immutable after creation.
unsafe impl Send for GpuResource {}
unsafe impl Sync for GpuResource {}

impl GpuResource {
    /// Wrap a freshly created native resource (called by the factory).
    ///
    /// Starts with a logical reference count of one and defer-delete
    /// enabled; transient allocations opt out via [`set_defer_delete`].
    ///
    /// [`set_defer_delete`]: GpuResource::set_defer_delete
    pub(crate) fn new(
        created: CreatedResource,
        desc: ResourceDescriptor,
        heap: Option<Arc<GpuHeap>>,
        residency: Option<ResidencyHandle>,
        visible_mask: DeviceMask,
        initial_state: ResourceState,
    ) -> Self {
        Self {
            native: created.handle,
            desc,
            heap,
            ref_count: AtomicU32::new(1),
            defer_delete: AtomicBool::new(true),
            residency,
            sync_state: AtomicU32::new(initial_state.0),
            gpu_virtual_address: created.gpu_virtual_address,
            mapped_ptr: created.mapped_ptr,
            visible_mask,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Increment the logical reference count; returns the new count.
    pub fn add_ref(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the logical reference count; returns the new count.
    ///
    /// # Panics
    ///
    /// Panics on underflow — a release without a matching reference means
    /// the ownership bookkeeping is already corrupt.
    pub fn release(&self) -> u32 {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(
            previous != 0,
            "ownership corruption: released '{}' with zero references",
            self.desc.name_or_unnamed()
        );
        previous - 1
    }

    /// Current logical reference count.
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Set whether this resource must go through the deferred deletion
    /// queue when its last reference drops.
    pub fn set_defer_delete(&self, defer: bool) {
        self.defer_delete.store(defer, Ordering::Release);
    }

    /// Whether the final release must be fence-gated.
    pub fn should_defer_delete(&self) -> bool {
        self.defer_delete.load(Ordering::Acquire)
    }

    /// The native handle.
    pub fn native(&self) -> NativeResourceHandle {
        self.native
    }

    /// The creation descriptor.
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.desc
    }

    /// Debug name from the descriptor.
    pub fn name(&self) -> &str {
        self.desc.name_or_unnamed()
    }

    /// Backing heap, present only for placed resources.
    pub fn heap(&self) -> Option<&Arc<GpuHeap>> {
        self.heap.as_ref()
    }

    /// Whether this resource was placed into an existing heap.
    pub fn is_placed(&self) -> bool {
        self.heap.is_some()
    }

    /// GPU virtual address of the allocation base.
    pub fn gpu_virtual_address(&self) -> u64 {
        self.gpu_virtual_address
    }

    /// Persistently mapped CPU pointer, for CPU-accessible memory.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped_ptr
    }

    /// Devices this resource is visible to.
    pub fn visible_mask(&self) -> DeviceMask {
        self.visible_mask
    }

    /// Residency handle, present for tracked (non-CPU-accessible) memory.
    pub fn residency_handle(&self) -> Option<ResidencyHandle> {
        self.residency
    }

    /// Opaque synchronization state.
    pub fn sync_state(&self) -> ResourceState {
        ResourceState(self.sync_state.load(Ordering::Acquire))
    }

    /// Update the opaque synchronization state.
    pub fn set_sync_state(&self, state: ResourceState) {
        self.sync_state.store(state.0, Ordering::Release);
    }

    /// Insert this resource into the working set of an upcoming submission.
    ///
    /// Placed resources insert their backing heap's handle instead — the
    /// heap is the tracked allocation.
    pub fn update_residency(&self, manager: &ResidencyManager, set: &mut ResidencySet) {
        if let Some(heap) = &self.heap {
            heap.update_residency(manager, set);
        } else if let Some(handle) = self.residency {
            manager.insert_into_working_set(set, handle);
        }
    }

    /// Release the native allocation and end residency tracking.
    ///
    /// Called from the immediate-release path or from the deletion queue
    /// once the gating fence value has completed.
    ///
    /// # Panics
    ///
    /// Panics if called twice — a double physical free of device memory.
    pub(crate) fn destroy_native(&self, backend: &dyn NativeBackend, residency: &ResidencyManager) {
        let was_destroyed = self.destroyed.swap(true, Ordering::AcqRel);
        assert!(
            !was_destroyed,
            "double release of GPU resource '{}'",
            self.name()
        );
        backend.release_resource(self.native);
        if let Some(handle) = self.residency {
            residency.end_tracking(handle);
        }
    }
}

impl Drop for GpuResource {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            log::warn!(
                "GpuResource '{}' dropped without native release ({} bytes leaked)",
                self.name(),
                self.desc.estimated_size()
            );
        }
    }
}

impl std::fmt::Debug for GpuResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuResource")
            .field("name", &self.name())
            .field("native", &self.native)
            .field("ref_count", &self.ref_count())
            .field("defer_delete", &self.should_defer_delete())
            .field("placed", &self.is_placed())
            .finish()
    }
}

/// A native heap that placed resources are carved from.
///
/// Heaps own their backing memory but are not part of the logical
/// reference-count protocol: placed resources hold an `Arc<GpuHeap>` purely
/// to keep the Rust object alive, and the heap's native memory is released
/// only through an explicit device call.
pub struct GpuHeap {
    native: NativeHeapHandle,
    name: String,
    size: u64,
    residency: Option<ResidencyHandle>,
    visible_mask: DeviceMask,
    destroyed: AtomicBool,
}

impl GpuHeap {
    /// Wrap a freshly created native heap (called by the factory).
    pub(crate) fn new(
        native: NativeHeapHandle,
        desc: &HeapDescriptor,
        residency: Option<ResidencyHandle>,
    ) -> Self {
        Self {
            native,
            name: desc.name.clone().unwrap_or_else(|| "<unnamed>".to_string()),
            size: desc.size,
            residency,
            visible_mask: desc.properties.visible_mask,
            destroyed: AtomicBool::new(false),
        }
    }

    /// The native heap handle.
    pub fn native(&self) -> NativeHeapHandle {
        self.native
    }

    /// Heap size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Devices this heap is visible to.
    pub fn visible_mask(&self) -> DeviceMask {
        self.visible_mask
    }

    /// Residency handle, present for tracked (non-CPU-accessible) memory.
    pub fn residency_handle(&self) -> Option<ResidencyHandle> {
        self.residency
    }

    /// Insert this heap into the working set of an upcoming submission.
    pub fn update_residency(&self, manager: &ResidencyManager, set: &mut ResidencySet) {
        if let Some(handle) = self.residency {
            manager.insert_into_working_set(set, handle);
        }
    }

    /// Release the native heap and end residency tracking.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub(crate) fn destroy_native(&self, backend: &dyn NativeBackend, residency: &ResidencyManager) {
        let was_destroyed = self.destroyed.swap(true, Ordering::AcqRel);
        assert!(!was_destroyed, "double release of GPU heap '{}'", self.name);
        backend.release_heap(self.native);
        if let Some(handle) = self.residency {
            residency.end_tracking(handle);
        }
    }
}

impl Drop for GpuHeap {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            log::warn!(
                "GpuHeap '{}' dropped without native release ({} bytes leaked)",
                self.name,
                self.size
            );
        }
    }
}

impl std::fmt::Debug for GpuHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuHeap")
            .field("name", &self.name)
            .field("native", &self.native)
            .field("size", &self.size)
            .finish()
    }
}

static_assertions::assert_impl_all!(GpuResource: Send, Sync);
static_assertions::assert_impl_all!(GpuHeap: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::NativeBackend;
    use crate::types::{HeapFlags, HeapProperties, HeapType, ResourceFlags};

    fn create_test_resource(backend: &DummyBackend) -> GpuResource {
        let desc = ResourceDescriptor::buffer(256, ResourceFlags::empty()).with_name("test");
        let created = backend
            .create_committed_resource(
                &desc,
                &HeapProperties::new(HeapType::Default, 0),
                HeapFlags::empty(),
                ResourceState::COMMON,
                None,
            )
            .unwrap();
        GpuResource::new(created, desc, None, None, DeviceMask::for_device(0), ResourceState::COMMON)
    }

    #[test]
    fn test_ref_count_arithmetic() {
        let backend = DummyBackend::new();
        let residency = ResidencyManager::new();
        let resource = create_test_resource(&backend);

        assert_eq!(resource.ref_count(), 1);
        assert_eq!(resource.add_ref(), 2);
        assert_eq!(resource.add_ref(), 3);
        assert_eq!(resource.release(), 2);
        assert_eq!(resource.release(), 1);
        assert_eq!(resource.release(), 0);

        resource.destroy_native(&backend, &residency);
        assert_eq!(backend.live_resource_count(), 0);
    }

    #[test]
    #[should_panic(expected = "ownership corruption")]
    fn test_release_underflow_panics() {
        let backend = DummyBackend::new();
        let resource = create_test_resource(&backend);
        resource.release();
        resource.release();
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn test_double_destroy_panics() {
        let backend = DummyBackend::new();
        let residency = ResidencyManager::new();
        let resource = create_test_resource(&backend);
        resource.destroy_native(&backend, &residency);
        resource.destroy_native(&backend, &residency);
    }

    #[test]
    fn test_defer_delete_flag() {
        let backend = DummyBackend::new();
        let residency = ResidencyManager::new();
        let resource = create_test_resource(&backend);
        assert!(resource.should_defer_delete());
        resource.set_defer_delete(false);
        assert!(!resource.should_defer_delete());
        resource.destroy_native(&backend, &residency);
    }

    #[test]
    fn test_residency_ended_on_destroy() {
        let backend = DummyBackend::new();
        let residency = ResidencyManager::new();

        let desc = ResourceDescriptor::buffer(512, ResourceFlags::empty()).with_name("tracked");
        let created = backend
            .create_committed_resource(
                &desc,
                &HeapProperties::new(HeapType::Default, 0),
                HeapFlags::empty(),
                ResourceState::COMMON,
                None,
            )
            .unwrap();
        let handle = residency.begin_tracking("tracked", 512);
        let resource = GpuResource::new(
            created,
            desc,
            None,
            Some(handle),
            DeviceMask::for_device(0),
            ResourceState::COMMON,
        );
        assert_eq!(residency.tracked_count(), 1);

        let mut set = ResidencySet::new();
        resource.update_residency(&residency, &mut set);
        assert_eq!(set.len(), 1);

        resource.destroy_native(&backend, &residency);
        assert_eq!(residency.tracked_count(), 0);
    }
}
