//! Per-device resource context and factory.
//!
//! [`ResourceDevice`] bundles the contexts that were process-wide singletons
//! in older designs — the native backend, the residency manager and the
//! deferred deletion queue — into one explicit object constructed alongside
//! the device and passed by reference to everything that creates or frees
//! resources. Lifetime is tied to the object: dropping the device joins the
//! deletion worker and drains the queue.

use std::sync::Arc;

use crate::backend::NativeBackend;
use crate::deletion::{DeferredDeletionQueue, DeletionPayload};
use crate::error::{ResourceError, ResourceResult};
use crate::fence::Fence;
use crate::residency::ResidencyManager;
use crate::resource::{GpuHeap, GpuResource};
use crate::types::{
    ClearValue, HeapDescriptor, HeapFlags, HeapProperties, HeapType, ResourceDescriptor,
    ResourceFlags, ResourceState,
};

/// Configuration read once at device creation.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Release fence-complete deletion entries on a background worker
    /// instead of the calling thread.
    pub async_deletion: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            async_deletion: true,
        }
    }
}

/// Per-device context owning the resource factory and lifetime machinery.
///
/// Created once per GPU node; shared via `Arc` between the threads that
/// create, reference and release resources.
pub struct ResourceDevice {
    backend: Arc<dyn NativeBackend>,
    residency: Arc<ResidencyManager>,
    deletion_queue: DeferredDeletionQueue,
    /// Fence of the device's command queue; deferred frees gate on it.
    frame_fence: Arc<dyn Fence>,
    device_index: u32,
}

impl ResourceDevice {
    /// Create a device context over a native backend.
    pub fn new(
        backend: Arc<dyn NativeBackend>,
        frame_fence: Arc<dyn Fence>,
        device_index: u32,
        config: DeviceConfig,
    ) -> Arc<Self> {
        let residency = Arc::new(ResidencyManager::new());
        let deletion_queue = DeferredDeletionQueue::new(
            Arc::clone(&backend),
            Arc::clone(&residency),
            config.async_deletion,
        );
        log::debug!(
            "ResourceDevice {}: backend '{}', async deletion {}",
            device_index,
            backend.name(),
            config.async_deletion
        );
        Arc::new(Self {
            backend,
            residency,
            deletion_queue,
            frame_fence,
            device_index,
        })
    }

    /// The native backend.
    pub fn backend(&self) -> &Arc<dyn NativeBackend> {
        &self.backend
    }

    /// The residency manager for this device.
    pub fn residency(&self) -> &Arc<ResidencyManager> {
        &self.residency
    }

    /// The deferred deletion queue for this device.
    pub fn deletion_queue(&self) -> &DeferredDeletionQueue {
        &self.deletion_queue
    }

    /// The command-queue fence deferred frees gate on.
    pub fn frame_fence(&self) -> &Arc<dyn Fence> {
        &self.frame_fence
    }

    /// Index of this device in its adapter group.
    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    // ------------------------------------------------------------------
    // Factory
    // ------------------------------------------------------------------

    /// Create a resource with dedicated backing memory.
    ///
    /// Derives extra heap flags from the descriptor (a shared heap when
    /// simultaneous multi-engine access is requested) and starts residency
    /// tracking when the memory class is not CPU-accessible.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::AllocationFailed`] when the native creation
    /// call fails; the requesting descriptor is logged.
    pub fn create_committed_resource(
        self: &Arc<Self>,
        desc: &ResourceDescriptor,
        heap_props: &HeapProperties,
        initial_state: ResourceState,
        clear_value: Option<&ClearValue>,
    ) -> ResourceResult<Arc<GpuResource>> {
        let heap_flags = derive_heap_flags(desc);

        let created = self
            .backend
            .create_committed_resource(desc, heap_props, heap_flags, initial_state, clear_value)
            .inspect_err(|err| log_allocation_failure(desc, err))?;

        let residency = if heap_props.heap_type.is_cpu_accessible() {
            None
        } else {
            Some(
                self.residency
                    .begin_tracking(desc.name_or_unnamed(), desc.estimated_size()),
            )
        };

        log::trace!(
            "ResourceDevice {}: committed '{}' ({} bytes, {:?})",
            self.device_index,
            desc.name_or_unnamed(),
            desc.estimated_size(),
            heap_props.heap_type
        );
        Ok(Arc::new(GpuResource::new(
            created,
            desc.clone(),
            None,
            residency,
            heap_props.visible_mask,
            initial_state,
        )))
    }

    /// Strict-verification variant of [`create_committed_resource`]:
    /// allocation failure is a fatal diagnostic rather than a result.
    ///
    /// [`create_committed_resource`]: ResourceDevice::create_committed_resource
    pub fn create_committed_resource_verified(
        self: &Arc<Self>,
        desc: &ResourceDescriptor,
        heap_props: &HeapProperties,
        initial_state: ResourceState,
        clear_value: Option<&ClearValue>,
    ) -> Arc<GpuResource> {
        match self.create_committed_resource(desc, heap_props, initial_state, clear_value) {
            Ok(resource) => resource,
            Err(err) => panic!(
                "failed to create committed resource '{}' ({:?} {}x{}x{}, {:?}): {err}",
                desc.name_or_unnamed(),
                desc.dimension,
                desc.width,
                desc.height,
                desc.depth_or_array_size,
                desc.format
            ),
        }
    }

    /// Create a resource bound into an existing heap at a byte offset.
    ///
    /// Placed resources do not start their own residency tracking — the
    /// backing heap is the tracked allocation.
    pub fn create_placed_resource(
        self: &Arc<Self>,
        desc: &ResourceDescriptor,
        heap: &Arc<GpuHeap>,
        offset: u64,
        initial_state: ResourceState,
    ) -> ResourceResult<Arc<GpuResource>> {
        let created = self
            .backend
            .create_placed_resource(desc, heap.native(), offset, initial_state)
            .inspect_err(|err| log_allocation_failure(desc, err))?;

        log::trace!(
            "ResourceDevice {}: placed '{}' in heap '{}' at offset {}",
            self.device_index,
            desc.name_or_unnamed(),
            heap.name(),
            offset
        );
        Ok(Arc::new(GpuResource::new(
            created,
            desc.clone(),
            Some(Arc::clone(heap)),
            None,
            heap.visible_mask(),
            initial_state,
        )))
    }

    /// Create a buffer: builds a buffer-shaped descriptor and delegates to
    /// [`create_committed_resource`].
    ///
    /// [`create_committed_resource`]: ResourceDevice::create_committed_resource
    pub fn create_buffer(
        self: &Arc<Self>,
        size: u64,
        flags: ResourceFlags,
        heap_type: HeapType,
        initial_state: ResourceState,
        name: &str,
    ) -> ResourceResult<Arc<GpuResource>> {
        if size == 0 {
            return Err(ResourceError::InvalidParameter(
                "buffer size cannot be zero".to_string(),
            ));
        }
        let desc = ResourceDescriptor::buffer(size, flags).with_name(name);
        let heap_props = HeapProperties::new(heap_type, self.device_index);
        self.create_committed_resource(&desc, &heap_props, initial_state, None)
    }

    /// Create a standalone heap for placed resources.
    ///
    /// Residency tracking covers the whole heap; resources placed into it
    /// are not tracked individually.
    pub fn create_heap(self: &Arc<Self>, desc: &HeapDescriptor) -> ResourceResult<Arc<GpuHeap>> {
        let native = self.backend.create_heap(desc)?;
        let residency = if desc.properties.heap_type.is_cpu_accessible() {
            None
        } else {
            Some(self.residency.begin_tracking(
                desc.name.as_deref().unwrap_or("<unnamed>"),
                desc.size,
            ))
        };
        log::trace!(
            "ResourceDevice {}: heap '{}' ({} bytes)",
            self.device_index,
            desc.name.as_deref().unwrap_or("<unnamed>"),
            desc.size
        );
        Ok(Arc::new(GpuHeap::new(native, desc, residency)))
    }

    // ------------------------------------------------------------------
    // Release paths
    // ------------------------------------------------------------------

    /// Hand a solely-owned resource to the deletion queue, gated on the
    /// device's frame fence.
    pub(crate) fn defer_destroy_resource(&self, resource: Arc<GpuResource>) {
        self.deletion_queue
            .enqueue(DeletionPayload::Resource(resource), &self.frame_fence);
    }

    /// Release a resource's native allocation on the calling thread.
    pub(crate) fn destroy_resource_now(&self, resource: &GpuResource) {
        resource.destroy_native(&*self.backend, &self.residency);
    }

    /// Queue a heap for fence-gated release.
    ///
    /// The caller must have released every placed resource in the heap
    /// first (or queued them ahead of the heap on the same fence).
    pub fn destroy_heap(&self, heap: Arc<GpuHeap>) {
        self.deletion_queue
            .enqueue(DeletionPayload::Heap(heap), &self.frame_fence);
    }

    /// Per-frame deletion tick; see
    /// [`DeferredDeletionQueue::release_resources`].
    pub fn release_resources(&self, shutdown: bool) {
        self.deletion_queue.release_resources(shutdown);
    }
}

impl std::fmt::Debug for ResourceDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDevice")
            .field("device_index", &self.device_index)
            .field("backend", &self.backend.name())
            .field("pending_deletions", &self.deletion_queue.pending_count())
            .finish()
    }
}

/// Extra heap flags implied by a resource descriptor.
fn derive_heap_flags(desc: &ResourceDescriptor) -> HeapFlags {
    let mut flags = HeapFlags::empty();
    if desc
        .flags
        .intersects(ResourceFlags::SIMULTANEOUS_ACCESS | ResourceFlags::CROSS_ADAPTER)
    {
        flags |= HeapFlags::SHARED;
    }
    flags
}

fn log_allocation_failure(desc: &ResourceDescriptor, err: &ResourceError) {
    log::error!(
        "allocation failed: '{}' {:?} {}x{}x{} {:?} flags {:?}: {err}",
        desc.name_or_unnamed(),
        desc.dimension,
        desc.width,
        desc.height,
        desc.depth_or_array_size,
        desc.format,
        desc.flags
    );
}

static_assertions::assert_impl_all!(ResourceDevice: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::fence::ManualFence;
    use crate::types::ResourceFormat;

    fn create_test_device() -> (Arc<ResourceDevice>, Arc<DummyBackend>, Arc<ManualFence>) {
        let backend = Arc::new(DummyBackend::new());
        let fence = Arc::new(ManualFence::new());
        let device = ResourceDevice::new(
            backend.clone(),
            fence.clone(),
            0,
            DeviceConfig {
                async_deletion: false,
            },
        );
        (device, backend, fence)
    }

    #[test]
    fn test_create_buffer() {
        let (device, backend, _) = create_test_device();
        let buffer = device
            .create_buffer(
                4096,
                ResourceFlags::empty(),
                HeapType::Default,
                ResourceState::COMMON,
                "vertices",
            )
            .unwrap();
        assert_eq!(buffer.ref_count(), 1);
        assert!(buffer.should_defer_delete());
        assert!(!buffer.is_placed());
        assert_eq!(backend.live_resource_count(), 1);
        // Default-heap memory is residency-tracked.
        assert_eq!(device.residency().tracked_count(), 1);
        assert_eq!(device.residency().resident_bytes(), 4096);

        device.destroy_resource_now(&buffer);
        assert_eq!(device.residency().tracked_count(), 0);
    }

    #[test]
    fn test_create_buffer_zero_size() {
        let (device, _, _) = create_test_device();
        let result = device.create_buffer(
            0,
            ResourceFlags::empty(),
            HeapType::Default,
            ResourceState::COMMON,
            "empty",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_upload_buffer_not_residency_tracked() {
        let (device, _, _) = create_test_device();
        let buffer = device
            .create_buffer(
                256,
                ResourceFlags::empty(),
                HeapType::Upload,
                ResourceState::COMMON,
                "staging",
            )
            .unwrap();
        assert!(buffer.residency_handle().is_none());
        assert!(buffer.mapped_ptr().is_some());
        assert_eq!(device.residency().tracked_count(), 0);
        device.destroy_resource_now(&buffer);
    }

    #[test]
    fn test_simultaneous_access_derives_shared_heap() {
        let desc = ResourceDescriptor::texture_2d(
            64,
            64,
            ResourceFormat::Rgba8Unorm,
            ResourceFlags::RENDER_TARGET | ResourceFlags::SIMULTANEOUS_ACCESS,
        );
        assert_eq!(derive_heap_flags(&desc), HeapFlags::SHARED);

        let plain = ResourceDescriptor::buffer(64, ResourceFlags::empty());
        assert_eq!(derive_heap_flags(&plain), HeapFlags::empty());
    }

    #[test]
    fn test_allocation_failure_is_recoverable() {
        let (device, backend, _) = create_test_device();
        backend.fail_next_allocation();
        let result = device.create_buffer(
            64,
            ResourceFlags::empty(),
            HeapType::Default,
            ResourceState::COMMON,
            "doomed",
        );
        assert!(matches!(result, Err(ResourceError::AllocationFailed { .. })));
        // No residency tracking leaked from the failed attempt.
        assert_eq!(device.residency().tracked_count(), 0);
    }

    #[test]
    #[should_panic(expected = "failed to create committed resource")]
    fn test_verified_creation_panics_on_failure() {
        let (device, backend, _) = create_test_device();
        backend.fail_next_allocation();
        let desc = ResourceDescriptor::buffer(64, ResourceFlags::empty()).with_name("doomed");
        let _ = device.create_committed_resource_verified(
            &desc,
            &HeapProperties::new(HeapType::Default, 0),
            ResourceState::COMMON,
            None,
        );
    }

    #[test]
    fn test_placed_resource_lifecycle() {
        let (device, backend, fence) = create_test_device();
        let heap = device
            .create_heap(
                &HeapDescriptor::new(1 << 16, HeapProperties::new(HeapType::Default, 0))
                    .with_name("pool_heap"),
            )
            .unwrap();
        // Heap tracked; placed resources are not tracked individually.
        assert_eq!(device.residency().tracked_count(), 1);

        let placed = device
            .create_placed_resource(
                &ResourceDescriptor::buffer(1024, ResourceFlags::empty()).with_name("placed"),
                &heap,
                4096,
                ResourceState::COMMON,
            )
            .unwrap();
        assert!(placed.is_placed());
        assert!(placed.residency_handle().is_none());
        assert_eq!(device.residency().tracked_count(), 1);

        // Destroying the placed resource leaves the heap untouched.
        device.destroy_resource_now(&placed);
        assert!(backend.is_heap_live(heap.native()));
        assert_eq!(device.residency().tracked_count(), 1);

        let heap_handle = heap.native();
        device.destroy_heap(heap);
        fence.signal_to_target();
        device.release_resources(false);
        assert!(!backend.is_heap_live(heap_handle));
        assert_eq!(device.residency().tracked_count(), 0);
    }
}
