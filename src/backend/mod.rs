//! Native GPU backend abstraction.
//!
//! The lifetime machinery in this crate never talks to a GPU API directly;
//! it goes through the [`NativeBackend`] trait, which covers exactly the
//! surface the resource factory and the deletion queue need: creating
//! committed/placed resources and heaps, and releasing their native handles.
//!
//! # Available Backends
//!
//! - [`dummy`]: in-memory backend for tests and headless runs
//! - `vulkan` (feature `vulkan-backend`): native Vulkan via `ash` and
//!   `gpu-allocator`

pub mod dummy;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

use crate::error::ResourceResult;
use crate::types::{ClearValue, HeapDescriptor, HeapFlags, HeapProperties, ResourceDescriptor, ResourceState};

/// Opaque handle to a native resource allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeResourceHandle(pub(crate) u64);

impl NativeResourceHandle {
    /// Raw handle value, for logging.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Opaque handle to a native heap allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHeapHandle(pub(crate) u64);

impl NativeHeapHandle {
    /// Raw handle value, for logging.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Result of a native resource creation call.
#[derive(Debug)]
pub struct CreatedResource {
    /// The native handle.
    pub handle: NativeResourceHandle,
    /// GPU virtual address of the allocation (0 when the backend does not
    /// expose one for this resource kind).
    pub gpu_virtual_address: u64,
    /// Persistently mapped CPU pointer, present only for CPU-accessible
    /// memory classes.
    pub mapped_ptr: Option<*mut u8>,
}

/// Interface to the native resource/heap creation API.
///
/// All methods may be called from any thread.
pub trait NativeBackend: Send + Sync + 'static {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Create a resource with its own dedicated backing memory.
    fn create_committed_resource(
        &self,
        desc: &ResourceDescriptor,
        heap_props: &HeapProperties,
        heap_flags: HeapFlags,
        initial_state: ResourceState,
        clear_value: Option<&ClearValue>,
    ) -> ResourceResult<CreatedResource>;

    /// Create a heap that placed resources can be carved from.
    fn create_heap(&self, desc: &HeapDescriptor) -> ResourceResult<NativeHeapHandle>;

    /// Create a resource bound into an existing heap at a byte offset.
    fn create_placed_resource(
        &self,
        desc: &ResourceDescriptor,
        heap: NativeHeapHandle,
        offset: u64,
        initial_state: ResourceState,
    ) -> ResourceResult<CreatedResource>;

    /// Release a native resource handle.
    ///
    /// The caller guarantees the device is no longer referencing the
    /// allocation (fence-gated by the deletion queue).
    fn release_resource(&self, handle: NativeResourceHandle);

    /// Release a native heap handle.
    ///
    /// The caller guarantees no live placed resource still points into it.
    fn release_heap(&self, handle: NativeHeapHandle);
}
