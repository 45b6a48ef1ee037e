//! Sub-allocation of pooled buffer memory.
//!
//! Two pool flavors sit on top of [`ResourceLocation`]:
//!
//! * [`BufferPoolAllocator`] carves long-lived byte ranges out of one large
//!   parent buffer with a free list. Each range is handed out as a
//!   `SubAllocation` location; releasing the location returns the range to
//!   the pool, never touching the parent's reference count.
//! * [`FastAllocator`] bump-allocates transient per-frame ranges as
//!   `FastAllocation` locations whose release is a no-op; the whole page is
//!   reclaimed at once with [`FastAllocator::reset`] after the GPU is done
//!   with the frame.
//!
//! Both pools own their parent resource's single logical reference through
//! an internal location, so dropping the pool routes the parent through the
//! normal deferred-deletion path.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::ResourceDevice;
use crate::error::{ResourceError, ResourceResult};
use crate::location::ResourceLocation;
use crate::resource::GpuResource;
use crate::types::{HeapType, ResourceFlags, ResourceState};

/// Minimum alignment of sub-allocated ranges, in bytes.
///
/// Matches the strictest common requirement (constant-buffer data) so one
/// pool can serve all buffer uses.
pub const SUB_ALLOCATION_ALIGNMENT: u64 = 256;

/// A byte range carved out of a pooled parent resource.
#[derive(Clone)]
pub struct SubAllocatedBlock {
    /// Parent resource the range lives in.
    pub resource: Arc<GpuResource>,
    /// Offset of the range within the parent, in bytes.
    pub offset: u64,
    /// Size of the range, in bytes.
    pub size: u64,
}

impl std::fmt::Debug for SubAllocatedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubAllocatedBlock")
            .field("resource", &self.resource.name())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Reclaims sub-allocated blocks when their owning location is released.
///
/// Implementations must be safe to call from any thread: a location can be
/// dropped on a worker thread while another thread allocates.
pub trait SubAllocator: Send + Sync {
    /// Return `block`'s byte range to the pool.
    fn deallocate(&self, block: &SubAllocatedBlock);
}

/// Free range within the pool, sorted by offset.
#[derive(Debug, Clone, Copy)]
struct FreeRange {
    offset: u64,
    size: u64,
}

struct PoolState {
    free: Vec<FreeRange>,
    allocated_bytes: u64,
}

/// First-fit free-list allocator over one parent buffer.
pub struct BufferPoolAllocator {
    device: Arc<ResourceDevice>,
    resource: Arc<GpuResource>,
    // Owns the parent's single logical reference; dropped with the pool.
    _parent: ResourceLocation,
    size: u64,
    state: Mutex<PoolState>,
}

impl BufferPoolAllocator {
    /// Create a pool backed by a fresh `size`-byte buffer.
    pub fn new(
        device: &Arc<ResourceDevice>,
        size: u64,
        heap_type: HeapType,
        name: &str,
    ) -> ResourceResult<Arc<Self>> {
        let resource = device.create_buffer(
            size,
            ResourceFlags::empty(),
            heap_type,
            ResourceState::COMMON,
            name,
        )?;
        let mut parent = ResourceLocation::new(Arc::clone(device));
        parent.set_resource(Arc::clone(&resource));
        Ok(Arc::new(Self {
            device: Arc::clone(device),
            resource,
            _parent: parent,
            size,
            state: Mutex::new(PoolState {
                free: vec![FreeRange { offset: 0, size }],
                allocated_bytes: 0,
            }),
        }))
    }

    /// Carve `size` bytes out of the pool.
    ///
    /// The returned location is a `SubAllocation`; releasing it returns the
    /// range to this pool. Fails with `AllocationFailed` when no free range
    /// fits.
    pub fn allocate(self: &Arc<Self>, size: u64) -> ResourceResult<ResourceLocation> {
        if size == 0 {
            return Err(ResourceError::InvalidParameter(
                "sub-allocation size must be non-zero".to_string(),
            ));
        }
        let aligned = align_up(size, SUB_ALLOCATION_ALIGNMENT);
        let offset = self.take_range(aligned).ok_or_else(|| {
            ResourceError::AllocationFailed {
                name: self.resource.name().to_string(),
                size: aligned,
                reason: format!(
                    "no free range of {} bytes in {}-byte pool ({} bytes allocated)",
                    aligned,
                    self.size,
                    self.allocated_bytes()
                ),
            }
        })?;

        log::trace!(
            "BufferPoolAllocator: allocated {aligned} bytes at offset {offset} from '{}'",
            self.resource.name()
        );
        let mut location = ResourceLocation::new(Arc::clone(&self.device));
        location.set_sub_allocation(
            Arc::clone(self) as Arc<dyn SubAllocator>,
            SubAllocatedBlock {
                resource: Arc::clone(&self.resource),
                offset,
                size: aligned,
            },
        );
        Ok(location)
    }

    fn take_range(&self, size: u64) -> Option<u64> {
        let mut state = self.state.lock();
        let index = state.free.iter().position(|range| range.size >= size)?;
        let range = &mut state.free[index];
        let offset = range.offset;
        if range.size == size {
            state.free.remove(index);
        } else {
            range.offset += size;
            range.size -= size;
        }
        state.allocated_bytes += size;
        Some(offset)
    }

    /// Bytes currently handed out.
    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated_bytes
    }

    /// Bytes available for allocation (possibly fragmented).
    pub fn free_bytes(&self) -> u64 {
        self.size - self.allocated_bytes()
    }

    /// Total capacity of the pool in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The parent buffer backing the pool.
    pub fn resource(&self) -> &Arc<GpuResource> {
        &self.resource
    }
}

impl SubAllocator for BufferPoolAllocator {
    fn deallocate(&self, block: &SubAllocatedBlock) {
        assert!(
            Arc::ptr_eq(&block.resource, &self.resource),
            "ownership corruption: block returned to the wrong pool"
        );
        let mut state = self.state.lock();
        debug_assert!(state.allocated_bytes >= block.size);
        state.allocated_bytes -= block.size;

        // Insert sorted by offset, then coalesce with both neighbors.
        let index = state
            .free
            .partition_point(|range| range.offset < block.offset);
        state.free.insert(
            index,
            FreeRange {
                offset: block.offset,
                size: block.size,
            },
        );
        if index + 1 < state.free.len()
            && state.free[index].offset + state.free[index].size == state.free[index + 1].offset
        {
            let next_size = state.free[index + 1].size;
            state.free[index].size += next_size;
            state.free.remove(index + 1);
        }
        if index > 0
            && state.free[index - 1].offset + state.free[index - 1].size
                == state.free[index].offset
        {
            let merged_size = state.free[index].size;
            state.free[index - 1].size += merged_size;
            state.free.remove(index);
        }
        log::trace!(
            "BufferPoolAllocator: reclaimed {} bytes at offset {} into '{}'",
            block.size,
            block.offset,
            self.resource.name()
        );
    }
}

/// Linear bump allocator for transient per-frame data.
///
/// Allocations are `FastAllocation` locations with no individual release;
/// the page is recycled wholesale via [`reset`] once a fence proves the GPU
/// has finished reading it.
///
/// [`reset`]: FastAllocator::reset
pub struct FastAllocator {
    device: Arc<ResourceDevice>,
    resource: Arc<GpuResource>,
    _parent: ResourceLocation,
    size: u64,
    head: Mutex<u64>,
}

impl FastAllocator {
    /// Create a fast allocator backed by a fresh `size`-byte page.
    pub fn new(
        device: &Arc<ResourceDevice>,
        size: u64,
        heap_type: HeapType,
        name: &str,
    ) -> ResourceResult<Arc<Self>> {
        let resource = device.create_buffer(
            size,
            ResourceFlags::empty(),
            heap_type,
            ResourceState::COMMON,
            name,
        )?;
        let mut parent = ResourceLocation::new(Arc::clone(device));
        parent.set_resource(Arc::clone(&resource));
        Ok(Arc::new(Self {
            device: Arc::clone(device),
            resource,
            _parent: parent,
            size,
            head: Mutex::new(0),
        }))
    }

    /// Bump-allocate `size` bytes with the given alignment.
    ///
    /// Fails with `AllocationFailed` when the page is exhausted; the caller
    /// is expected to [`reset`] between frames.
    ///
    /// [`reset`]: FastAllocator::reset
    pub fn allocate(&self, size: u64, alignment: u64) -> ResourceResult<ResourceLocation> {
        if size == 0 {
            return Err(ResourceError::InvalidParameter(
                "fast allocation size must be non-zero".to_string(),
            ));
        }
        debug_assert!(alignment.is_power_of_two());
        let mut head = self.head.lock();
        let offset = align_up(*head, alignment);
        if offset + size > self.size {
            return Err(ResourceError::AllocationFailed {
                name: self.resource.name().to_string(),
                size,
                reason: format!(
                    "fast allocator page exhausted ({} of {} bytes used)",
                    *head, self.size
                ),
            });
        }
        *head = offset + size;
        drop(head);

        let mut location = ResourceLocation::new(Arc::clone(&self.device));
        location.set_fast_allocation(Arc::clone(&self.resource), offset, size);
        Ok(location)
    }

    /// Recycle the whole page.
    ///
    /// The caller must have proven (by fence) that no in-flight submission
    /// still reads previously handed-out ranges.
    pub fn reset(&self) {
        *self.head.lock() = 0;
    }

    /// Bytes consumed since the last reset, including alignment padding.
    pub fn used_bytes(&self) -> u64 {
        *self.head.lock()
    }

    /// Total capacity of the page in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::device::{DeviceConfig, ResourceDevice};
    use crate::fence::ManualFence;
    use crate::location::LocationKind;

    fn test_device() -> (Arc<ResourceDevice>, Arc<DummyBackend>, Arc<ManualFence>) {
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
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_pool_allocate_and_release_roundtrip() {
        let (device, backend, _fence) = test_device();
        let pool = BufferPoolAllocator::new(&device, 64 * 1024, HeapType::Upload, "pool").unwrap();
        assert_eq!(backend.live_resource_count(), 1);

        let mut locations = Vec::new();
        for _ in 0..8 {
            let location = pool.allocate(1000).unwrap();
            assert_eq!(location.kind(), LocationKind::SubAllocation);
            assert!(location.mapped_ptr().is_some());
            locations.push(location);
        }
        // Distinct, non-overlapping, aligned ranges out of one parent.
        assert_eq!(pool.allocated_bytes(), 8 * 1024);
        for pair in locations.windows(2) {
            assert!(pair[0].offset() + pair[0].size() <= pair[1].offset());
        }
        for location in &locations {
            assert_eq!(location.offset() % SUB_ALLOCATION_ALIGNMENT, 0);
        }
        // Sub-allocations never touch the parent's logical count.
        assert_eq!(pool.resource().ref_count(), 1);

        locations.clear();
        assert_eq!(pool.allocated_bytes(), 0);
        assert_eq!(pool.free_bytes(), 64 * 1024);
        assert_eq!(backend.live_resource_count(), 1);
    }

    #[test]
    fn test_pool_coalesces_freed_neighbors() {
        let (device, _backend, _fence) = test_device();
        let pool = BufferPoolAllocator::new(&device, 4096, HeapType::Default, "pool").unwrap();

        let a = pool.allocate(1024).unwrap();
        let b = pool.allocate(1024).unwrap();
        let c = pool.allocate(1024).unwrap();
        let _d = pool.allocate(1024).unwrap();
        assert!(pool.allocate(1).is_err());

        // Free a and c (non-adjacent), then b to bridge them.
        drop(a);
        drop(c);
        assert!(pool.allocate(2048).is_err());
        drop(b);
        let big = pool.allocate(3072).unwrap();
        assert_eq!(big.offset(), 0);
    }

    #[test]
    fn test_pool_exhaustion_reports_allocation_failed() {
        let (device, _backend, _fence) = test_device();
        let pool = BufferPoolAllocator::new(&device, 1024, HeapType::Default, "tiny").unwrap();
        let err = pool.allocate(4096).unwrap_err();
        assert!(matches!(err, ResourceError::AllocationFailed { .. }));
    }

    #[test]
    fn test_pool_drop_releases_parent_through_deletion_queue() {
        let (device, backend, fence) = test_device();
        fence.advance_target();
        let pool = BufferPoolAllocator::new(&device, 4096, HeapType::Default, "pool").unwrap();
        drop(pool);

        // Deferred behind the frame fence like any stand-alone resource.
        assert_eq!(backend.live_resource_count(), 1);
        fence.signal_to_target();
        device.release_resources(false);
        assert_eq!(backend.live_resource_count(), 0);
    }

    #[test]
    fn test_fast_allocator_bump_and_reset() {
        let (device, _backend, _fence) = test_device();
        let fast = FastAllocator::new(&device, 4096, HeapType::Upload, "frame page").unwrap();

        let a = fast.allocate(100, 256).unwrap();
        let b = fast.allocate(100, 256).unwrap();
        assert_eq!(a.kind(), LocationKind::FastAllocation);
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 256);
        assert_eq!(fast.used_bytes(), 356);

        // Individual release reclaims nothing.
        drop(a);
        drop(b);
        assert_eq!(fast.used_bytes(), 356);

        fast.reset();
        assert_eq!(fast.used_bytes(), 0);
        let again = fast.allocate(100, 256).unwrap();
        assert_eq!(again.offset(), 0);
    }

    #[test]
    fn test_fast_allocator_exhaustion() {
        let (device, _backend, _fence) = test_device();
        let fast = FastAllocator::new(&device, 512, HeapType::Upload, "page").unwrap();
        let _a = fast.allocate(512, 16).unwrap();
        let err = fast.allocate(1, 16).unwrap_err();
        assert!(matches!(err, ResourceError::AllocationFailed { .. }));
    }
}
