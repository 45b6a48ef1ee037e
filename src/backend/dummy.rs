//! Dummy native backend for testing and development.
//!
//! This backend performs no real GPU work but keeps an exact ledger of live
//! native handles, so tests can assert that every allocation is released
//! exactly once and that nothing leaks past a shutdown drain. CPU-accessible
//! allocations are backed by real host memory so mapped pointers behave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{ResourceError, ResourceResult};
use crate::types::{ClearValue, HeapDescriptor, HeapFlags, HeapProperties, ResourceDescriptor, ResourceState};

use super::{CreatedResource, NativeBackend, NativeHeapHandle, NativeResourceHandle};

/// Base of the synthetic GPU virtual address space handed out by the dummy
/// backend. Arbitrary, but keeps addresses recognizable in logs.
const GPU_VA_BASE: u64 = 0x0001_0000_0000;

struct LiveResource {
    desc: ResourceDescriptor,
    /// Host backing for CPU-accessible allocations; owns the memory behind
    /// the mapped pointer handed out at creation.
    host_memory: Option<Box<[u8]>>,
    /// Heap this resource was placed into, if any.
    placed_in: Option<NativeHeapHandle>,
}

struct LiveHeap {
    size: u64,
}

/// In-memory native backend.
///
/// Handles are monotonically increasing ids; released handles are removed
/// from the ledger and a second release of the same handle panics, matching
/// the double-free semantics of a real driver.
pub struct DummyBackend {
    next_handle: AtomicU64,
    next_gpu_va: AtomicU64,
    resources: Mutex<HashMap<u64, LiveResource>>,
    heaps: Mutex<HashMap<u64, LiveHeap>>,
    fail_next_allocation: AtomicBool,
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            next_gpu_va: AtomicU64::new(GPU_VA_BASE),
            resources: Mutex::new(HashMap::new()),
            heaps: Mutex::new(HashMap::new()),
            fail_next_allocation: AtomicBool::new(false),
        }
    }

    /// Make the next creation call fail with an allocation error.
    pub fn fail_next_allocation(&self) {
        self.fail_next_allocation.store(true, Ordering::Release);
    }

    /// Number of native resources not yet released.
    pub fn live_resource_count(&self) -> usize {
        self.resources.lock().len()
    }

    /// Number of native heaps not yet released.
    pub fn live_heap_count(&self) -> usize {
        self.heaps.lock().len()
    }

    /// Whether the given resource handle is still live.
    pub fn is_resource_live(&self, handle: NativeResourceHandle) -> bool {
        self.resources.lock().contains_key(&handle.0)
    }

    /// Whether the given heap handle is still live.
    pub fn is_heap_live(&self, handle: NativeHeapHandle) -> bool {
        self.heaps.lock().contains_key(&handle.0)
    }

    fn take_injected_failure(&self, desc: &ResourceDescriptor) -> ResourceResult<()> {
        if self.fail_next_allocation.swap(false, Ordering::AcqRel) {
            return Err(ResourceError::AllocationFailed {
                name: desc.name_or_unnamed().to_string(),
                size: desc.estimated_size(),
                reason: "injected allocation failure".to_string(),
            });
        }
        Ok(())
    }

    fn insert_resource(
        &self,
        desc: &ResourceDescriptor,
        cpu_accessible: bool,
        placed_in: Option<NativeHeapHandle>,
    ) -> CreatedResource {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let size = desc.estimated_size().max(1);
        let gpu_virtual_address = self.next_gpu_va.fetch_add(size.next_power_of_two(), Ordering::Relaxed);

        let mut host_memory = None;
        let mut mapped_ptr = None;
        if cpu_accessible {
            let mut memory = vec![0u8; size as usize].into_boxed_slice();
            mapped_ptr = Some(memory.as_mut_ptr());
            host_memory = Some(memory);
        }

        self.resources.lock().insert(
            id,
            LiveResource {
                desc: desc.clone(),
                host_memory,
                placed_in,
            },
        );

        CreatedResource {
            handle: NativeResourceHandle(id),
            gpu_virtual_address,
            mapped_ptr,
        }
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn create_committed_resource(
        &self,
        desc: &ResourceDescriptor,
        heap_props: &HeapProperties,
        heap_flags: HeapFlags,
        _initial_state: ResourceState,
        _clear_value: Option<&ClearValue>,
    ) -> ResourceResult<CreatedResource> {
        self.take_injected_failure(desc)?;

        log::trace!(
            "DummyBackend: committed resource '{}' ({:?}, {} bytes, heap {:?}, flags {:?})",
            desc.name_or_unnamed(),
            desc.dimension,
            desc.estimated_size(),
            heap_props.heap_type,
            heap_flags,
        );
        Ok(self.insert_resource(desc, heap_props.heap_type.is_cpu_accessible(), None))
    }

    fn create_heap(&self, desc: &HeapDescriptor) -> ResourceResult<NativeHeapHandle> {
        if desc.size == 0 {
            return Err(ResourceError::InvalidParameter(
                "heap size cannot be zero".to_string(),
            ));
        }

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.heaps.lock().insert(id, LiveHeap { size: desc.size });

        log::trace!(
            "DummyBackend: heap '{}' ({} bytes, {:?})",
            desc.name.as_deref().unwrap_or("<unnamed>"),
            desc.size,
            desc.properties.heap_type,
        );
        Ok(NativeHeapHandle(id))
    }

    fn create_placed_resource(
        &self,
        desc: &ResourceDescriptor,
        heap: NativeHeapHandle,
        offset: u64,
        _initial_state: ResourceState,
    ) -> ResourceResult<CreatedResource> {
        self.take_injected_failure(desc)?;

        let heaps = self.heaps.lock();
        let live_heap = heaps.get(&heap.0).ok_or_else(|| {
            ResourceError::InvalidParameter(format!("heap {} is not live", heap.0))
        })?;
        if offset + desc.estimated_size() > live_heap.size {
            return Err(ResourceError::InvalidParameter(format!(
                "placed range [{}, {}) exceeds heap size {}",
                offset,
                offset + desc.estimated_size(),
                live_heap.size
            )));
        }
        drop(heaps);

        log::trace!(
            "DummyBackend: placed resource '{}' in heap {} at offset {}",
            desc.name_or_unnamed(),
            heap.0,
            offset,
        );
        // Placed resources are never CPU-mapped through this path.
        Ok(self.insert_resource(desc, false, Some(heap)))
    }

    fn release_resource(&self, handle: NativeResourceHandle) {
        let removed = self.resources.lock().remove(&handle.0);
        match removed {
            Some(live) => {
                log::trace!(
                    "DummyBackend: released resource {} ('{}')",
                    handle.0,
                    live.desc.name_or_unnamed(),
                );
                drop(live.host_memory);
            }
            None => panic!("double release of native resource handle {}", handle.0),
        }
    }

    fn release_heap(&self, handle: NativeHeapHandle) {
        let removed = self.heaps.lock().remove(&handle.0);
        match removed {
            Some(heap) => {
                // A real driver would not check this, but placed resources
                // outliving their heap is exactly the bug class this crate
                // exists to prevent; fail loudly in tests.
                let orphans = self
                    .resources
                    .lock()
                    .values()
                    .filter(|r| r.placed_in == Some(handle))
                    .count();
                assert_eq!(
                    orphans, 0,
                    "heap {} ({} bytes) released with {} live placed resources",
                    handle.0, heap.size, orphans
                );
                log::trace!("DummyBackend: released heap {}", handle.0);
            }
            None => panic!("double release of native heap handle {}", handle.0),
        }
    }
}

static_assertions::assert_impl_all!(DummyBackend: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HeapType, ResourceFlags};

    fn buffer_desc(size: u64) -> ResourceDescriptor {
        ResourceDescriptor::buffer(size, ResourceFlags::empty()).with_name("test")
    }

    #[test]
    fn test_create_and_release() {
        let backend = DummyBackend::new();
        let created = backend
            .create_committed_resource(
                &buffer_desc(256),
                &HeapProperties::new(HeapType::Default, 0),
                HeapFlags::empty(),
                ResourceState::COMMON,
                None,
            )
            .unwrap();
        assert_eq!(backend.live_resource_count(), 1);
        assert!(created.mapped_ptr.is_none());

        backend.release_resource(created.handle);
        assert_eq!(backend.live_resource_count(), 0);
    }

    #[test]
    fn test_upload_heap_is_mapped() {
        let backend = DummyBackend::new();
        let created = backend
            .create_committed_resource(
                &buffer_desc(64),
                &HeapProperties::new(HeapType::Upload, 0),
                HeapFlags::empty(),
                ResourceState::COMMON,
                None,
            )
            .unwrap();
        let ptr = created.mapped_ptr.expect("upload memory must be mapped");
        unsafe { ptr.write(0xA5) };
        backend.release_resource(created.handle);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn test_double_release_panics() {
        let backend = DummyBackend::new();
        let created = backend
            .create_committed_resource(
                &buffer_desc(64),
                &HeapProperties::new(HeapType::Default, 0),
                HeapFlags::empty(),
                ResourceState::COMMON,
                None,
            )
            .unwrap();
        backend.release_resource(created.handle);
        backend.release_resource(created.handle);
    }

    #[test]
    fn test_placed_range_validation() {
        let backend = DummyBackend::new();
        let heap = backend
            .create_heap(&HeapDescriptor::new(1024, HeapProperties::new(HeapType::Default, 0)))
            .unwrap();

        let result = backend.create_placed_resource(
            &buffer_desc(512),
            heap,
            768,
            ResourceState::COMMON,
        );
        assert!(result.is_err());

        let placed = backend
            .create_placed_resource(&buffer_desc(512), heap, 512, ResourceState::COMMON)
            .unwrap();
        backend.release_resource(placed.handle);
        backend.release_heap(heap);
    }

    #[test]
    fn test_injected_failure() {
        let backend = DummyBackend::new();
        backend.fail_next_allocation();
        let result = backend.create_committed_resource(
            &buffer_desc(64),
            &HeapProperties::new(HeapType::Default, 0),
            HeapFlags::empty(),
            ResourceState::COMMON,
            None,
        );
        assert!(matches!(result, Err(ResourceError::AllocationFailed { .. })));
        // Failure is one-shot
        assert!(backend
            .create_committed_resource(
                &buffer_desc(64),
                &HeapProperties::new(HeapType::Default, 0),
                HeapFlags::empty(),
                ResourceState::COMMON,
                None,
            )
            .is_ok());
    }
}
