//! Resource location — the ownership state machine.
//!
//! A [`ResourceLocation`] describes where a logical allocation's bytes live
//! and who is responsible for freeing them. It starts out `Undefined`,
//! transitions to exactly one concrete variant, and releases its ownership
//! obligation exactly once — either through an explicit [`clear`] or on
//! `Drop`. All ownership mutation goes through the fixed operation set
//! ([`set_resource`], [`transfer_ownership`], [`swap`], [`alias`],
//! [`reference_node`], [`clear`]); the variant payloads are not otherwise
//! reachable mutably, so the compiler checks the release dispatch
//! exhaustively.
//!
//! [`clear`]: ResourceLocation::clear
//! [`set_resource`]: ResourceLocation::set_resource
//! [`transfer_ownership`]: ResourceLocation::transfer_ownership
//! [`swap`]: ResourceLocation::swap
//! [`alias`]: ResourceLocation::alias
//! [`reference_node`]: ResourceLocation::reference_node

use std::sync::Arc;

use crate::device::ResourceDevice;
use crate::resource::GpuResource;
use crate::suballoc::{SubAllocatedBlock, SubAllocator};

/// Variant tag of a [`ResourceLocation`], for inspection and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    /// No allocation; release is a no-op.
    Undefined,
    /// Sole owner of a committed resource.
    StandAlone,
    /// A byte range carved from a pooled parent resource; the owning
    /// sub-allocator reclaims the range on release.
    SubAllocation,
    /// Shares ownership of a resource with other aliased locations.
    Aliased,
    /// Read-only cross-device view of another device's resource.
    NodeReference,
    /// Sole owner of a resource aliased into heap memory.
    HeapAliased,
    /// Transient allocation owned by a fast (per-frame) allocator.
    FastAllocation,
}

#[derive(Clone)]
struct OwnedBlock {
    resource: Arc<GpuResource>,
    offset: u64,
    size: u64,
}

enum LocationState {
    Undefined,
    StandAlone(OwnedBlock),
    SubAllocation {
        block: SubAllocatedBlock,
        allocator: Arc<dyn SubAllocator>,
    },
    Aliased(OwnedBlock),
    NodeReference(OwnedBlock),
    HeapAliased(OwnedBlock),
    FastAllocation {
        resource: Arc<GpuResource>,
        offset: u64,
        size: u64,
    },
}

/// Where a logical allocation lives and who frees it.
///
/// Single-owner: a location is mutated from one thread at a time; sharing
/// one instance mutably across threads is not a supported usage. The
/// `GpuResource` it points at is internally synchronized.
pub struct ResourceLocation {
    device: Arc<ResourceDevice>,
    state: LocationState,
}

impl ResourceLocation {
    /// Create an empty (`Undefined`) location owned by `device`.
    pub fn new(device: Arc<ResourceDevice>) -> Self {
        Self {
            device,
            state: LocationState::Undefined,
        }
    }

    /// The device that owns this location's allocation.
    pub fn device(&self) -> &Arc<ResourceDevice> {
        &self.device
    }

    /// Current variant tag.
    pub fn kind(&self) -> LocationKind {
        match &self.state {
            LocationState::Undefined => LocationKind::Undefined,
            LocationState::StandAlone(_) => LocationKind::StandAlone,
            LocationState::SubAllocation { .. } => LocationKind::SubAllocation,
            LocationState::Aliased(_) => LocationKind::Aliased,
            LocationState::NodeReference(_) => LocationKind::NodeReference,
            LocationState::HeapAliased(_) => LocationKind::HeapAliased,
            LocationState::FastAllocation { .. } => LocationKind::FastAllocation,
        }
    }

    /// Whether the location holds a concrete allocation.
    pub fn is_valid(&self) -> bool {
        !matches!(self.state, LocationState::Undefined)
    }

    /// The underlying resource, if any.
    pub fn resource(&self) -> Option<&Arc<GpuResource>> {
        match &self.state {
            LocationState::Undefined => None,
            LocationState::StandAlone(block)
            | LocationState::Aliased(block)
            | LocationState::NodeReference(block)
            | LocationState::HeapAliased(block) => Some(&block.resource),
            LocationState::SubAllocation { block, .. } => Some(&block.resource),
            LocationState::FastAllocation { resource, .. } => Some(resource),
        }
    }

    /// Byte offset of this allocation within the underlying resource.
    pub fn offset(&self) -> u64 {
        match &self.state {
            LocationState::Undefined => 0,
            LocationState::StandAlone(block)
            | LocationState::Aliased(block)
            | LocationState::NodeReference(block)
            | LocationState::HeapAliased(block) => block.offset,
            LocationState::SubAllocation { block, .. } => block.offset,
            LocationState::FastAllocation { offset, .. } => *offset,
        }
    }

    /// Size of this allocation in bytes.
    pub fn size(&self) -> u64 {
        match &self.state {
            LocationState::Undefined => 0,
            LocationState::StandAlone(block)
            | LocationState::Aliased(block)
            | LocationState::NodeReference(block)
            | LocationState::HeapAliased(block) => block.size,
            LocationState::SubAllocation { block, .. } => block.size,
            LocationState::FastAllocation { size, .. } => *size,
        }
    }

    /// GPU virtual address of this allocation.
    pub fn gpu_virtual_address(&self) -> u64 {
        self.resource()
            .map(|r| r.gpu_virtual_address() + self.offset())
            .unwrap_or(0)
    }

    /// Mapped CPU pointer to this allocation, for CPU-accessible memory.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        let offset = self.offset();
        self.resource()
            .and_then(|r| r.mapped_ptr())
            // SAFETY: the offset stays within the parent allocation by
            // construction of every variant.
            .map(|ptr| unsafe { ptr.add(offset as usize) })
    }

    // ------------------------------------------------------------------
    // Ownership transitions
    // ------------------------------------------------------------------

    /// Take sole ownership of a committed resource.
    ///
    /// The factory's initial reference transfers to this location; the
    /// count is not incremented.
    ///
    /// # Panics
    ///
    /// Panics unless the location is `Undefined`.
    pub fn set_resource(&mut self, resource: Arc<GpuResource>) {
        self.set_owned(resource, LocationKind::StandAlone);
    }

    /// Take sole ownership of a resource aliased into heap memory.
    ///
    /// # Panics
    ///
    /// Panics unless the location is `Undefined`.
    pub fn set_heap_aliased(&mut self, resource: Arc<GpuResource>) {
        self.set_owned(resource, LocationKind::HeapAliased);
    }

    fn set_owned(&mut self, resource: Arc<GpuResource>, kind: LocationKind) {
        assert!(
            !self.is_valid(),
            "location already holds {:?}; clear it before assigning",
            self.kind()
        );
        let block = OwnedBlock {
            size: resource.descriptor().estimated_size(),
            offset: 0,
            resource,
        };
        self.state = match kind {
            LocationKind::StandAlone => LocationState::StandAlone(block),
            LocationKind::HeapAliased => LocationState::HeapAliased(block),
            _ => unreachable!(),
        };
    }

    /// Adopt a block handed out by a sub-allocator.
    ///
    /// The location does not hold a logical reference on the parent
    /// resource; release hands the byte range back to `allocator`.
    ///
    /// # Panics
    ///
    /// Panics unless the location is `Undefined`.
    pub fn set_sub_allocation(&mut self, allocator: Arc<dyn SubAllocator>, block: SubAllocatedBlock) {
        assert!(
            !self.is_valid(),
            "location already holds {:?}; clear it before assigning",
            self.kind()
        );
        self.state = LocationState::SubAllocation { block, allocator };
    }

    /// Adopt a transient range from a fast (per-frame) allocator.
    ///
    /// Lifetime is managed by the pool; release is a no-op.
    ///
    /// # Panics
    ///
    /// Panics unless the location is `Undefined`.
    pub fn set_fast_allocation(&mut self, resource: Arc<GpuResource>, offset: u64, size: u64) {
        assert!(
            !self.is_valid(),
            "location already holds {:?}; clear it before assigning",
            self.kind()
        );
        self.state = LocationState::FastAllocation {
            resource,
            offset,
            size,
        };
    }

    /// Move ownership from `src` to `dst`.
    ///
    /// `dst` is cleared first; all state moves over; `src` is left
    /// `Undefined` without releasing — the obligation to eventually release
    /// moves with the state instead of being duplicated.
    pub fn transfer_ownership(dst: &mut Self, src: &mut Self) {
        dst.clear();
        dst.device = Arc::clone(&src.device);
        dst.state = std::mem::replace(&mut src.state, LocationState::Undefined);
    }

    /// Exchange the full state of two locations with no reference-count
    /// change. Used to relocate an allocation without churn.
    pub fn swap(a: &mut Self, b: &mut Self) {
        std::mem::swap(&mut a.device, &mut b.device);
        std::mem::swap(&mut a.state, &mut b.state);
    }

    /// Alias `dst` to the resource `src` owns.
    ///
    /// Both locations become `Aliased` against the same resource and its
    /// reference count is incremented by exactly one.
    ///
    /// # Panics
    ///
    /// Panics if `src` does not own a resource.
    pub fn alias(dst: &mut Self, src: &mut Self) {
        let block = src.owned_block("alias");
        block.resource.add_ref();
        dst.clear();
        dst.device = Arc::clone(&src.device);
        dst.state = LocationState::Aliased(block.clone());
        src.state = LocationState::Aliased(block);
    }

    /// Create a read-only cross-device view of the resource `src` owns.
    ///
    /// Like [`alias`], but `dst` is rebound to `device` and `src` keeps its
    /// current variant. The reference count is incremented by exactly one.
    ///
    /// [`alias`]: ResourceLocation::alias
    ///
    /// # Panics
    ///
    /// Panics if `src` does not own a resource.
    pub fn reference_node(device: &Arc<ResourceDevice>, dst: &mut Self, src: &mut Self) {
        let block = src.owned_block("reference_node");
        block.resource.add_ref();
        dst.clear();
        dst.device = Arc::clone(device);
        dst.state = LocationState::NodeReference(block);
    }

    fn owned_block(&self, operation: &str) -> OwnedBlock {
        match &self.state {
            LocationState::StandAlone(block)
            | LocationState::Aliased(block)
            | LocationState::NodeReference(block)
            | LocationState::HeapAliased(block) => block.clone(),
            _ => panic!("{operation} requires a source that owns a resource, got {:?}", self.kind()),
        }
    }

    /// Release whatever this location owns and reset it to `Undefined`.
    ///
    /// Idempotent: clearing an `Undefined` location is a no-op.
    pub fn clear(&mut self) {
        let state = std::mem::replace(&mut self.state, LocationState::Undefined);
        self.release_state(state);
    }

    /// Per-variant release dispatch.
    fn release_state(&self, state: LocationState) {
        match state {
            LocationState::Undefined | LocationState::FastAllocation { .. } => {}
            LocationState::StandAlone(block) | LocationState::HeapAliased(block) => {
                // Sole-ownership checkpoint. A count other than one means an
                // alias or transfer was never balanced — except for
                // sanctioned multi-device fan-out, where several devices
                // hold references to one resource and whichever release
                // observes zero frees it.
                let resource = block.resource;
                if !resource.visible_mask().is_multi_device() {
                    assert_eq!(
                        resource.ref_count(),
                        1,
                        "ownership corruption: releasing stand-alone '{}' with {} references",
                        resource.name(),
                        resource.ref_count()
                    );
                }
                self.release_owned_reference(resource);
            }
            LocationState::SubAllocation { block, allocator } => {
                // The allocator reclaims the byte range and decides if and
                // when the parent resource is freed; the parent's reference
                // count is never touched from here.
                allocator.deallocate(&block);
            }
            LocationState::Aliased(block) | LocationState::NodeReference(block) => {
                self.release_owned_reference(block.resource);
            }
        }
    }

    /// Drop one logical reference; on zero, free now or hand the final
    /// reference to the deletion queue per the resource's defer flag.
    fn release_owned_reference(&self, resource: Arc<GpuResource>) {
        let remaining = resource.release();
        if remaining == 0 {
            if resource.should_defer_delete() {
                // The queue entry becomes the sole owner.
                resource.add_ref();
                self.device.defer_destroy_resource(resource);
            } else {
                self.device.destroy_resource_now(&resource);
            }
        }
    }
}

impl Drop for ResourceLocation {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for ResourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("ResourceLocation");
        debug.field("kind", &self.kind());
        if let Some(resource) = self.resource() {
            debug
                .field("resource", &resource.name())
                .field("offset", &self.offset())
                .field("size", &self.size());
        }
        debug.finish()
    }
}
