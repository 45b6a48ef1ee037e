//! # rhi-resources
//!
//! GPU resource lifetime management: logical reference counting, the
//! resource-location ownership state machine, and fence-gated deferred
//! deletion.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`ResourceDevice`] - Per-device factory and lifetime context
//! - [`ResourceLocation`] - Tracks where an allocation lives and who frees it
//! - [`DeferredDeletionQueue`] - Holds freed allocations until a fence proves
//!   the GPU is done with them
//! - [`BufferPoolAllocator`] / [`FastAllocator`] - Sub-allocation on top of
//!   pooled parent buffers
//! - Backends: Vulkan (feature `vulkan-backend`) and Dummy (for testing)
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use rhi_resources::{
//!     DeviceConfig, DummyBackend, HeapType, ManualFence, ResourceDevice,
//!     ResourceFlags, ResourceLocation, ResourceState,
//! };
//!
//! let backend = Arc::new(DummyBackend::new());
//! let fence = Arc::new(ManualFence::new());
//! let device = ResourceDevice::new(backend, fence.clone(), 0, DeviceConfig::default());
//!
//! let buffer = device
//!     .create_buffer(4096, ResourceFlags::empty(), HeapType::Default,
//!                    ResourceState::COMMON, "vertices")
//!     .unwrap();
//! let mut location = ResourceLocation::new(device.clone());
//! location.set_resource(buffer);
//!
//! // Releasing defers the free until the device's fence catches up.
//! location.clear();
//! fence.signal_to_target();
//! device.release_resources(false);
//! ```

pub mod backend;
pub mod deletion;
pub mod device;
pub mod error;
pub mod fence;
pub mod location;
pub mod residency;
pub mod resource;
pub mod suballoc;
pub mod types;

// Re-export main types for convenience
pub use backend::dummy::DummyBackend;
pub use backend::{CreatedResource, NativeBackend, NativeHeapHandle, NativeResourceHandle};
pub use deletion::{DeferredDeletionQueue, DeletionPayload};
pub use device::{DeviceConfig, ResourceDevice};
pub use error::{ResourceError, ResourceResult};
pub use fence::{Fence, ManualFence};
pub use location::{LocationKind, ResourceLocation};
pub use residency::{ResidencyManager, ResidencySet};
pub use resource::{GpuHeap, GpuResource};
pub use suballoc::{BufferPoolAllocator, FastAllocator, SubAllocatedBlock, SubAllocator};
pub use types::{
    ClearValue, DeviceMask, HeapDescriptor, HeapFlags, HeapProperties, HeapType,
    ResourceDescriptor, ResourceDimension, ResourceFlags, ResourceFormat, ResourceState,
};

#[cfg(feature = "vulkan-backend")]
pub use backend::vulkan::{VulkanBackend, VulkanFence};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
