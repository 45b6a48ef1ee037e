//! Descriptors and value types for GPU resources and heaps.

use bitflags::bitflags;

// ============================================================================
// Resource descriptors
// ============================================================================

/// Dimension of a GPU resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceDimension {
    /// A linear buffer.
    #[default]
    Buffer,
    /// A 2D texture.
    Texture2D,
    /// A 3D (volume) texture.
    Texture3D,
}

/// Pixel format of a texture resource.
///
/// Buffers use [`ResourceFormat::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceFormat {
    /// No format (buffers).
    #[default]
    Unknown,
    /// 8-bit RGBA, unsigned normalized.
    Rgba8Unorm,
    /// 16-bit float RGBA.
    Rgba16Float,
    /// 32-bit float RGBA.
    Rgba32Float,
    /// 32-bit depth.
    Depth32Float,
    /// 24-bit depth with 8-bit stencil.
    Depth24PlusStencil8,
    /// Block-compressed BC7.
    Bc7Unorm,
}

bitflags! {
    /// Creation flags for resources.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceFlags: u32 {
        /// Resource can be used as a render target.
        const RENDER_TARGET = 1 << 0;
        /// Resource can be used as a depth/stencil target.
        const DEPTH_STENCIL = 1 << 1;
        /// Resource can be written from shaders (UAV/storage).
        const UNORDERED_ACCESS = 1 << 2;
        /// Resource is accessed simultaneously by multiple engines.
        ///
        /// Requesting this makes the factory derive a shared heap flag.
        const SIMULTANEOUS_ACCESS = 1 << 3;
        /// Resource can be shared across adapters.
        const CROSS_ADAPTER = 1 << 4;
    }
}

impl Default for ResourceFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Opaque synchronization state of a resource.
///
/// Barrier/transition computation is out of scope for this crate; the state
/// is carried through creation so calling code can seed its own tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceState(pub u32);

impl ResourceState {
    /// The common "no access yet" state.
    pub const COMMON: Self = Self(0);
}

/// Descriptor for creating a GPU resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ResourceDescriptor {
    /// Debug name for the resource.
    pub name: Option<String>,
    /// Buffer or texture dimension.
    pub dimension: ResourceDimension,
    /// Pixel format (textures) or `Unknown` (buffers).
    pub format: ResourceFormat,
    /// Width in texels, or size in bytes for buffers.
    pub width: u64,
    /// Height in texels (1 for buffers).
    pub height: u32,
    /// Depth or array size (1 for buffers and 2D textures).
    pub depth_or_array_size: u32,
    /// Number of mip levels (textures).
    pub mip_levels: u32,
    /// Creation flags.
    pub flags: ResourceFlags,
}

impl ResourceDescriptor {
    /// Create a buffer-shaped descriptor.
    pub fn buffer(size: u64, flags: ResourceFlags) -> Self {
        Self {
            name: None,
            dimension: ResourceDimension::Buffer,
            format: ResourceFormat::Unknown,
            width: size,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            flags,
        }
    }

    /// Create a 2D texture descriptor.
    pub fn texture_2d(width: u64, height: u32, format: ResourceFormat, flags: ResourceFlags) -> Self {
        Self {
            name: None,
            dimension: ResourceDimension::Texture2D,
            format,
            width,
            height,
            depth_or_array_size: 1,
            mip_levels: 1,
            flags,
        }
    }

    /// Set the debug name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the mip level count.
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Debug name, or a placeholder when none was set.
    pub fn name_or_unnamed(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    /// Approximate allocation size in bytes.
    ///
    /// Exact for buffers; a linear estimate for textures (the native API owns
    /// the real footprint). Used for residency accounting and diagnostics.
    pub fn estimated_size(&self) -> u64 {
        match self.dimension {
            ResourceDimension::Buffer => self.width,
            ResourceDimension::Texture2D | ResourceDimension::Texture3D => {
                let texel_size = match self.format {
                    ResourceFormat::Unknown => 1,
                    ResourceFormat::Rgba8Unorm | ResourceFormat::Depth32Float => 4,
                    ResourceFormat::Depth24PlusStencil8 => 4,
                    ResourceFormat::Rgba16Float => 8,
                    ResourceFormat::Rgba32Float => 16,
                    ResourceFormat::Bc7Unorm => 1,
                };
                self.width * self.height as u64 * self.depth_or_array_size as u64 * texel_size
            }
        }
    }
}

// ============================================================================
// Heap properties
// ============================================================================

/// Memory class a heap (or committed resource) lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HeapType {
    /// Device-local memory, not CPU-accessible. Residency-tracked.
    #[default]
    Default,
    /// CPU-writable upload memory.
    Upload,
    /// CPU-readable readback memory.
    Readback,
}

impl HeapType {
    /// Whether this memory class is CPU-accessible.
    ///
    /// CPU-accessible heaps are permanently resident and are not tracked by
    /// the residency manager.
    pub fn is_cpu_accessible(self) -> bool {
        matches!(self, Self::Upload | Self::Readback)
    }
}

bitflags! {
    /// Flags applied to heap creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeapFlags: u32 {
        /// Heap is shared between engines/processes.
        const SHARED = 1 << 0;
        /// Heap only holds buffers.
        const BUFFERS_ONLY = 1 << 1;
        /// Heap only holds textures.
        const TEXTURES_ONLY = 1 << 2;
    }
}

impl Default for HeapFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Memory properties for committed-resource and heap creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeapProperties {
    /// Memory class.
    pub heap_type: HeapType,
    /// Devices that can create views on allocations in this heap.
    pub visible_mask: DeviceMask,
    /// Device that owns the physical allocation.
    pub creation_mask: DeviceMask,
}

impl HeapProperties {
    /// Properties for a single-device heap of the given type.
    pub fn new(heap_type: HeapType, device_index: u32) -> Self {
        let mask = DeviceMask::for_device(device_index);
        Self {
            heap_type,
            visible_mask: mask,
            creation_mask: mask,
        }
    }

    /// Make the allocation visible to additional devices.
    pub fn with_visible_mask(mut self, mask: DeviceMask) -> Self {
        self.visible_mask = mask;
        self
    }
}

/// Descriptor for creating a standalone heap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct HeapDescriptor {
    /// Debug name for the heap.
    pub name: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Memory properties.
    pub properties: HeapProperties,
    /// Heap flags.
    pub flags: HeapFlags,
}

impl HeapDescriptor {
    /// Create a heap descriptor.
    pub fn new(size: u64, properties: HeapProperties) -> Self {
        Self {
            name: None,
            size,
            properties,
            flags: HeapFlags::empty(),
        }
    }

    /// Set the debug name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the heap flags.
    pub fn with_flags(mut self, flags: HeapFlags) -> Self {
        self.flags = flags;
        self
    }
}

// ============================================================================
// Device mask
// ============================================================================

/// Bitmask of device (GPU node) indices in a linked adapter group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceMask(u32);

impl DeviceMask {
    /// Mask selecting a single device.
    pub fn for_device(index: u32) -> Self {
        debug_assert!(index < 32, "device index out of range");
        Self(1 << index)
    }

    /// Mask selecting all devices in a group of `count` devices.
    pub fn all(count: u32) -> Self {
        debug_assert!(count >= 1 && count <= 32, "device count out of range");
        Self(if count == 32 { u32::MAX } else { (1 << count) - 1 })
    }

    /// Raw mask bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Number of devices selected by this mask.
    pub fn device_count(self) -> u32 {
        self.0.count_ones()
    }

    /// Whether the mask selects more than one device.
    pub fn is_multi_device(self) -> bool {
        self.device_count() > 1
    }
}

impl Default for DeviceMask {
    fn default() -> Self {
        Self::for_device(0)
    }
}

/// Optimized clear value for render-target and depth-stencil resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Clear color for render targets.
    Color([f32; 4]),
    /// Depth and stencil clear values.
    DepthStencil {
        /// Depth clear value.
        depth: f32,
        /// Stencil clear value.
        stencil: u8,
    },
}
