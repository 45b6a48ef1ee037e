//! Vulkan backend using ash and gpu-allocator.
//!
//! Committed resources get a dedicated allocation bound at offset zero;
//! heaps are raw device-memory allocations that placed resources bind into
//! at a caller-chosen offset. The deletion queue guarantees release calls
//! arrive only after the GPU is done, so all destruction here is immediate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::backend::{CreatedResource, NativeBackend, NativeHeapHandle, NativeResourceHandle};
use crate::error::{ResourceError, ResourceResult};
use crate::fence::Fence;
use crate::types::{
    ClearValue, HeapDescriptor, HeapFlags, HeapProperties, HeapType, ResourceDescriptor,
    ResourceDimension, ResourceFormat, ResourceState,
};

enum NativeObject {
    Buffer {
        buffer: vk::Buffer,
        // None for placed resources; their memory belongs to the heap.
        allocation: Option<Allocation>,
    },
    Image {
        image: vk::Image,
        allocation: Option<Allocation>,
    },
}

struct HeapEntry {
    allocation: Option<Allocation>,
    mapped_base: Option<*mut u8>,
}

// Raw mapped pointers are only dereferenced by callers holding the
// resource; the entry itself is just bookkeeping behind a mutex.
unsafe impl Send for HeapEntry {}

/// Vulkan implementation of [`NativeBackend`].
pub struct VulkanBackend {
    device: ash::Device,
    allocator: Mutex<Allocator>,
    resources: Mutex<HashMap<u64, NativeObject>>,
    heaps: Mutex<HashMap<u64, HeapEntry>>,
    next_handle: AtomicU64,
}

impl VulkanBackend {
    /// Create a backend over an already-initialized Vulkan device.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> ResourceResult<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| {
            ResourceError::Unsupported {
                backend: "Vulkan",
                operation: format!("create memory allocator: {e}"),
            }
        })?;

        Ok(Self {
            device,
            allocator: Mutex::new(allocator),
            resources: Mutex::new(HashMap::new()),
            heaps: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn create_buffer_object(
        &self,
        desc: &ResourceDescriptor,
    ) -> ResourceResult<(vk::Buffer, vk::MemoryRequirements)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.width)
            .usage(convert_buffer_usage(desc))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }.map_err(|e| {
            ResourceError::AllocationFailed {
                name: desc.name_or_unnamed().to_string(),
                size: desc.width,
                reason: format!("vkCreateBuffer failed: {e:?}"),
            }
        })?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        Ok((buffer, requirements))
    }

    fn create_image_object(
        &self,
        desc: &ResourceDescriptor,
    ) -> ResourceResult<(vk::Image, vk::MemoryRequirements)> {
        let (image_type, extent, array_layers) = match desc.dimension {
            ResourceDimension::Texture2D => (
                vk::ImageType::TYPE_2D,
                vk::Extent3D {
                    width: desc.width as u32,
                    height: desc.height,
                    depth: 1,
                },
                desc.depth_or_array_size,
            ),
            ResourceDimension::Texture3D => (
                vk::ImageType::TYPE_3D,
                vk::Extent3D {
                    width: desc.width as u32,
                    height: desc.height,
                    depth: desc.depth_or_array_size,
                },
                1,
            ),
            ResourceDimension::Buffer => unreachable!(),
        };

        let image_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(convert_format(desc.format))
            .extent(extent)
            .mip_levels(desc.mip_levels.max(1))
            .array_layers(array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert_image_usage(desc))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None) }.map_err(|e| {
            ResourceError::AllocationFailed {
                name: desc.name_or_unnamed().to_string(),
                size: desc.estimated_size(),
                reason: format!("vkCreateImage failed: {e:?}"),
            }
        })?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        Ok((image, requirements))
    }

    fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> ResourceResult<Allocation> {
        self.allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| ResourceError::AllocationFailed {
                name: name.to_string(),
                size: requirements.size,
                reason: format!("memory allocation failed: {e}"),
            })
    }

    fn free_allocation(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::error!("VulkanBackend: failed to free allocation: {e}");
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let leaked_resources = self.resources.lock().len();
        let leaked_heaps = self.heaps.lock().len();
        if leaked_resources + leaked_heaps > 0 {
            log::warn!(
                "VulkanBackend dropped with {leaked_resources} live resources and {leaked_heaps} live heaps"
            );
        }
    }
}

impl NativeBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn create_committed_resource(
        &self,
        desc: &ResourceDescriptor,
        heap_props: &HeapProperties,
        _heap_flags: HeapFlags,
        _initial_state: ResourceState,
        _clear_value: Option<&ClearValue>,
    ) -> ResourceResult<CreatedResource> {
        let location = convert_memory_location(heap_props.heap_type);
        let (object, allocation) = match desc.dimension {
            ResourceDimension::Buffer => {
                let (buffer, requirements) = self.create_buffer_object(desc)?;
                let allocation = match self.allocate_memory(
                    desc.name_or_unnamed(),
                    requirements,
                    location,
                    true,
                ) {
                    Ok(allocation) => allocation,
                    Err(e) => {
                        unsafe { self.device.destroy_buffer(buffer, None) };
                        return Err(e);
                    }
                };
                unsafe {
                    self.device
                        .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                }
                .map_err(|e| ResourceError::AllocationFailed {
                    name: desc.name_or_unnamed().to_string(),
                    size: desc.width,
                    reason: format!("vkBindBufferMemory failed: {e:?}"),
                })?;
                (
                    NativeObject::Buffer {
                        buffer,
                        allocation: None,
                    },
                    allocation,
                )
            }
            ResourceDimension::Texture2D | ResourceDimension::Texture3D => {
                let (image, requirements) = self.create_image_object(desc)?;
                let allocation = match self.allocate_memory(
                    desc.name_or_unnamed(),
                    requirements,
                    location,
                    false,
                ) {
                    Ok(allocation) => allocation,
                    Err(e) => {
                        unsafe { self.device.destroy_image(image, None) };
                        return Err(e);
                    }
                };
                unsafe {
                    self.device
                        .bind_image_memory(image, allocation.memory(), allocation.offset())
                }
                .map_err(|e| ResourceError::AllocationFailed {
                    name: desc.name_or_unnamed().to_string(),
                    size: desc.estimated_size(),
                    reason: format!("vkBindImageMemory failed: {e:?}"),
                })?;
                (
                    NativeObject::Image {
                        image,
                        allocation: None,
                    },
                    allocation,
                )
            }
        };

        let mapped_ptr = allocation
            .mapped_ptr()
            .map(|ptr| ptr.as_ptr() as *mut u8);
        let object = match object {
            NativeObject::Buffer { buffer, .. } => NativeObject::Buffer {
                buffer,
                allocation: Some(allocation),
            },
            NativeObject::Image { image, .. } => NativeObject::Image {
                image,
                allocation: Some(allocation),
            },
        };

        let handle = self.next_handle();
        self.resources.lock().insert(handle, object);
        Ok(CreatedResource {
            handle: NativeResourceHandle(handle),
            // Not exposed without the buffer-device-address feature.
            gpu_virtual_address: 0,
            mapped_ptr,
        })
    }

    fn create_heap(&self, desc: &HeapDescriptor) -> ResourceResult<NativeHeapHandle> {
        // A heap is a bare memory block; suballocation geometry is the
        // caller's business, so accept any memory type of the right class.
        let requirements = vk::MemoryRequirements {
            size: desc.size,
            alignment: 64 * 1024,
            memory_type_bits: u32::MAX,
        };
        let allocation = self.allocate_memory(
            desc.name.as_deref().unwrap_or("heap"),
            requirements,
            convert_memory_location(desc.properties.heap_type),
            true,
        )?;
        let mapped_base = allocation.mapped_ptr().map(|ptr| ptr.as_ptr() as *mut u8);

        let handle = self.next_handle();
        self.heaps.lock().insert(
            handle,
            HeapEntry {
                allocation: Some(allocation),
                mapped_base,
            },
        );
        Ok(NativeHeapHandle(handle))
    }

    fn create_placed_resource(
        &self,
        desc: &ResourceDescriptor,
        heap: NativeHeapHandle,
        offset: u64,
        _initial_state: ResourceState,
    ) -> ResourceResult<CreatedResource> {
        let heaps = self.heaps.lock();
        let entry = heaps.get(&heap.0).ok_or_else(|| {
            ResourceError::InvalidParameter(format!("unknown heap handle {}", heap.0))
        })?;
        let allocation = entry.allocation.as_ref().ok_or_else(|| {
            ResourceError::InvalidParameter(format!("heap {} already released", heap.0))
        })?;
        let (memory, base_offset) = (unsafe { allocation.memory() }, allocation.offset());
        let mapped_ptr = entry
            .mapped_base
            // SAFETY: the caller keeps offset within the heap.
            .map(|base| unsafe { base.add(offset as usize) });
        drop(heaps);

        let object = match desc.dimension {
            ResourceDimension::Buffer => {
                let (buffer, _requirements) = self.create_buffer_object(desc)?;
                unsafe {
                    self.device
                        .bind_buffer_memory(buffer, memory, base_offset + offset)
                }
                .map_err(|e| ResourceError::AllocationFailed {
                    name: desc.name_or_unnamed().to_string(),
                    size: desc.width,
                    reason: format!("vkBindBufferMemory (placed) failed: {e:?}"),
                })?;
                NativeObject::Buffer {
                    buffer,
                    allocation: None,
                }
            }
            ResourceDimension::Texture2D | ResourceDimension::Texture3D => {
                let (image, _requirements) = self.create_image_object(desc)?;
                unsafe {
                    self.device
                        .bind_image_memory(image, memory, base_offset + offset)
                }
                .map_err(|e| ResourceError::AllocationFailed {
                    name: desc.name_or_unnamed().to_string(),
                    size: desc.estimated_size(),
                    reason: format!("vkBindImageMemory (placed) failed: {e:?}"),
                })?;
                NativeObject::Image {
                    image,
                    allocation: None,
                }
            }
        };

        let handle = self.next_handle();
        self.resources.lock().insert(handle, object);
        Ok(CreatedResource {
            handle: NativeResourceHandle(handle),
            gpu_virtual_address: 0,
            mapped_ptr,
        })
    }

    fn release_resource(&self, handle: NativeResourceHandle) {
        let object = self.resources.lock().remove(&handle.0);
        match object {
            Some(NativeObject::Buffer { buffer, allocation }) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                if let Some(allocation) = allocation {
                    self.free_allocation(allocation);
                }
            }
            Some(NativeObject::Image { image, allocation }) => {
                unsafe { self.device.destroy_image(image, None) };
                if let Some(allocation) = allocation {
                    self.free_allocation(allocation);
                }
            }
            None => panic!("double release of resource handle {}", handle.0),
        }
    }

    fn release_heap(&self, handle: NativeHeapHandle) {
        let entry = self.heaps.lock().remove(&handle.0);
        match entry {
            Some(mut entry) => {
                if let Some(allocation) = entry.allocation.take() {
                    self.free_allocation(allocation);
                }
            }
            None => panic!("double release of heap handle {}", handle.0),
        }
    }
}

fn convert_memory_location(heap_type: HeapType) -> MemoryLocation {
    match heap_type {
        HeapType::Default => MemoryLocation::GpuOnly,
        HeapType::Upload => MemoryLocation::CpuToGpu,
        HeapType::Readback => MemoryLocation::GpuToCpu,
    }
}

fn convert_format(format: ResourceFormat) -> vk::Format {
    match format {
        ResourceFormat::Unknown => vk::Format::UNDEFINED,
        ResourceFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ResourceFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        ResourceFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        ResourceFormat::Depth32Float => vk::Format::D32_SFLOAT,
        ResourceFormat::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
        ResourceFormat::Bc7Unorm => vk::Format::BC7_UNORM_BLOCK,
    }
}

fn convert_buffer_usage(desc: &ResourceDescriptor) -> vk::BufferUsageFlags {
    let mut usage = vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::VERTEX_BUFFER
        | vk::BufferUsageFlags::INDEX_BUFFER
        | vk::BufferUsageFlags::UNIFORM_BUFFER;
    if desc.flags.contains(crate::types::ResourceFlags::UNORDERED_ACCESS) {
        usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    usage
}

fn convert_image_usage(desc: &ResourceDescriptor) -> vk::ImageUsageFlags {
    use crate::types::ResourceFlags;

    let mut usage = vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST
        | vk::ImageUsageFlags::SAMPLED;
    if desc.flags.contains(ResourceFlags::RENDER_TARGET) {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if desc.flags.contains(ResourceFlags::DEPTH_STENCIL) {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        usage &= !vk::ImageUsageFlags::SAMPLED;
    }
    if desc.flags.contains(ResourceFlags::UNORDERED_ACCESS) {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    usage
}

/// Monotonic fence over a Vulkan timeline semaphore.
///
/// The submitter advances the target with [`advance_target`] when recording
/// a signal operation; completion is read straight from the semaphore's
/// counter.
///
/// [`advance_target`]: VulkanFence::advance_target
pub struct VulkanFence {
    device: ash::Device,
    semaphore: vk::Semaphore,
    target: AtomicU64,
}

impl VulkanFence {
    /// Create a timeline semaphore starting at zero.
    pub fn new(device: ash::Device) -> ResourceResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore =
            unsafe { device.create_semaphore(&create_info, None) }.map_err(|e| {
                ResourceError::Unsupported {
                    backend: "Vulkan",
                    operation: format!("create timeline semaphore: {e:?}"),
                }
            })?;
        Ok(Self {
            device,
            semaphore,
            target: AtomicU64::new(0),
        })
    }

    /// The underlying semaphore, for queue submission signal operations.
    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Reserve the next timeline value for a submission about to signal it.
    pub fn advance_target(&self) -> u64 {
        self.target.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Fence for VulkanFence {
    fn current_target_value(&self) -> u64 {
        self.target.load(Ordering::SeqCst)
    }

    fn last_completed_value(&self) -> u64 {
        unsafe { self.device.get_semaphore_counter_value(self.semaphore) }.unwrap_or(0)
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.semaphore, None) };
    }
}
