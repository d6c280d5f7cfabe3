//! Device memory for the Vulkan backend.
//!
//! Every buffer and image gets its own gpu-allocator sub-allocation. The
//! native object and its memory are created together and released together.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, AllocatorDebugSettings, MemoryLocation};

use crate::error::{GpuError, Result};
use crate::resource::{BufferDesc, TextureDesc};

fn allocation_failed(e: AllocationError) -> GpuError {
    GpuError::AllocationFailed(e.to_string())
}

/// Owns the gpu-allocator instance of a device.
pub struct GpuAllocator {
    device: Arc<ash::Device>,
    inner: Option<Allocator>,
}

impl GpuAllocator {
    /// Create an allocator for `device`.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let inner = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                ..AllocatorDebugSettings::default()
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(allocation_failed)?;

        Ok(Self {
            device,
            inner: Some(inner),
        })
    }

    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.inner
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("allocator was shut down".into()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(allocation_failed)
    }

    fn release(&mut self, allocation: Allocation) -> Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.free(allocation).map_err(allocation_failed),
            // Memory went away with the allocator.
            None => Ok(()),
        }
    }

    /// Create a buffer backed by fresh memory.
    pub fn create_buffer(&mut self, desc: &BufferDesc) -> Result<GpuBuffer> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { self.device.create_buffer(&info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(raw) };

        let allocation = match self.allocate(&desc.name, requirements, desc.location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(raw, None) };
                return Err(e);
            }
        };
        let bound = unsafe {
            self.device
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(raw, None) };
            self.release(allocation)?;
            return Err(e.into());
        }

        Ok(GpuBuffer {
            raw,
            size: desc.size,
            allocation,
        })
    }

    /// Destroy a buffer and release its memory.
    pub fn free_buffer(&mut self, buffer: GpuBuffer) -> Result<()> {
        unsafe { self.device.destroy_buffer(buffer.raw, None) };
        self.release(buffer.allocation)
    }

    /// Create a single-mip 2D image in device memory, with a view over it.
    pub fn create_image(&mut self, desc: &TextureDesc) -> Result<GpuImage> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation =
            match self.allocate(&desc.name, requirements, MemoryLocation::GpuOnly, false) {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { self.device.destroy_image(image, None) };
                    return Err(e);
                }
            };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(desc.aspect())
                    .level_count(1)
                    .layer_count(1),
            );
        let view = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .and_then(|()| self.device.create_image_view(&view_info, None))
        };

        match view {
            Ok(view) => Ok(GpuImage {
                image,
                view,
                allocation,
            }),
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                self.release(allocation)?;
                Err(e.into())
            }
        }
    }

    /// Destroy an image, its view, and release its memory.
    pub fn free_image(&mut self, image: GpuImage) -> Result<()> {
        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.image, None);
        }
        self.release(image.allocation)
    }

    /// Drop the allocator, freeing all of its memory blocks.
    ///
    /// Must happen before the device is destroyed. Allocations still alive
    /// are reported as leaks.
    pub fn shutdown(&mut self) {
        self.inner.take();
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A native buffer and its memory.
pub struct GpuBuffer {
    pub raw: vk::Buffer,
    pub size: u64,
    pub allocation: Allocation,
}

impl GpuBuffer {
    /// Host pointer to the buffer memory, if it is mapped.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .mapped_ptr()
            .map(|ptr| ptr.as_ptr().cast::<u8>())
    }

    /// Copy bytes into mapped memory at `offset`.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset.saturating_add(data.len() as u64);
        if end > self.size {
            return Err(GpuError::OutOfBounds {
                what: "buffer",
                offset,
                end,
                size: self.size,
            });
        }
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("buffer is not host visible".into()))?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }
}

/// A native image, its default view and its memory.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Allocation,
}
