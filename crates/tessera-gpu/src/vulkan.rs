//! Vulkan implementation of [`GpuDevice`].
//!
//! Instance creation, physical device selection and queue discovery happen
//! elsewhere; this backend is handed a working `ash::Device` and one queue.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::barrier::PipelineBarrier;
use crate::command::CommandRecording;
use crate::deferred::RetiredResource;
use crate::descriptors::DescriptorSetInfo;
use crate::device::{CommandRecorder, GpuDevice, RecordFn};
use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuBuffer, GpuImage};
use crate::resource::{Buffer, BufferDesc, RetireQueue, Texture, TextureDesc};

/// A [`GpuDevice`] backed by a Vulkan device and a single queue.
pub struct VulkanDevice {
    device: Arc<ash::Device>,
    allocator: Mutex<GpuAllocator>,
    commands: Mutex<CommandRecording>,
    buffers: Mutex<HashMap<vk::Buffer, GpuBuffer>>,
    images: Mutex<HashMap<vk::Image, GpuImage>>,
    layouts: Mutex<Vec<vk::DescriptorSetLayout>>,
    retire: RetireQueue,
}

impl VulkanDevice {
    /// Wrap an externally created device.
    ///
    /// The device does not take ownership of `device`; it must outlive this
    /// object.
    ///
    /// # Safety
    /// All handles must be valid, `queue` must belong to `queue_family`, and
    /// the device must have been created with the `synchronization2` feature.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        queue: vk::Queue,
    ) -> Result<Self> {
        let allocator = unsafe { GpuAllocator::new(instance, device.clone(), physical_device) }?;
        let commands = unsafe { CommandRecording::new(&device, queue_family, queue) }?;

        tracing::debug!(queue_family, "Created Vulkan frame device");

        Ok(Self {
            device,
            allocator: Mutex::new(allocator),
            commands: Mutex::new(commands),
            buffers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            layouts: Mutex::new(Vec::new()),
            retire: RetireQueue::default(),
        })
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the submission queue.
    pub fn queue(&self) -> vk::Queue {
        self.commands.lock().queue()
    }

    /// Begin a command buffer and record into it without holding the pool
    /// lock, so `f` may itself upload or submit.
    fn record(&self, f: impl FnOnce(vk::CommandBuffer)) -> Result<vk::CommandBuffer> {
        let cmd = unsafe { self.commands.lock().begin(&self.device)? };
        f(cmd);
        Ok(cmd)
    }

    fn destroy_retired(&self, resources: Vec<RetiredResource>) -> Result<()> {
        let mut allocator = self.allocator.lock();
        for resource in resources {
            match resource {
                RetiredResource::Buffer(raw) => {
                    if let Some(buffer) = self.buffers.lock().remove(&raw) {
                        allocator.free_buffer(buffer)?;
                    }
                }
                RetiredResource::Image { image, .. } => {
                    if let Some(gpu_image) = self.images.lock().remove(&image) {
                        allocator.free_image(gpu_image)?;
                    }
                }
                RetiredResource::DescriptorPool(pool) => unsafe {
                    self.device.destroy_descriptor_pool(pool, None);
                },
            }
        }
        Ok(())
    }

    fn upload_staged(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let staging = self.allocator.lock().create_buffer(&BufferDesc::new(
            "staging_upload",
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        ))?;
        if let Err(e) = staging.write_bytes(0, data) {
            self.allocator.lock().free_buffer(staging)?;
            return Err(e);
        }

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size: data.len() as u64,
        };
        let result = self
            .record(|cmd| unsafe {
                self.device
                    .cmd_copy_buffer(cmd, staging.raw, buffer.raw(), &[region]);
            })
            .and_then(|cmd| unsafe { self.commands.lock().submit_blocking(&self.device, cmd) });

        self.allocator.lock().free_buffer(staging)?;
        result
    }
}

impl GpuDevice for VulkanDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer> {
        let gpu_buffer = self.allocator.lock().create_buffer(desc)?;
        let raw = gpu_buffer.raw;
        self.buffers.lock().insert(raw, gpu_buffer);
        tracing::trace!(name = %desc.name, size = desc.size, "Created buffer");
        Ok(Buffer::new(raw, desc.clone(), self.retire.clone()))
    }

    fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > buffer.size() {
            return Err(GpuError::OutOfBounds {
                what: "buffer",
                offset,
                end,
                size: buffer.size(),
            });
        }

        {
            let buffers = self.buffers.lock();
            let gpu_buffer = buffers
                .get(&buffer.raw())
                .ok_or_else(|| GpuError::ResourceNotFound(buffer.name().to_string()))?;
            if gpu_buffer.mapped_ptr().is_some() {
                return gpu_buffer.write_bytes(offset, data);
            }
        }

        self.upload_staged(buffer, offset, data)
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<Texture> {
        let gpu_image = self.allocator.lock().create_image(desc)?;
        let (image, view) = (gpu_image.image, gpu_image.view);
        self.images.lock().insert(image, gpu_image);
        tracing::trace!(name = %desc.name, extent = ?desc.extent, "Created texture");
        Ok(Texture::new(image, view, desc.clone(), self.retire.clone()))
    }

    fn create_descriptor_set_layout(
        &self,
        info: &DescriptorSetInfo,
    ) -> Result<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> = info
            .bindings()
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_info, None)? };
        self.layouts.lock().push(layout);
        Ok(layout)
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(sizes);

        let pool = unsafe { self.device.create_descriptor_pool(&create_info, None)? };
        Ok(pool)
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
        Ok(sets)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?;
        }
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.retire
            .lock()
            .retire(RetiredResource::DescriptorPool(pool));
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn submit_once(&self, record: &mut RecordFn<'_>) -> Result<()> {
        let cmd = self.record(|cmd| record(&mut VulkanRecorder::new(&self.device, cmd)))?;
        unsafe { self.commands.lock().submit_blocking(&self.device, cmd) }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn submit(&self, record: &mut RecordFn<'_>) -> Result<()> {
        let cmd = self.record(|cmd| record(&mut VulkanRecorder::new(&self.device, cmd)))?;
        unsafe { self.commands.lock().submit_queued(&self.device, cmd) }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn flush(&self) -> Result<()> {
        unsafe { self.commands.lock().wait_and_recycle(&self.device)? };
        let ready = self.retire.lock().end_frame();
        if !ready.is_empty() {
            tracing::trace!(count = ready.len(), "Destroying retired resources");
        }
        self.destroy_retired(ready)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.queue_wait_idle(self.queue());
        }

        let pending = self.retire.lock().drain_all();
        if let Err(e) = self.destroy_retired(pending) {
            tracing::error!("Failed to destroy retired resources: {e}");
        }

        // Resources whose handles are still alive are released with the allocator.
        let mut allocator = self.allocator.lock();
        for (_, buffer) in self.buffers.lock().drain() {
            let _ = allocator.free_buffer(buffer);
        }
        for (_, image) in self.images.lock().drain() {
            let _ = allocator.free_image(image);
        }

        unsafe {
            for layout in self.layouts.lock().drain(..) {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            self.commands.lock().destroy(&self.device);
        }
        allocator.shutdown();
    }
}

/// Records into a Vulkan command buffer.
pub struct VulkanRecorder<'a> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
}

impl<'a> VulkanRecorder<'a> {
    /// Wrap a command buffer in recording state.
    pub fn new(device: &'a ash::Device, cmd: vk::CommandBuffer) -> Self {
        Self { device, cmd }
    }

    /// Get the raw command buffer for commands this interface does not cover.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }
}

impl CommandRecorder for VulkanRecorder<'_> {
    fn pipeline_barrier(&mut self, barrier: &PipelineBarrier) {
        let image_barriers: Vec<vk::ImageMemoryBarrier2<'_>> = barrier
            .image_barriers
            .iter()
            .map(|b| {
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(barrier.src_stage)
                    .src_access_mask(b.src_access)
                    .dst_stage_mask(barrier.dst_stage)
                    .dst_access_mask(b.dst_access)
                    .old_layout(b.old_layout)
                    .new_layout(b.new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(b.texture.raw())
                    .subresource_range(b.texture.subresource_range())
            })
            .collect();

        // An empty batch still orders execution between the two stage masks.
        let memory_barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(barrier.src_stage)
            .dst_stage_mask(barrier.dst_stage);

        let dependency_info = if image_barriers.is_empty() {
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&memory_barrier))
        } else {
            vk::DependencyInfo::default().image_memory_barriers(&image_barriers)
        };

        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &dependency_info) };
    }

    fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, regions: &[vk::BufferCopy]) {
        unsafe {
            self.device
                .cmd_copy_buffer(self.cmd, src.raw(), dst.raw(), regions);
        }
    }

    fn clear_color_image(
        &mut self,
        texture: &Texture,
        layout: vk::ImageLayout,
        value: vk::ClearColorValue,
    ) {
        unsafe {
            self.device.cmd_clear_color_image(
                self.cmd,
                texture.raw(),
                layout,
                &value,
                &[texture.subresource_range()],
            );
        }
    }

    fn clear_depth_stencil_image(
        &mut self,
        texture: &Texture,
        layout: vk::ImageLayout,
        value: vk::ClearDepthStencilValue,
    ) {
        unsafe {
            self.device.cmd_clear_depth_stencil_image(
                self.cmd,
                texture.raw(),
                layout,
                &value,
                &[texture.subresource_range()],
            );
        }
    }

    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(self.cmd, bind_point, pipeline) };
    }

    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(self.cmd, bind_point, layout, first_set, sets, &[]);
        }
    }

    fn bind_vertex_buffer(&mut self, buffer: &Buffer, offset: u64) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.cmd, 0, &[buffer.raw()], &[offset]);
        }
    }

    fn bind_index_buffer(&mut self, buffer: &Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.cmd, buffer.raw(), offset, index_type);
        }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device
                .cmd_draw(self.cmd, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(self.cmd, x, y, z) };
    }
}
