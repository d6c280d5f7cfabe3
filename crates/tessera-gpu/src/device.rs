//! Device and command recording interfaces.
//!
//! The frame scheduler only talks to the GPU through these two traits. The
//! Vulkan backend implements them on top of ash; the headless backend
//! implements them on the CPU for tests and tooling.

use ash::vk;

use crate::barrier::PipelineBarrier;
use crate::descriptors::DescriptorSetInfo;
use crate::error::Result;
use crate::resource::{Buffer, BufferDesc, Texture, TextureDesc};

/// Records GPU commands into the currently open submission.
pub trait CommandRecorder {
    /// Record a pipeline barrier.
    fn pipeline_barrier(&mut self, barrier: &PipelineBarrier);

    /// Copy regions between two buffers.
    fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, regions: &[vk::BufferCopy]);

    /// Clear every texel of a colour image that is in `layout`.
    fn clear_color_image(
        &mut self,
        texture: &Texture,
        layout: vk::ImageLayout,
        value: vk::ClearColorValue,
    );

    /// Clear every texel of a depth/stencil image that is in `layout`.
    fn clear_depth_stencil_image(
        &mut self,
        texture: &Texture,
        layout: vk::ImageLayout,
        value: vk::ClearDepthStencilValue,
    );

    /// Bind a pipeline.
    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline);

    /// Bind descriptor sets starting at `first_set`.
    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );

    /// Bind a vertex buffer to binding 0.
    fn bind_vertex_buffer(&mut self, buffer: &Buffer, offset: u64);

    /// Bind an index buffer.
    fn bind_index_buffer(&mut self, buffer: &Buffer, offset: u64, index_type: vk::IndexType);

    /// Record a non-indexed draw.
    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);

    /// Record an indexed draw.
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    /// Record a compute dispatch.
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
}

/// Recording callback handed to the submission primitives.
pub type RecordFn<'a> = dyn FnMut(&mut dyn CommandRecorder) + 'a;

/// The device/queue collaborator.
///
/// All recording happens from one thread per frame and there is a single
/// submission queue. Resources created here are reference counted and
/// destroyed after the [`flush`](GpuDevice::flush) that follows their last
/// use.
pub trait GpuDevice: Send + Sync {
    /// Create a buffer.
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer>;

    /// Write bytes into a buffer at `offset`.
    ///
    /// Host-visible buffers are written directly; device-local buffers go
    /// through a blocking staging upload.
    fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Create a 2D texture with a single mip level and layer.
    fn create_texture(&self, desc: &TextureDesc) -> Result<Texture>;

    /// Create a descriptor set layout for a set shape.
    fn create_descriptor_set_layout(&self, info: &DescriptorSetInfo)
        -> Result<vk::DescriptorSetLayout>;

    /// Create a native descriptor pool.
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;

    /// Allocate one set per layout from a pool.
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>>;

    /// Reset a pool, invalidating every set allocated from it.
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()>;

    /// Retire a pool; it is destroyed after the next flush.
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Record a short command stream, submit it, and wait for the queue to
    /// go idle before returning.
    ///
    /// This stalls the pipeline; keep it off the steady-state frame path.
    fn submit_once(&self, record: &mut RecordFn<'_>) -> Result<()>;

    /// Record a command stream and queue it without waiting.
    ///
    /// `record` may write buffers and call `submit_once` while it records;
    /// that work reaches the queue before this stream does. It must not call
    /// `flush`.
    fn submit(&self, record: &mut RecordFn<'_>) -> Result<()>;

    /// Wait for the queue to go idle, recycle per-frame command storage and
    /// destroy every retired resource.
    fn flush(&self) -> Result<()>;
}
