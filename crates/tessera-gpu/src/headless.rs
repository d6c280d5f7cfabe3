//! CPU-side simulation of [`GpuDevice`].
//!
//! `HeadlessDevice` keeps buffer contents in memory, executes copies when a
//! submission is made, enforces descriptor pool limits the way a driver does,
//! and logs every recorded command. It needs no GPU, which makes it the device
//! used by tests, benchmarks and tooling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk::{self, Handle};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::barrier::PipelineBarrier;
use crate::descriptors::DescriptorSetInfo;
use crate::device::{CommandRecorder, GpuDevice, RecordFn};
use crate::error::{GpuError, Result};
use crate::resource::{Buffer, BufferDesc, RetireQueue, Texture, TextureDesc};
use crate::deferred::RetiredResource;

/// Submissions kept for inspection. Older ones are dropped first.
pub const SUBMISSION_LOG_LEN: usize = 256;

/// One image transition inside a recorded barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl RecordedImageBarrier {
    /// Whether the barrier changes the image layout.
    pub fn is_transition(&self) -> bool {
        self.old_layout != self.new_layout
    }
}

/// A recorded pipeline barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBarrier {
    pub src_stage: vk::PipelineStageFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub images: Vec<RecordedImageBarrier>,
}

impl RecordedBarrier {
    /// Find the transition recorded for an image, if any.
    pub fn for_image(&self, image: vk::Image) -> Option<&RecordedImageBarrier> {
        self.images.iter().find(|b| b.image == image)
    }
}

/// A command captured by [`HeadlessRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    PipelineBarrier(RecordedBarrier),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        /// `(src_offset, dst_offset, size)` per region.
        regions: Vec<(u64, u64, u64)>,
    },
    ClearColorImage {
        image: vk::Image,
        layout: vk::ImageLayout,
    },
    ClearDepthStencilImage {
        image: vk::Image,
        layout: vk::ImageLayout,
    },
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    BindVertexBuffer {
        buffer: vk::Buffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

/// How a submission was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
    /// Blocking one-off submission.
    Once,
    /// Queued per-frame submission.
    Frame,
}

/// The commands of one submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub kind: SubmissionKind,
    pub commands: Vec<RecordedCommand>,
}

impl Submission {
    /// All pipeline barriers in recording order.
    pub fn barriers(&self) -> impl Iterator<Item = &RecordedBarrier> {
        self.commands.iter().filter_map(|c| match c {
            RecordedCommand::PipelineBarrier(barrier) => Some(barrier),
            _ => None,
        })
    }
}

/// Resource and submission counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub buffers_created: u64,
    pub textures_created: u64,
    pub descriptor_pools_created: u64,
    pub live_buffers: usize,
    pub live_textures: usize,
    pub live_descriptor_pools: usize,
    pub submissions: usize,
    pub flushes: u64,
}

struct HeadlessImage {
    extent: vk::Extent2D,
    clear_count: u32,
}

struct HeadlessPool {
    max_sets: u32,
    sizes: Vec<vk::DescriptorPoolSize>,
    sets_left: u32,
    sizes_left: HashMap<vk::DescriptorType, u32>,
}

impl HeadlessPool {
    fn new(max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> Self {
        let mut pool = Self {
            max_sets,
            sizes: sizes.to_vec(),
            sets_left: 0,
            sizes_left: HashMap::new(),
        };
        pool.reset();
        pool
    }

    fn reset(&mut self) {
        self.sets_left = self.max_sets;
        self.sizes_left.clear();
        for size in &self.sizes {
            *self.sizes_left.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
    }
}

#[derive(Default)]
struct HeadlessState {
    buffers: HashMap<vk::Buffer, Vec<u8>>,
    images: HashMap<vk::Image, HeadlessImage>,
    layouts: HashMap<vk::DescriptorSetLayout, DescriptorSetInfo>,
    pools: HashMap<vk::DescriptorPool, HeadlessPool>,
    submissions: VecDeque<Submission>,
    stats: HeadlessStats,
}

impl HeadlessState {
    fn execute(&mut self, commands: &[RecordedCommand]) -> Result<()> {
        for command in commands {
            match command {
                RecordedCommand::CopyBuffer { src, dst, regions } => {
                    for &(src_offset, dst_offset, size) in regions {
                        let bytes = self
                            .buffers
                            .get(src)
                            .ok_or_else(|| GpuError::ResourceNotFound(format!("{src:?}")))?
                            .get(src_offset as usize..(src_offset + size) as usize)
                            .ok_or(GpuError::OutOfBounds {
                                what: "copy source",
                                offset: src_offset,
                                end: src_offset + size,
                                size: 0,
                            })?
                            .to_vec();
                        let target = self
                            .buffers
                            .get_mut(dst)
                            .ok_or_else(|| GpuError::ResourceNotFound(format!("{dst:?}")))?;
                        let target_len = target.len() as u64;
                        target
                            .get_mut(dst_offset as usize..(dst_offset + size) as usize)
                            .ok_or(GpuError::OutOfBounds {
                                what: "copy destination",
                                offset: dst_offset,
                                end: dst_offset + size,
                                size: target_len,
                            })?
                            .copy_from_slice(&bytes);
                    }
                }
                RecordedCommand::ClearColorImage { image, .. }
                | RecordedCommand::ClearDepthStencilImage { image, .. } => {
                    let image = self
                        .images
                        .get_mut(image)
                        .ok_or_else(|| GpuError::ResourceNotFound(format!("{image:?}")))?;
                    image.clear_count += 1;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn destroy(&mut self, resource: RetiredResource) {
        match resource {
            RetiredResource::Buffer(raw) => {
                self.buffers.remove(&raw);
            }
            RetiredResource::Image { image, .. } => {
                self.images.remove(&image);
            }
            RetiredResource::DescriptorPool(pool) => {
                self.pools.remove(&pool);
            }
        }
    }
}

/// A [`GpuDevice`] that runs entirely on the CPU.
pub struct HeadlessDevice {
    state: Mutex<HeadlessState>,
    next_handle: AtomicU64,
    retire: RetireQueue,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// Create an empty device.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeadlessState::default()),
            next_handle: AtomicU64::new(1),
            retire: RetireQueue::default(),
        }
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn run(&self, kind: SubmissionKind, record: &mut RecordFn<'_>) -> Result<()> {
        let mut recorder = HeadlessRecorder::default();
        record(&mut recorder);

        let mut state = self.state.lock();
        state.execute(&recorder.commands)?;
        if state.submissions.len() == SUBMISSION_LOG_LEN {
            state.submissions.pop_front();
        }
        state.submissions.push_back(Submission {
            kind,
            commands: recorder.commands,
        });
        state.stats.submissions += 1;
        Ok(())
    }

    /// Read back the full contents of a buffer.
    pub fn read_buffer(&self, buffer: &Buffer) -> Result<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&buffer.raw())
            .cloned()
            .ok_or_else(|| GpuError::ResourceNotFound(buffer.name().to_string()))
    }

    /// Number of times an image has been cleared.
    pub fn clear_count(&self, image: vk::Image) -> u32 {
        self.state
            .lock()
            .images
            .get(&image)
            .map_or(0, |image| image.clear_count)
    }

    /// Extent an image was created with.
    pub fn image_extent(&self, image: vk::Image) -> Option<vk::Extent2D> {
        self.state.lock().images.get(&image).map(|image| image.extent)
    }

    /// The last [`SUBMISSION_LOG_LEN`] submissions, oldest first.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.iter().cloned().collect()
    }

    /// The most recent submission.
    pub fn last_submission(&self) -> Option<Submission> {
        self.state.lock().submissions.back().cloned()
    }

    /// Forget the recorded submissions.
    pub fn clear_submissions(&self) {
        self.state.lock().submissions.clear();
    }

    /// Current counters.
    pub fn stats(&self) -> HeadlessStats {
        let state = self.state.lock();
        HeadlessStats {
            live_buffers: state.buffers.len(),
            live_textures: state.images.len(),
            live_descriptor_pools: state.pools.len(),
            ..state.stats
        }
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer> {
        let raw = vk::Buffer::from_raw(self.next_raw());
        let mut state = self.state.lock();
        state.buffers.insert(raw, vec![0; desc.size as usize]);
        state.stats.buffers_created += 1;
        Ok(Buffer::new(raw, desc.clone(), self.retire.clone()))
    }

    fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let contents = state
            .buffers
            .get_mut(&buffer.raw())
            .ok_or_else(|| GpuError::ResourceNotFound(buffer.name().to_string()))?;
        let end = offset + data.len() as u64;
        let size = contents.len() as u64;
        contents
            .get_mut(offset as usize..end as usize)
            .ok_or(GpuError::OutOfBounds {
                what: "buffer",
                offset,
                end,
                size,
            })?
            .copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<Texture> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(GpuError::InvalidState(format!(
                "texture '{}' has a zero extent",
                desc.name
            )));
        }
        let image = vk::Image::from_raw(self.next_raw());
        let view = vk::ImageView::from_raw(self.next_raw());
        let mut state = self.state.lock();
        state.images.insert(
            image,
            HeadlessImage {
                extent: desc.extent,
                clear_count: 0,
            },
        );
        state.stats.textures_created += 1;
        Ok(Texture::new(image, view, desc.clone(), self.retire.clone()))
    }

    fn create_descriptor_set_layout(
        &self,
        info: &DescriptorSetInfo,
    ) -> Result<vk::DescriptorSetLayout> {
        let layout = vk::DescriptorSetLayout::from_raw(self.next_raw());
        self.state.lock().layouts.insert(layout, info.clone());
        Ok(layout)
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let pool = vk::DescriptorPool::from_raw(self.next_raw());
        let mut state = self.state.lock();
        state.pools.insert(pool, HeadlessPool::new(max_sets, sizes));
        state.stats.descriptor_pools_created += 1;
        Ok(pool)
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let mut state = self.state.lock();
        let mut requested: HashMap<vk::DescriptorType, u32> = HashMap::new();
        for layout in layouts {
            let info = state
                .layouts
                .get(layout)
                .ok_or_else(|| GpuError::ResourceNotFound(format!("{layout:?}")))?;
            for (ty, count) in info.type_counts() {
                *requested.entry(ty).or_insert(0) += count;
            }
        }

        let native = state
            .pools
            .get_mut(&pool)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("{pool:?}")))?;
        let fits = layouts.len() as u32 <= native.sets_left
            && requested
                .iter()
                .all(|(ty, count)| native.sizes_left.get(ty).copied().unwrap_or(0) >= *count);
        if !fits {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }

        native.sets_left -= layouts.len() as u32;
        for (ty, count) in requested {
            if let Some(left) = native.sizes_left.get_mut(&ty) {
                *left -= count;
            }
        }
        drop(state);

        Ok(layouts
            .iter()
            .map(|_| vk::DescriptorSet::from_raw(self.next_raw()))
            .collect())
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        self.state
            .lock()
            .pools
            .get_mut(&pool)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("{pool:?}")))?
            .reset();
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.retire
            .lock()
            .retire(RetiredResource::DescriptorPool(pool));
    }

    fn submit_once(&self, record: &mut RecordFn<'_>) -> Result<()> {
        self.run(SubmissionKind::Once, record)
    }

    fn submit(&self, record: &mut RecordFn<'_>) -> Result<()> {
        self.run(SubmissionKind::Frame, record)
    }

    fn flush(&self) -> Result<()> {
        let ready = self.retire.lock().end_frame();
        let mut state = self.state.lock();
        for resource in ready {
            state.destroy(resource);
        }
        state.stats.flushes += 1;
        Ok(())
    }
}

/// Captures commands into a list.
#[derive(Debug, Default)]
pub struct HeadlessRecorder {
    commands: Vec<RecordedCommand>,
}

impl CommandRecorder for HeadlessRecorder {
    fn pipeline_barrier(&mut self, barrier: &PipelineBarrier) {
        self.commands
            .push(RecordedCommand::PipelineBarrier(RecordedBarrier {
                src_stage: barrier.src_stage,
                dst_stage: barrier.dst_stage,
                images: barrier
                    .image_barriers
                    .iter()
                    .map(|b| RecordedImageBarrier {
                        image: b.texture.raw(),
                        old_layout: b.old_layout,
                        new_layout: b.new_layout,
                        src_access: b.src_access,
                        dst_access: b.dst_access,
                    })
                    .collect(),
            }));
    }

    fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, regions: &[vk::BufferCopy]) {
        self.commands.push(RecordedCommand::CopyBuffer {
            src: src.raw(),
            dst: dst.raw(),
            regions: regions
                .iter()
                .map(|r| (r.src_offset, r.dst_offset, r.size))
                .collect(),
        });
    }

    fn clear_color_image(
        &mut self,
        texture: &Texture,
        layout: vk::ImageLayout,
        _value: vk::ClearColorValue,
    ) {
        self.commands.push(RecordedCommand::ClearColorImage {
            image: texture.raw(),
            layout,
        });
    }

    fn clear_depth_stencil_image(
        &mut self,
        texture: &Texture,
        layout: vk::ImageLayout,
        _value: vk::ClearDepthStencilValue,
    ) {
        self.commands.push(RecordedCommand::ClearDepthStencilImage {
            image: texture.raw(),
            layout,
        });
    }

    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.commands
            .push(RecordedCommand::BindPipeline { bind_point, pipeline });
    }

    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.commands.push(RecordedCommand::BindDescriptorSets {
            bind_point,
            first_set,
            sets: sets.to_vec(),
        });
    }

    fn bind_vertex_buffer(&mut self, buffer: &Buffer, offset: u64) {
        self.commands.push(RecordedCommand::BindVertexBuffer {
            buffer: buffer.raw(),
            offset,
        });
    }

    fn bind_index_buffer(&mut self, buffer: &Buffer, offset: u64, index_type: vk::IndexType) {
        self.commands.push(RecordedCommand::BindIndexBuffer {
            buffer: buffer.raw(),
            offset,
            index_type,
        });
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.commands.push(RecordedCommand::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.commands.push(RecordedCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
        });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(RecordedCommand::Dispatch { x, y, z });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::DescriptorSetLayoutBuilder;
    use gpu_allocator::MemoryLocation;

    fn buffer(device: &HeadlessDevice, size: u64) -> Buffer {
        device
            .create_buffer(&BufferDesc::new(
                "test",
                size,
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuOnly,
            ))
            .unwrap()
    }

    #[test]
    fn submission_log_keeps_the_most_recent() {
        let device = HeadlessDevice::new();
        let total = SUBMISSION_LOG_LEN as u32 + 10;
        for i in 0..total {
            device.submit(&mut |rec| rec.dispatch(i, 1, 1)).unwrap();
        }

        let log = device.submissions();
        assert_eq!(log.len(), SUBMISSION_LOG_LEN);
        assert_eq!(device.stats().submissions, total as usize);
        assert_eq!(
            log[0].commands,
            [RecordedCommand::Dispatch { x: 10, y: 1, z: 1 }]
        );
        assert_eq!(
            device.last_submission().unwrap().commands,
            [RecordedCommand::Dispatch { x: total - 1, y: 1, z: 1 }]
        );
    }

    #[test]
    fn copies_execute_on_submit() {
        let device = HeadlessDevice::new();
        let src = buffer(&device, 8);
        let dst = buffer(&device, 16);
        device.write_buffer(&src, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        device
            .submit_once(&mut |rec| {
                rec.copy_buffer(
                    &src,
                    &dst,
                    &[vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 4,
                        size: 8,
                    }],
                );
            })
            .unwrap();

        let contents = device.read_buffer(&dst).unwrap();
        assert_eq!(&contents[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(device.last_submission().unwrap().kind, SubmissionKind::Once);
    }

    #[test]
    fn out_of_range_write_fails() {
        let device = HeadlessDevice::new();
        let buf = buffer(&device, 4);
        assert!(matches!(
            device.write_buffer(&buf, 2, &[0; 4]),
            Err(GpuError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn dropped_resources_survive_until_flush() {
        let device = HeadlessDevice::new();
        let buf = buffer(&device, 4);
        drop(buf);
        assert_eq!(device.stats().live_buffers, 1);
        device.flush().unwrap();
        assert_eq!(device.stats().live_buffers, 0);
    }

    #[test]
    fn descriptor_pool_enforces_native_limits() {
        let device = HeadlessDevice::new();
        let info = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build();
        let layout = device.create_descriptor_set_layout(&info).unwrap();
        let pool = device
            .create_descriptor_pool(
                4,
                &[vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 2,
                }],
            )
            .unwrap();

        assert_eq!(
            device
                .allocate_descriptor_sets(pool, &[layout, layout])
                .unwrap()
                .len(),
            2
        );
        assert!(matches!(
            device.allocate_descriptor_sets(pool, &[layout]),
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
        ));

        device.reset_descriptor_pool(pool).unwrap();
        assert!(device.allocate_descriptor_sets(pool, &[layout]).is_ok());
    }

    #[test]
    fn zero_sized_texture_is_rejected() {
        let device = HeadlessDevice::new();
        let desc = TextureDesc::new(
            "empty",
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        )
        .with_extent(vk::Extent2D {
            width: 0,
            height: 4,
        });
        assert!(device.create_texture(&desc).is_err());
    }
}
