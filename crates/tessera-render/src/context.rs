//! Render context: the per-device owner of the frame scheduling state.

use std::sync::Arc;

use tessera_gpu::{GpuDevice, Result, Texture};

use crate::descriptor_arena::DescriptorArena;
use crate::descriptor_pool::DescriptorPoolConfig;
use crate::heap::{Heap, HeapConfig};
use crate::render_graph::RenderGraph;

/// Configuration of a [`RenderContext`].
#[derive(Debug, Clone)]
pub struct RenderContextConfig {
    /// Vertex heap.
    pub vertex_heap: HeapConfig,
    /// Index heap.
    pub index_heap: HeapConfig,
    /// Pool shape used by the per-frame descriptor arena.
    pub descriptor_pool: DescriptorPoolConfig,
}

impl Default for RenderContextConfig {
    fn default() -> Self {
        Self {
            vertex_heap: HeapConfig::vertices(),
            index_heap: HeapConfig::indices(),
            descriptor_pool: DescriptorPoolConfig::default(),
        }
    }
}

/// Owns the device handle, the geometry heaps and the descriptor arena.
///
/// Passed explicitly to everything that records a frame. At most one frame is
/// in flight: [`begin_frame`](Self::begin_frame) waits for the previous one.
pub struct RenderContext {
    device: Arc<dyn GpuDevice>,
    vertices: Heap,
    indices: Heap,
    descriptors: DescriptorArena,
    frame: u64,
}

impl RenderContext {
    /// Create the context and its heaps.
    pub fn new(device: Arc<dyn GpuDevice>, config: RenderContextConfig) -> Result<Self> {
        let vertices = Heap::new(device.clone(), config.vertex_heap)?;
        let indices = Heap::new(device.clone(), config.index_heap)?;
        let descriptors = DescriptorArena::new(device.clone(), config.descriptor_pool);

        tracing::info!("Render context created");

        Ok(Self {
            device,
            vertices,
            indices,
            descriptors,
            frame: 0,
        })
    }

    /// Start a new frame.
    ///
    /// Waits for the device to go idle, destroys retired resources and
    /// recycles the descriptor arena. Descriptor sets from the previous frame
    /// are invalid afterwards.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&mut self) -> Result<()> {
        self.device.flush()?;
        self.descriptors.reset()?;
        self.frame += 1;
        tracing::trace!(frame = self.frame, "Frame started");
        Ok(())
    }

    /// Start a render graph for this frame.
    pub fn graph<'a>(&self, target: Texture) -> RenderGraph<'a> {
        RenderGraph::new(self.device.clone(), target)
    }

    /// Get the device.
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Get the vertex heap.
    pub fn vertices(&self) -> &Heap {
        &self.vertices
    }

    /// Get the index heap.
    pub fn indices(&self) -> &Heap {
        &self.indices
    }

    /// Get the descriptor arena.
    pub fn descriptors(&mut self) -> &mut DescriptorArena {
        &mut self.descriptors
    }

    /// Number of frames started.
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_target::{RenderTargetInfo, RenderTargetManager, RenderTargetScale};
    use ash::vk;
    use tessera_gpu::{DescriptorSetLayoutBuilder, HeadlessDevice, TextureDesc};

    #[test]
    fn heap_and_render_target_scenario() {
        let device = Arc::new(HeadlessDevice::new());
        let ctx = RenderContext::new(device.clone(), RenderContextConfig::default()).unwrap();
        let heap = ctx.vertices();
        assert_eq!(heap.committed(), 128);

        assert_eq!(heap.alloc(100).unwrap(), 128);
        assert_eq!(heap.alloc(50).unwrap(), 228);
        let pattern: Vec<u8> = (0..150).map(|i| (i * 3 + 1) as u8).collect();
        heap.write(128, &pattern).unwrap();

        assert_eq!(heap.extend_count(), 0);
        assert_eq!(heap.alloc(2000).unwrap(), 278);
        assert_eq!(heap.extend_count(), 1);
        let contents = device.read_buffer(&heap.buffer()).unwrap();
        assert_eq!(&contents[128..278], pattern.as_slice());

        let mut targets = RenderTargetManager::new(
            device.clone(),
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        );
        let gbuffer = targets
            .alloc(RenderTargetInfo::new(
                TextureDesc::new(
                    "gbuffer",
                    vk::Format::R8G8B8A8_UNORM,
                    vk::ImageUsageFlags::STORAGE,
                ),
                RenderTargetScale::Factor(0.5),
            ))
            .unwrap();
        assert_eq!(
            targets.get(gbuffer).unwrap().extent(),
            vk::Extent2D {
                width: 400,
                height: 300
            }
        );

        let resized = targets
            .update(vk::Extent2D {
                width: 1600,
                height: 1200,
            })
            .unwrap();
        assert!(resized);
        assert_eq!(
            targets.get(gbuffer).unwrap().extent(),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn begin_frame_recycles_descriptors_and_retired_resources() {
        let device = Arc::new(HeadlessDevice::new());
        let mut ctx = RenderContext::new(
            device.clone(),
            RenderContextConfig {
                descriptor_pool: DescriptorPoolConfig::new(4)
                    .with_size(vk::DescriptorType::UNIFORM_BUFFER, 4),
                ..RenderContextConfig::default()
            },
        )
        .unwrap();
        let info = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build();
        let layout = device.create_descriptor_set_layout(&info).unwrap();

        for _ in 0..3 {
            ctx.begin_frame().unwrap();
            let mut sets = Vec::new();
            ctx.descriptors().alloc(layout, &info, 6, &mut sets).unwrap();
            assert_eq!(sets.len(), 6);
        }
        assert_eq!(ctx.frame(), 3);
        assert_eq!(device.stats().descriptor_pools_created, 2);

        // Growth retires the old vertex buffer; the next frame destroys it.
        ctx.vertices().alloc(4096).unwrap();
        assert_eq!(device.stats().live_buffers, 3);
        ctx.begin_frame().unwrap();
        assert_eq!(device.stats().live_buffers, 2);
    }

    #[test]
    fn graph_uses_the_context_device() {
        let device = Arc::new(HeadlessDevice::new());
        let ctx = RenderContext::new(device.clone(), RenderContextConfig::default()).unwrap();
        let target = device
            .create_texture(&TextureDesc::new(
                "swapchain",
                vk::Format::B8G8R8A8_UNORM,
                vk::ImageUsageFlags::TRANSFER_DST,
            ))
            .unwrap();

        let mut graph = ctx.graph(target.clone());
        graph.add_pass("clear", |_| {}, |rec| rec.dispatch(1, 1, 1)).unwrap();
        graph.execute().unwrap();

        assert!(graph.target().ptr_eq(&target));
        assert_eq!(device.stats().submissions, 1);
    }
}
