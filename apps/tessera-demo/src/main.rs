//! Tessera frame scheduling demo.
//!
//! Drives a small deferred view (G-buffer, lighting, screen-space reflections,
//! composite) through several frames on the headless device while the
//! viewport changes size, then prints what the scheduler did.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p tessera-demo
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::sync::Arc;

use anyhow::{anyhow, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use tessera_gpu::{
    DescriptorSetInfo, DescriptorSetLayoutBuilder, GpuDevice, HeadlessDevice, Texture, TextureDesc,
};
use tessera_render::{
    RenderContext, RenderContextConfig, RenderTargetId, RenderTargetInfo, RenderTargetManager,
    RenderTargetScale,
};
use tracing::info;
#[cfg(not(feature = "profiling-tracy"))]
use tracing_subscriber::EnvFilter;

const VIEWPORTS: [(u32, u32); 6] = [
    (1280, 720),
    (1280, 720),
    (1920, 1080),
    (1920, 1080),
    (1920, 1080),
    (640, 360),
];

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    uv: [f32; 2],
}

const QUAD: [Vertex; 4] = [
    Vertex {
        position: [-1.0, -1.0, 0.0],
        uv: [0.0, 0.0],
    },
    Vertex {
        position: [1.0, -1.0, 0.0],
        uv: [1.0, 0.0],
    },
    Vertex {
        position: [1.0, 1.0, 0.0],
        uv: [1.0, 1.0],
    },
    Vertex {
        position: [-1.0, 1.0, 0.0],
        uv: [0.0, 1.0],
    },
];

const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Render targets of the deferred view.
struct ViewTargets {
    albedo: RenderTargetId,
    normal: RenderTargetId,
    depth: RenderTargetId,
    lighting: RenderTargetId,
    reflections: RenderTargetId,
    backbuffer: RenderTargetId,
}

impl ViewTargets {
    fn new(targets: &mut RenderTargetManager) -> Result<Self> {
        let color = |name: &str, format| {
            TextureDesc::new(
                name,
                format,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            )
        };
        let storage = |name: &str| {
            TextureDesc::new(
                name,
                vk::Format::R16G16B16A16_SFLOAT,
                vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            )
        };

        Ok(Self {
            albedo: targets.alloc(RenderTargetInfo::new(
                color("gbuffer_albedo", vk::Format::R8G8B8A8_UNORM),
                RenderTargetScale::full(),
            ))?,
            normal: targets.alloc(RenderTargetInfo::new(
                color("gbuffer_normal", vk::Format::A2B10G10R10_UNORM_PACK32),
                RenderTargetScale::full(),
            ))?,
            depth: targets.alloc(RenderTargetInfo::new(
                TextureDesc::new(
                    "gbuffer_depth",
                    vk::Format::D32_SFLOAT,
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                )
                .with_filter(vk::Filter::NEAREST),
                RenderTargetScale::full(),
            ))?,
            lighting: targets.alloc(RenderTargetInfo::new(
                storage("lighting"),
                RenderTargetScale::full(),
            ))?,
            reflections: targets.alloc(RenderTargetInfo::new(
                storage("ssr"),
                RenderTargetScale::Factor(0.5),
            ))?,
            backbuffer: targets.alloc(RenderTargetInfo::new(
                color("backbuffer", vk::Format::B8G8R8A8_UNORM),
                RenderTargetScale::full(),
            ))?,
        })
    }
}

fn texture(targets: &RenderTargetManager, id: RenderTargetId) -> Result<Texture> {
    targets
        .get(id)
        .ok_or_else(|| anyhow!("render target {id:?} has no texture"))
}

/// Descriptor set shapes and their native layouts.
struct Layouts {
    lighting_info: DescriptorSetInfo,
    lighting: vk::DescriptorSetLayout,
    ssr_info: DescriptorSetInfo,
    ssr: vk::DescriptorSetLayout,
}

impl Layouts {
    fn new(device: &dyn GpuDevice) -> Result<Self> {
        let lighting_info = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .sampled_image(1, vk::ShaderStageFlags::COMPUTE)
            .sampled_image(2, vk::ShaderStageFlags::COMPUTE)
            .sampled_image(3, vk::ShaderStageFlags::COMPUTE)
            .storage_image(4, vk::ShaderStageFlags::COMPUTE)
            .build();
        let ssr_info = DescriptorSetLayoutBuilder::new()
            .sampled_image(0, vk::ShaderStageFlags::COMPUTE)
            .sampled_image(1, vk::ShaderStageFlags::COMPUTE)
            .storage_image(2, vk::ShaderStageFlags::COMPUTE)
            .build();

        Ok(Self {
            lighting: device.create_descriptor_set_layout(&lighting_info)?,
            lighting_info,
            ssr: device.create_descriptor_set_layout(&ssr_info)?,
            ssr_info,
        })
    }
}

fn init_tracing() {
    #[cfg(feature = "profiling-tracy")]
    {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,tessera_gpu=trace,tessera_render=trace,tessera_demo=trace")
        });
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }
}

fn main() -> Result<()> {
    init_tracing();
    info!("Tessera demo starting...");

    let device = Arc::new(HeadlessDevice::new());
    let mut ctx = RenderContext::new(device.clone(), RenderContextConfig::default())?;
    let layouts = Layouts::new(&*device)?;

    let vertices = ctx
        .vertices()
        .alloc_owned(std::mem::size_of_val(&QUAD) as u64)?;
    vertices.set_pod(0, &QUAD)?;
    let indices = ctx
        .indices()
        .alloc_owned(std::mem::size_of_val(&QUAD_INDICES) as u64)?;
    indices.set_pod(0, &QUAD_INDICES)?;

    let (width, height) = VIEWPORTS[0];
    let mut targets =
        RenderTargetManager::new(device.clone(), vk::Extent2D { width, height });
    let view = ViewTargets::new(&mut targets)?;

    for (frame, &(width, height)) in VIEWPORTS.iter().enumerate() {
        ctx.begin_frame()?;
        let extent = vk::Extent2D { width, height };
        if targets.update(extent)? {
            info!("Resized to {}x{}", width, height);
        }

        let lighting_set = ctx
            .descriptors()
            .alloc_one(layouts.lighting, &layouts.lighting_info)?;
        let mut ssr_sets = Vec::new();
        ctx.descriptors()
            .alloc(layouts.ssr, &layouts.ssr_info, 4, &mut ssr_sets)?;

        let albedo = texture(&targets, view.albedo)?;
        let normal = texture(&targets, view.normal)?;
        let depth = texture(&targets, view.depth)?;
        let lighting = texture(&targets, view.lighting)?;
        let reflections = texture(&targets, view.reflections)?;
        let backbuffer = texture(&targets, view.backbuffer)?;
        let vertex_buffer = ctx.vertices().buffer();
        let index_buffer = ctx.indices().buffer();
        let reflections_extent = reflections.extent();

        let mut graph = ctx.graph(backbuffer.clone());
        graph.add_pass(
            "gbuffer",
            |deps| {
                deps.exit(
                    &albedo,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                )
                .exit(
                    &normal,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                )
                .exit(
                    &depth,
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                );
            },
            |rec| {
                rec.bind_vertex_buffer(&vertex_buffer, vertices.offset());
                rec.bind_index_buffer(&index_buffer, indices.offset(), vk::IndexType::UINT16);
                rec.draw_indexed(QUAD_INDICES.len() as u32, 1, 0, 0, 0);
            },
        )?;
        graph.add_pass(
            "lighting",
            |deps| {
                deps.entry(
                    &albedo,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                )
                .entry(
                    &normal,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                )
                // SSR reads depth next, so carry it through this pass.
                .access(
                    &depth,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                )
                .entry(
                    &lighting,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                    vk::ImageLayout::GENERAL,
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                )
                .exit(
                    &lighting,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                    vk::ImageLayout::GENERAL,
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                );
            },
            |rec| {
                rec.bind_descriptor_sets(
                    vk::PipelineBindPoint::COMPUTE,
                    vk::PipelineLayout::null(),
                    0,
                    &[lighting_set],
                );
                rec.dispatch(width.div_ceil(8), height.div_ceil(8), 1);
            },
        )?;
        graph.add_pass(
            "ssr",
            |deps| {
                deps.entry(
                    &depth,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                )
                .access(
                    &lighting,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                )
                .exit(
                    &reflections,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                    vk::ImageLayout::GENERAL,
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                );
            },
            |rec| {
                rec.bind_descriptor_sets(
                    vk::PipelineBindPoint::COMPUTE,
                    vk::PipelineLayout::null(),
                    0,
                    &ssr_sets,
                );
                rec.dispatch(
                    reflections_extent.width.div_ceil(8),
                    reflections_extent.height.div_ceil(8),
                    1,
                );
            },
        )?;
        graph.add_pass(
            "composite",
            |deps| {
                deps.entry(
                    &lighting,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags2::FRAGMENT_SHADER,
                )
                .entry(
                    &reflections,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags2::FRAGMENT_SHADER,
                )
                .entry(
                    &backbuffer,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                )
                .exit(
                    &backbuffer,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                );
            },
            |rec| rec.draw(3, 1, 0, 0),
        )?;
        graph.execute()?;

        if let Some(submission) = device.last_submission() {
            let transitions: usize = submission
                .barriers()
                .map(|barrier| {
                    barrier
                        .images
                        .iter()
                        .filter(|image| image.is_transition())
                        .count()
                })
                .sum();
            info!(
                frame,
                width,
                height,
                commands = submission.commands.len(),
                transitions,
                "Frame recorded"
            );
        }
    }

    ctx.begin_frame()?;
    let stats = device.stats();
    info!("Scheduler statistics:");
    info!("  Frames: {}", ctx.frame());
    info!("  Textures created: {}", stats.textures_created);
    info!("  Live textures: {}", stats.live_textures);
    info!("  Buffers created: {}", stats.buffers_created);
    info!("  Descriptor pools created: {}", stats.descriptor_pools_created);
    info!(
        "  Vertex heap: {} / {} bytes",
        ctx.vertices().committed(),
        ctx.vertices().capacity()
    );
    info!(
        "  Index heap: {} / {} bytes",
        ctx.indices().committed(),
        ctx.indices().capacity()
    );

    Ok(())
}
