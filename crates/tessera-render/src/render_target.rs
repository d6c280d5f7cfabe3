//! Transient render targets that follow the viewport size.
//!
//! A render target is registered once with a texture template and a scale
//! rule. Every [`RenderTargetManager::update`] recomputes the wanted size from
//! the reference extent; targets whose size changed get a fresh texture,
//! and all fresh textures of one update are cleared together in a single
//! blocking submission. A texture is never resized in place.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ash::vk;
use tessera_gpu::{GpuDevice, ImageBarrier, PipelineBarrier, Result, Texture, TextureDesc};

/// Handle of a registered render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RenderTargetId(u32);

/// Size rule of a render target, relative to the reference extent.
#[derive(Clone)]
pub enum RenderTargetScale {
    /// Multiply both dimensions by a factor, rounding down.
    Factor(f32),
    /// Ignore the reference and use a fixed size.
    Fixed(vk::Extent2D),
    /// Arbitrary mapping from the reference extent.
    Custom(Arc<dyn Fn(vk::Extent2D) -> vk::Extent2D + Send + Sync>),
}

impl RenderTargetScale {
    /// Full resolution.
    pub fn full() -> Self {
        Self::Factor(1.0)
    }

    /// Wrap a custom scale function.
    pub fn custom(f: impl Fn(vk::Extent2D) -> vk::Extent2D + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Resolve the size for a reference extent, never smaller than 1x1.
    pub fn resolve(&self, reference: vk::Extent2D) -> vk::Extent2D {
        let extent = match self {
            // Multiplied in the factor's own precision so 0.7 * 1000 is 700.
            Self::Factor(factor) => vk::Extent2D {
                width: (reference.width as f32 * factor).floor() as u32,
                height: (reference.height as f32 * factor).floor() as u32,
            },
            Self::Fixed(extent) => *extent,
            Self::Custom(f) => f(reference),
        };
        vk::Extent2D {
            width: extent.width.max(1),
            height: extent.height.max(1),
        }
    }
}

impl From<f32> for RenderTargetScale {
    fn from(factor: f32) -> Self {
        Self::Factor(factor)
    }
}

impl fmt::Debug for RenderTargetScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Factor(factor) => f.debug_tuple("Factor").field(factor).finish(),
            Self::Fixed(extent) => f.debug_tuple("Fixed").field(extent).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Template and scale rule of a render target.
#[derive(Debug, Clone)]
pub struct RenderTargetInfo {
    /// Texture template. Its extent is ignored.
    pub desc: TextureDesc,
    /// Size rule.
    pub scale: RenderTargetScale,
}

impl RenderTargetInfo {
    /// Create a render target description.
    pub fn new(desc: TextureDesc, scale: impl Into<RenderTargetScale>) -> Self {
        Self {
            desc,
            scale: scale.into(),
        }
    }

    fn texture_desc(&self, extent: vk::Extent2D) -> TextureDesc {
        let mut desc = self.desc.clone().with_extent(extent);
        desc.usage |= vk::ImageUsageFlags::TRANSFER_DST;
        desc
    }
}

struct RenderTargetState {
    info: RenderTargetInfo,
    texture: Option<Texture>,
    resized: bool,
}

impl RenderTargetState {
    /// Replace the texture if the wanted size changed. Returns the new texture.
    fn resolve(
        &mut self,
        device: &dyn GpuDevice,
        reference: vk::Extent2D,
    ) -> Result<Option<Texture>> {
        let extent = self.info.scale.resolve(reference);
        if self
            .texture
            .as_ref()
            .is_some_and(|texture| texture.extent() == extent)
        {
            self.resized = false;
            return Ok(None);
        }

        let texture = device.create_texture(&self.info.texture_desc(extent))?;
        tracing::debug!(
            name = %self.info.desc.name,
            width = extent.width,
            height = extent.height,
            "Replaced render target"
        );
        self.texture = Some(texture.clone());
        self.resized = true;
        Ok(Some(texture))
    }
}

/// Owns the transient render targets of a view.
pub struct RenderTargetManager {
    device: Arc<dyn GpuDevice>,
    reference: vk::Extent2D,
    next_id: u32,
    targets: BTreeMap<RenderTargetId, RenderTargetState>,
}

impl RenderTargetManager {
    /// Create a manager resolving against `initial_extent` until the first update.
    pub fn new(device: Arc<dyn GpuDevice>, initial_extent: vk::Extent2D) -> Self {
        Self {
            device,
            reference: initial_extent,
            next_id: 0,
            targets: BTreeMap::new(),
        }
    }

    /// Register a render target and resolve its first texture.
    pub fn alloc(&mut self, info: RenderTargetInfo) -> Result<RenderTargetId> {
        let id = RenderTargetId(self.next_id);
        self.next_id += 1;

        let mut state = RenderTargetState {
            info,
            texture: None,
            resized: false,
        };
        let created = state.resolve(self.device.as_ref(), self.reference)?;
        self.targets.insert(id, state);

        if let Some(texture) = created {
            self.clear(&[texture])?;
        }
        Ok(id)
    }

    /// Resolve every target against a new reference extent.
    ///
    /// Returns whether any target got a new texture.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn update(&mut self, reference: vk::Extent2D) -> Result<bool> {
        self.reference = reference;

        let mut created = Vec::new();
        for state in self.targets.values_mut() {
            if let Some(texture) = state.resolve(self.device.as_ref(), reference)? {
                created.push(texture);
            }
        }

        if created.is_empty() {
            return Ok(false);
        }
        self.clear(&created)?;
        Ok(true)
    }

    /// The current texture of a target.
    pub fn get(&self, id: RenderTargetId) -> Option<Texture> {
        self.targets.get(&id).and_then(|state| state.texture.clone())
    }

    /// Whether the target got a new texture in the last update.
    pub fn was_resized(&self, id: RenderTargetId) -> bool {
        self.targets.get(&id).is_some_and(|state| state.resized)
    }

    /// Forget a target. Its texture lives on while other handles hold it.
    pub fn free(&mut self, id: RenderTargetId) -> bool {
        self.targets.remove(&id).is_some()
    }

    /// Extent of the last update.
    pub fn reference_extent(&self) -> vk::Extent2D {
        self.reference
    }

    /// Number of registered targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether no targets are registered.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn clear(&self, textures: &[Texture]) -> Result<()> {
        let to_transfer = PipelineBarrier {
            src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags2::TRANSFER,
            image_barriers: textures
                .iter()
                .map(|texture| ImageBarrier {
                    texture: texture.clone(),
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    src_access: vk::AccessFlags2::NONE,
                    dst_access: vk::AccessFlags2::TRANSFER_WRITE,
                })
                .collect(),
        };
        let to_general = PipelineBarrier {
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            image_barriers: textures
                .iter()
                .map(|texture| ImageBarrier {
                    texture: texture.clone(),
                    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    new_layout: vk::ImageLayout::GENERAL,
                    src_access: vk::AccessFlags2::TRANSFER_WRITE,
                    dst_access: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
                })
                .collect(),
        };

        self.device.submit_once(&mut |rec| {
            rec.pipeline_barrier(&to_transfer);
            for texture in textures {
                if texture.aspect().contains(vk::ImageAspectFlags::COLOR) {
                    rec.clear_color_image(
                        texture,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ClearColorValue {
                            float32: [0.0, 0.0, 0.0, 0.0],
                        },
                    );
                } else {
                    rec.clear_depth_stencil_image(
                        texture,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ClearDepthStencilValue {
                            depth: 1.0,
                            stencil: 0,
                        },
                    );
                }
            }
            rec.pipeline_barrier(&to_general);
        })?;

        for texture in textures {
            texture.set_layout(vk::ImageLayout::GENERAL);
        }
        tracing::trace!(count = textures.len(), "Cleared render targets");
        Ok(())
    }
}

impl fmt::Debug for RenderTargetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTargetManager")
            .field("reference", &self.reference)
            .field("targets", &self.targets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_gpu::{HeadlessDevice, RecordedCommand, SubmissionKind};

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn color(name: &str) -> TextureDesc {
        TextureDesc::new(
            name,
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
        )
    }

    fn depth() -> TextureDesc {
        TextureDesc::new(
            "depth",
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }

    #[test]
    fn factor_resolves_and_reuses() {
        let device = Arc::new(HeadlessDevice::new());
        let mut targets = RenderTargetManager::new(device.clone(), extent(800, 600));
        let id = targets
            .alloc(RenderTargetInfo::new(
                color("half").with_filter(vk::Filter::NEAREST),
                RenderTargetScale::Factor(0.5),
            ))
            .unwrap();
        let first = targets.get(id).unwrap();
        assert_eq!(first.extent(), extent(400, 300));

        assert!(!targets.update(extent(800, 600)).unwrap());
        assert!(!targets.was_resized(id));
        assert!(targets.get(id).unwrap().ptr_eq(&first));

        assert!(targets.update(extent(1600, 1200)).unwrap());
        assert!(targets.was_resized(id));
        let second = targets.get(id).unwrap();
        assert_eq!(second.extent(), extent(800, 600));
        assert!(!second.ptr_eq(&first));
        assert_eq!(second.filter(), vk::Filter::NEAREST);
        assert_eq!(device.image_extent(second.raw()), Some(extent(800, 600)));
    }

    #[test]
    fn factor_rounds_down() {
        let scale = RenderTargetScale::Factor(0.5);
        assert_eq!(scale.resolve(extent(801, 333)), extent(400, 166));
        let third = RenderTargetScale::Factor(1.0 / 3.0);
        assert_eq!(third.resolve(extent(1920, 1080)), extent(640, 360));
    }

    #[test]
    fn decimal_factors_are_not_a_pixel_short() {
        let scale = RenderTargetScale::Factor(0.7);
        assert_eq!(scale.resolve(extent(1000, 10)), extent(700, 7));
        let scale = RenderTargetScale::Factor(0.6);
        assert_eq!(scale.resolve(extent(1920, 10)), extent(1152, 6));
    }

    #[test]
    fn zero_sizes_clamp_to_one() {
        let device = Arc::new(HeadlessDevice::new());
        let mut targets = RenderTargetManager::new(device, extent(0, 0));
        let id = targets
            .alloc(RenderTargetInfo::new(color("tiny"), RenderTargetScale::Factor(0.25)))
            .unwrap();
        assert_eq!(targets.get(id).unwrap().extent(), extent(1, 1));

        targets.update(extent(2, 1000)).unwrap();
        assert_eq!(targets.get(id).unwrap().extent(), extent(1, 250));

        let fixed = RenderTargetScale::Fixed(extent(0, 16));
        assert_eq!(fixed.resolve(extent(800, 600)), extent(1, 16));
    }

    #[test]
    fn custom_scale_is_used() {
        let device = Arc::new(HeadlessDevice::new());
        let mut targets = RenderTargetManager::new(device, extent(1000, 500));
        let id = targets
            .alloc(RenderTargetInfo::new(
                color("square"),
                RenderTargetScale::custom(|reference| {
                    let side = reference.width.min(reference.height);
                    vk::Extent2D {
                        width: side,
                        height: side,
                    }
                }),
            ))
            .unwrap();
        assert_eq!(targets.get(id).unwrap().extent(), extent(500, 500));
    }

    #[test]
    fn new_textures_are_cleared_once_in_one_submission() {
        let device = Arc::new(HeadlessDevice::new());
        let mut targets = RenderTargetManager::new(device.clone(), extent(64, 64));
        let full = targets
            .alloc(RenderTargetInfo::new(color("full"), RenderTargetScale::full()))
            .unwrap();
        let fixed = targets
            .alloc(RenderTargetInfo::new(
                color("lut"),
                RenderTargetScale::Fixed(extent(32, 32)),
            ))
            .unwrap();
        let depth_id = targets
            .alloc(RenderTargetInfo::new(depth(), RenderTargetScale::full()))
            .unwrap();
        device.clear_submissions();

        assert!(targets.update(extent(128, 96)).unwrap());
        let submissions = device.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].kind, SubmissionKind::Once);

        let full_tex = targets.get(full).unwrap();
        let depth_tex = targets.get(depth_id).unwrap();
        assert!(!targets.was_resized(fixed));
        assert_eq!(device.clear_count(full_tex.raw()), 1);
        assert_eq!(device.clear_count(depth_tex.raw()), 1);

        let commands = &submissions[0].commands;
        assert!(commands.contains(&RecordedCommand::ClearColorImage {
            image: full_tex.raw(),
            layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        }));
        assert!(commands.contains(&RecordedCommand::ClearDepthStencilImage {
            image: depth_tex.raw(),
            layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        }));

        let barriers: Vec<_> = submissions[0].barriers().collect();
        assert_eq!(barriers.len(), 2);
        let last = barriers[1].for_image(full_tex.raw()).unwrap();
        assert_eq!(last.new_layout, vk::ImageLayout::GENERAL);
        assert_eq!(full_tex.current_layout(), vk::ImageLayout::GENERAL);
        assert!(full_tex.usage().contains(vk::ImageUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn unchanged_update_submits_nothing() {
        let device = Arc::new(HeadlessDevice::new());
        let mut targets = RenderTargetManager::new(device.clone(), extent(64, 64));
        targets
            .alloc(RenderTargetInfo::new(color("full"), RenderTargetScale::full()))
            .unwrap();
        device.clear_submissions();

        assert!(!targets.update(extent(64, 64)).unwrap());
        assert!(device.submissions().is_empty());
    }

    #[test]
    fn freed_texture_outlives_the_entry() {
        let device = Arc::new(HeadlessDevice::new());
        let mut targets = RenderTargetManager::new(device.clone(), extent(64, 64));
        let id = targets
            .alloc(RenderTargetInfo::new(color("full"), RenderTargetScale::full()))
            .unwrap();
        let texture = targets.get(id).unwrap();

        assert!(targets.free(id));
        assert!(targets.get(id).is_none());
        assert!(targets.is_empty());

        device.flush().unwrap();
        assert_eq!(device.stats().live_textures, 1);
        drop(texture);
        device.flush().unwrap();
        assert_eq!(device.stats().live_textures, 0);
    }
}
