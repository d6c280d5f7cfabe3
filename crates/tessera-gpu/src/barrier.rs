//! Pipeline barrier records.

use ash::vk;

use crate::resource::Texture;

/// Layout and access transition of a single image.
#[derive(Debug, Clone)]
pub struct ImageBarrier {
    /// Image being transitioned.
    pub texture: Texture,
    /// Layout before the barrier.
    pub old_layout: vk::ImageLayout,
    /// Layout after the barrier.
    pub new_layout: vk::ImageLayout,
    /// Accesses that must be made available.
    pub src_access: vk::AccessFlags2,
    /// Accesses that must see the results.
    pub dst_access: vk::AccessFlags2,
}

/// One pipeline barrier command.
///
/// The stage masks are shared by every image barrier in the batch.
#[derive(Debug, Clone)]
pub struct PipelineBarrier {
    /// Stages that must complete before the barrier.
    pub src_stage: vk::PipelineStageFlags2,
    /// Stages that wait on the barrier.
    pub dst_stage: vk::PipelineStageFlags2,
    /// Per-image transitions.
    pub image_barriers: Vec<ImageBarrier>,
}

impl PipelineBarrier {
    /// Find the barrier for an image, if any.
    pub fn for_image(&self, image: vk::Image) -> Option<&ImageBarrier> {
        self.image_barriers
            .iter()
            .find(|barrier| barrier.texture.raw() == image)
    }
}
