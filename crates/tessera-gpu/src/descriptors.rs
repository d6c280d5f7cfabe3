//! Descriptor set shapes.

use ash::vk;

/// A single binding of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    /// Binding index.
    pub binding: u32,
    /// Descriptor type.
    pub descriptor_type: vk::DescriptorType,
    /// Number of descriptors in the binding.
    pub count: u32,
    /// Shader stages that access the binding.
    pub stages: vk::ShaderStageFlags,
}

/// The shape of a descriptor set: its bindings.
///
/// Used both to create the native layout and to account for pool capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSetInfo {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetInfo {
    /// Create a set shape from bindings.
    pub fn new(bindings: Vec<DescriptorBinding>) -> Self {
        Self { bindings }
    }

    /// Get the bindings.
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    /// Whether the set has no bindings.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Total descriptors of one type across all bindings.
    pub fn count_of(&self, descriptor_type: vk::DescriptorType) -> u32 {
        self.bindings
            .iter()
            .filter(|b| b.descriptor_type == descriptor_type)
            .map(|b| b.count)
            .sum()
    }

    /// Descriptor totals per type, in first-seen order.
    pub fn type_counts(&self) -> Vec<(vk::DescriptorType, u32)> {
        let mut counts: Vec<(vk::DescriptorType, u32)> = Vec::new();
        for binding in &self.bindings {
            match counts
                .iter_mut()
                .find(|(ty, _)| *ty == binding.descriptor_type)
            {
                Some((_, count)) => *count += binding.count,
                None => counts.push((binding.descriptor_type, binding.count)),
            }
        }
        counts
    }
}

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(DescriptorBinding {
            binding,
            descriptor_type,
            count,
            stages,
        });
        self
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stages)
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stages)
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stages)
    }

    /// Add a sampled image binding.
    pub fn sampled_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stages,
        )
    }

    /// Build the set shape.
    pub fn build(self) -> DescriptorSetInfo {
        DescriptorSetInfo::new(self.bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_counts_merge_bindings_of_the_same_type() {
        let info = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::FRAGMENT)
            .sampled_image(1, vk::ShaderStageFlags::FRAGMENT)
            .binding(
                2,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                4,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .build();

        assert_eq!(
            info.type_counts(),
            vec![
                (vk::DescriptorType::UNIFORM_BUFFER, 1),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 5),
            ]
        );
        assert_eq!(info.count_of(vk::DescriptorType::STORAGE_IMAGE), 0);
    }
}
