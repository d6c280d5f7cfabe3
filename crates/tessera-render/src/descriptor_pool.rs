//! Fixed-capacity descriptor pool with pre-checked budgets.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use hashbrown::HashMap;
use tessera_gpu::{DescriptorSetInfo, GpuDevice, Result};

/// Capacity of a single descriptor pool.
#[derive(Debug, Clone)]
pub struct DescriptorPoolConfig {
    /// Maximum number of sets.
    pub max_sets: u32,
    /// Descriptor budget per type.
    pub sizes: Vec<vk::DescriptorPoolSize>,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self::new(256)
            .with_size(vk::DescriptorType::UNIFORM_BUFFER, 256)
            .with_size(vk::DescriptorType::STORAGE_BUFFER, 256)
            .with_size(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 512)
            .with_size(vk::DescriptorType::SAMPLED_IMAGE, 256)
            .with_size(vk::DescriptorType::STORAGE_IMAGE, 256)
            .with_size(vk::DescriptorType::SAMPLER, 64)
    }
}

impl DescriptorPoolConfig {
    /// A pool of `max_sets` sets with no descriptor budget yet.
    pub fn new(max_sets: u32) -> Self {
        Self {
            max_sets,
            sizes: Vec::new(),
        }
    }

    /// Add budget for a descriptor type.
    pub fn with_size(mut self, ty: vk::DescriptorType, descriptor_count: u32) -> Self {
        self.sizes.push(vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        });
        self
    }

    fn budgets(&self) -> HashMap<vk::DescriptorType, u32> {
        let mut budgets = HashMap::new();
        for size in &self.sizes {
            *budgets.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
        budgets
    }
}

/// A native descriptor pool that tracks its remaining capacity.
///
/// Requests are checked against the remaining budget before the native
/// allocation is attempted. Exceeding it means the pool was sized wrongly
/// and panics.
pub struct DescriptorPool {
    device: Arc<dyn GpuDevice>,
    raw: vk::DescriptorPool,
    config: DescriptorPoolConfig,
    available_sets: u32,
    available_sizes: HashMap<vk::DescriptorType, u32>,
}

impl DescriptorPool {
    /// Create the native pool.
    pub fn new(device: Arc<dyn GpuDevice>, config: DescriptorPoolConfig) -> Result<Self> {
        let raw = device.create_descriptor_pool(config.max_sets, &config.sizes)?;
        Ok(Self {
            device,
            raw,
            available_sets: config.max_sets,
            available_sizes: config.budgets(),
            config,
        })
    }

    /// Get the raw pool handle.
    pub fn raw(&self) -> vk::DescriptorPool {
        self.raw
    }

    /// Sets that can still be allocated.
    pub fn available_sets(&self) -> u32 {
        self.available_sets
    }

    /// Remaining budget for a descriptor type.
    pub fn available_size(&self, ty: vk::DescriptorType) -> u32 {
        self.available_sizes.get(&ty).copied().unwrap_or(0)
    }

    /// Whether nothing has been allocated since creation or the last reset.
    pub fn is_untouched(&self) -> bool {
        self.available_sets == self.config.max_sets
    }

    /// How many more sets of this shape fit in the pool.
    pub fn available_count(&self, info: &DescriptorSetInfo) -> u32 {
        if self.available_sets == 0 {
            return 0;
        }
        info.type_counts()
            .into_iter()
            .filter(|&(_, per_set)| per_set > 0)
            .map(|(ty, per_set)| self.available_size(ty) / per_set)
            .fold(self.available_sets, u32::min)
    }

    /// Allocate `count` sets of `layout` and append them to `out`.
    ///
    /// # Panics
    /// If the request exceeds the remaining set count or the remaining
    /// budget of any descriptor type.
    pub fn alloc(
        &mut self,
        layout: vk::DescriptorSetLayout,
        info: &DescriptorSetInfo,
        count: u32,
        out: &mut Vec<vk::DescriptorSet>,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        assert!(
            count <= self.available_sets,
            "descriptor pool overrun: {count} sets requested, {} available",
            self.available_sets
        );
        let type_counts = info.type_counts();
        for &(ty, per_set) in &type_counts {
            let needed = per_set * count;
            let available = self.available_size(ty);
            assert!(
                needed <= available,
                "descriptor pool overrun: {needed} descriptors of {ty:?} requested, {available} available"
            );
        }

        let layouts = vec![layout; count as usize];
        let sets = self.device.allocate_descriptor_sets(self.raw, &layouts)?;

        self.available_sets -= count;
        for (ty, per_set) in type_counts {
            if let Some(available) = self.available_sizes.get_mut(&ty) {
                *available -= per_set * count;
            }
        }
        out.extend(sets);
        Ok(())
    }

    /// Restore the full budget and reset the native pool.
    ///
    /// Every set allocated from the pool becomes invalid.
    pub fn reset(&mut self) -> Result<()> {
        self.device.reset_descriptor_pool(self.raw)?;
        self.available_sets = self.config.max_sets;
        self.available_sizes = self.config.budgets();
        Ok(())
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.raw);
    }
}

impl fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("raw", &self.raw)
            .field("available_sets", &self.available_sets)
            .field("available_sizes", &self.available_sizes)
            .finish()
    }
}
