//! Growable per-frame descriptor set allocator.

use std::sync::Arc;

use ash::vk;
use tessera_gpu::{DescriptorSetInfo, GpuDevice, Result};

use crate::descriptor_pool::{DescriptorPool, DescriptorPoolConfig};

/// A list of descriptor pools that grows on demand and is recycled wholesale.
///
/// Allocations fill the current pool and spill into the next one, creating
/// it when the list runs out. [`reset`](Self::reset) resets every pool and
/// starts over from the first, so pools are reused from frame to frame.
pub struct DescriptorArena {
    device: Arc<dyn GpuDevice>,
    config: DescriptorPoolConfig,
    pools: Vec<DescriptorPool>,
    current: usize,
}

impl DescriptorArena {
    /// Create an empty arena. Pools are created lazily with `config`.
    pub fn new(device: Arc<dyn GpuDevice>, config: DescriptorPoolConfig) -> Self {
        Self {
            device,
            config,
            pools: Vec::new(),
            current: 0,
        }
    }

    /// Allocate `count` sets of `layout` and append them to `out`.
    ///
    /// # Panics
    /// If a single set of this shape does not fit in an empty pool.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn alloc(
        &mut self,
        layout: vk::DescriptorSetLayout,
        info: &DescriptorSetInfo,
        count: u32,
        out: &mut Vec<vk::DescriptorSet>,
    ) -> Result<()> {
        let mut remaining = count;
        while remaining > 0 {
            if self.current == self.pools.len() {
                let pool = DescriptorPool::new(self.device.clone(), self.config.clone())?;
                tracing::debug!(
                    pools = self.pools.len() + 1,
                    max_sets = self.config.max_sets,
                    "Created descriptor pool"
                );
                self.pools.push(pool);
            }

            let pool = &mut self.pools[self.current];
            let fit = pool.available_count(info).min(remaining);
            if fit == 0 {
                assert!(
                    !pool.is_untouched(),
                    "descriptor set shape {info:?} does not fit in an empty pool of {:?}",
                    self.config
                );
                self.current += 1;
                continue;
            }

            pool.alloc(layout, info, fit, out)?;
            remaining -= fit;
            if remaining > 0 {
                self.current += 1;
            }
        }
        Ok(())
    }

    /// Allocate a single set.
    pub fn alloc_one(
        &mut self,
        layout: vk::DescriptorSetLayout,
        info: &DescriptorSetInfo,
    ) -> Result<vk::DescriptorSet> {
        let mut sets = Vec::with_capacity(1);
        self.alloc(layout, info, 1, &mut sets)?;
        sets.pop().ok_or_else(|| {
            tessera_gpu::GpuError::InvalidState("descriptor arena returned no set".into())
        })
    }

    /// Reset every pool and rewind to the first.
    ///
    /// Every set handed out since the last reset becomes invalid.
    pub fn reset(&mut self) -> Result<()> {
        for pool in &mut self.pools {
            pool.reset()?;
        }
        self.current = 0;
        Ok(())
    }

    /// Number of pools created so far.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Index of the pool the next allocation starts from.
    pub fn current_pool_index(&self) -> usize {
        self.current
    }
}

impl std::fmt::Debug for DescriptorArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorArena")
            .field("pools", &self.pools.len())
            .field("current", &self.current)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_gpu::{DescriptorSetLayoutBuilder, HeadlessDevice};

    fn storage_shape() -> DescriptorSetInfo {
        DescriptorSetLayoutBuilder::new()
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .storage_image(1, vk::ShaderStageFlags::COMPUTE)
            .build()
    }

    // Four sets of `storage_shape` per pool.
    fn four_per_pool() -> DescriptorPoolConfig {
        DescriptorPoolConfig::new(16)
            .with_size(vk::DescriptorType::STORAGE_BUFFER, 4)
            .with_size(vk::DescriptorType::STORAGE_IMAGE, 8)
    }

    fn setup() -> (Arc<HeadlessDevice>, vk::DescriptorSetLayout, DescriptorSetInfo) {
        let device = Arc::new(HeadlessDevice::new());
        let info = storage_shape();
        let layout = device.create_descriptor_set_layout(&info).unwrap();
        (device, layout, info)
    }

    #[test]
    fn spills_into_new_pools() {
        let (device, layout, info) = setup();
        let mut arena = DescriptorArena::new(device.clone(), four_per_pool());

        let mut sets = Vec::new();
        arena.alloc(layout, &info, 10, &mut sets).unwrap();

        assert_eq!(sets.len(), 10);
        assert_eq!(arena.pool_count(), 3);
        assert_eq!(device.stats().descriptor_pools_created, 3);
        assert_eq!(arena.current_pool_index(), 2);
    }

    #[test]
    fn set_count_can_be_the_tightest_limit() {
        let (device, layout, info) = setup();
        let two_sets = DescriptorPoolConfig::new(2)
            .with_size(vk::DescriptorType::STORAGE_BUFFER, 64)
            .with_size(vk::DescriptorType::STORAGE_IMAGE, 64);
        let mut arena = DescriptorArena::new(device.clone(), two_sets);

        let mut sets = Vec::new();
        arena.alloc(layout, &info, 7, &mut sets).unwrap();
        assert_eq!(sets.len(), 7);
        assert_eq!(arena.pool_count(), 4);
        assert_eq!(device.stats().descriptor_pools_created, 4);

        for _ in 0..3 {
            arena.alloc_one(layout, &info).unwrap();
        }
        assert_eq!(arena.pool_count(), 5);
    }

    #[test]
    fn exact_fill_stays_on_the_full_pool() {
        let (device, layout, info) = setup();
        let mut arena = DescriptorArena::new(device.clone(), four_per_pool());

        let mut sets = Vec::new();
        arena.alloc(layout, &info, 4, &mut sets).unwrap();
        assert_eq!(arena.pool_count(), 1);
        assert_eq!(arena.current_pool_index(), 0);

        arena.alloc(layout, &info, 1, &mut sets).unwrap();
        assert_eq!(sets.len(), 5);
        assert_eq!(arena.pool_count(), 2);
        assert_eq!(arena.current_pool_index(), 1);
    }

    #[test]
    fn reset_reuses_existing_pools() {
        let (device, layout, info) = setup();
        let mut arena = DescriptorArena::new(device.clone(), four_per_pool());

        for _ in 0..3 {
            let mut sets = Vec::new();
            arena.alloc(layout, &info, 7, &mut sets).unwrap();
            assert_eq!(sets.len(), 7);
            arena.reset().unwrap();
            assert_eq!(arena.current_pool_index(), 0);
        }

        assert_eq!(arena.pool_count(), 2);
        assert_eq!(device.stats().descriptor_pools_created, 2);
    }

    #[test]
    fn alloc_one_returns_a_set() {
        let (device, layout, info) = setup();
        let mut arena = DescriptorArena::new(device, four_per_pool());
        let first = arena.alloc_one(layout, &info).unwrap();
        let second = arena.alloc_one(layout, &info).unwrap();
        assert_ne!(first, second);
        assert_eq!(arena.pool_count(), 1);
    }

    #[test]
    fn zero_count_creates_nothing() {
        let (device, layout, info) = setup();
        let mut arena = DescriptorArena::new(device.clone(), four_per_pool());
        let mut sets = Vec::new();
        arena.alloc(layout, &info, 0, &mut sets).unwrap();
        assert!(sets.is_empty());
        assert_eq!(device.stats().descriptor_pools_created, 0);
    }

    #[test]
    #[should_panic(expected = "does not fit in an empty pool")]
    fn oversized_shape_panics() {
        let (device, layout, info) = setup();
        let config = DescriptorPoolConfig::new(16).with_size(vk::DescriptorType::STORAGE_BUFFER, 4);
        let mut arena = DescriptorArena::new(device, config);
        let mut sets = Vec::new();
        let _ = arena.alloc(layout, &info, 1, &mut sets);
    }
}
