pub mod binding_state;
pub mod descriptor_set_cache;
pub mod descriptor_set_layout_builder;
pub mod program_layout;
pub mod resource_type;

use std::sync::Arc;

use color_eyre::Result;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use xxhash_rust::xxh3::Xxh3;

use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::resource_ctx::binding_state::MAX_DESCRIPTOR_SETS;
use crate::renderer::contexts::resource_ctx::descriptor_set_cache::DescriptorSetAllocator;
use crate::renderer::contexts::resource_ctx::descriptor_set_layout_builder::DescriptorSetLayoutBuilder;
use crate::renderer::contexts::resource_ctx::program_layout::{ProgramLayout, ProgramStages};
use crate::renderer::hal::RenderHal;
use crate::renderer::internals::per_thread::OwnerId;

/// Responsibilities:
/// - Build descriptor set layouts and share them between programs
/// - Own one descriptor set allocator per distinct layout
/// - Merge shader stage layouts into program layouts
pub struct RenderResourceContext {
    hal: Arc<dyn RenderHal>,
    owner: OwnerId,
    worker_count: usize,
    ring_depth: usize,
    pool_size: u32,
    allocators: RwLock<FxHashMap<u64, Arc<DescriptorSetAllocator>>>,
    programs: RwLock<FxHashMap<u64, Arc<ProgramLayout>>>,
}

impl RenderResourceContext {
    pub fn new(hal: Arc<dyn RenderHal>, owner: OwnerId, config: &RenderConfig) -> Self {
        Self {
            hal,
            owner,
            worker_count: config.worker_threads,
            ring_depth: config.descriptor_ring_depth,
            pool_size: config.descriptor_pool_size,
            allocators: RwLock::new(FxHashMap::default()),
            programs: RwLock::new(FxHashMap::default()),
        }
    }

    /// Returns the allocator for the layout `builder` describes, creating it on first use.
    pub fn request_set_allocator(&self, builder: DescriptorSetLayoutBuilder) -> Result<Arc<DescriptorSetAllocator>> {
        let hash = builder.layout_hash();
        if let Some(allocator) = self.allocators.read().get(&hash) {
            return Ok(allocator.clone());
        }

        let mut allocators = self.allocators.write();
        if let Some(allocator) = allocators.get(&hash) {
            return Ok(allocator.clone());
        }

        let layout = builder.build(self.hal.clone())?;
        log::debug!("Created descriptor set layout {hash:#x} ({} bindings)", layout.bindings().len());
        let allocator = Arc::new(DescriptorSetAllocator::new(
            self.hal.clone(),
            Arc::new(layout),
            self.owner,
            self.worker_count,
            self.ring_depth,
            self.pool_size,
        ));
        allocators.insert(hash, allocator.clone());
        Ok(allocator)
    }

    /// Merges the stages and returns the matching program layout. Identical programs share one.
    pub fn request_program_layout(&self, stages: &ProgramStages) -> Result<Arc<ProgramLayout>> {
        let merged = stages.merged_sets()?;

        let mut builders: [Option<DescriptorSetLayoutBuilder>; MAX_DESCRIPTOR_SETS] = Default::default();
        let mut hasher = Xxh3::new();
        hasher.update(&stages.bind_point().as_raw().to_le_bytes());
        for (set, bindings) in merged.into_iter().enumerate() {
            if bindings.is_empty() {
                hasher.update(&0u64.to_le_bytes());
                continue;
            }
            let builder = DescriptorSetLayoutBuilder::from_bindings(bindings);
            hasher.update(&builder.layout_hash().to_le_bytes());
            builders[set] = Some(builder);
        }
        let hash = hasher.digest();

        if let Some(program) = self.programs.read().get(&hash) {
            return Ok(program.clone());
        }

        let mut sets: [Option<Arc<DescriptorSetAllocator>>; MAX_DESCRIPTOR_SETS] = Default::default();
        for (slot, builder) in sets.iter_mut().zip(builders) {
            if let Some(builder) = builder {
                *slot = Some(self.request_set_allocator(builder)?);
            }
        }

        let program = Arc::new(ProgramLayout::new(stages.bind_point(), sets, hash));
        Ok(self.programs.write().entry(hash).or_insert(program).clone())
    }

    pub fn program_count(&self) -> usize {
        self.programs.read().len()
    }

    pub fn set_allocator_count(&self) -> usize {
        self.allocators.read().len()
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;
    use crate::renderer::contexts::resource_ctx::program_layout::ShaderStageLayout;
    use crate::renderer::contexts::resource_ctx::resource_type::RenderResourceType;
    use crate::renderer::hal::headless::HeadlessDevice;

    fn context() -> RenderResourceContext {
        RenderResourceContext::new(Arc::new(HeadlessDevice::default()), OwnerId::next(), &RenderConfig::default())
    }

    fn compute(set: u32) -> ProgramStages {
        ProgramStages::Compute {
            compute: ShaderStageLayout::new(vk::ShaderStageFlags::COMPUTE)
                .add_binding(set, 0, RenderResourceType::StorageBuffer, 1),
        }
    }

    #[test]
    fn identical_programs_are_shared() {
        let context = context();
        let a = context.request_program_layout(&compute(0)).unwrap();
        let b = context.request_program_layout(&compute(0)).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.active_sets(), 0b1);
        assert_eq!(context.program_count(), 1);
    }

    #[test]
    fn programs_share_set_allocators_by_layout() {
        let context = context();
        let first = context.request_program_layout(&compute(0)).unwrap();
        let second = context.request_program_layout(&compute(2)).unwrap();

        assert_eq!(context.program_count(), 2);
        assert_eq!(context.set_allocator_count(), 1);
        assert!(Arc::ptr_eq(
            first.set_allocator(0).unwrap(),
            second.set_allocator(2).unwrap()
        ));
        assert!(second.set_allocator(0).is_err());
    }
}
