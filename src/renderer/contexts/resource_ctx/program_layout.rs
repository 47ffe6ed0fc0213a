use std::sync::Arc;

use ash::vk;
use smallvec::SmallVec;

use crate::renderer::contexts::resource_ctx::binding_state::MAX_DESCRIPTOR_SETS;
use crate::renderer::contexts::resource_ctx::descriptor_set_cache::DescriptorSetAllocator;
use crate::renderer::contexts::resource_ctx::resource_type::RenderResourceType;
use crate::renderer::error::RenderError;
use crate::renderer::hal::LayoutBinding;

/// Resource bindings one shader stage declares.
#[derive(Clone, Debug)]
pub struct ShaderStageLayout {
    stage: vk::ShaderStageFlags,
    bindings: Vec<(u32, LayoutBinding)>,
}

impl ShaderStageLayout {
    pub fn new(stage: vk::ShaderStageFlags) -> Self {
        Self {
            stage,
            bindings: Vec::new(),
        }
    }

    pub fn add_binding(mut self, set: u32, binding: u32, resource_type: RenderResourceType, count: u32) -> Self {
        self.bindings.push((
            set,
            LayoutBinding {
                binding,
                descriptor_type: resource_type.descriptor_type(),
                count,
                stages: self.stage,
                immutable_sampler: None,
            },
        ));
        self
    }

    /// A sampler or combined image sampler whose sampler is fixed in the layout.
    pub fn add_immutable_sampler(
        mut self,
        set: u32,
        binding: u32,
        resource_type: RenderResourceType,
        sampler: vk::Sampler,
    ) -> Self {
        self.bindings.push((
            set,
            LayoutBinding {
                binding,
                descriptor_type: resource_type.descriptor_type(),
                count: 1,
                stages: self.stage,
                immutable_sampler: Some(sampler),
            },
        ));
        self
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }
}

/// The shader stages a program is made of.
#[derive(Clone, Debug)]
pub enum ProgramStages {
    Graphics {
        vertex: ShaderStageLayout,
        fragment: ShaderStageLayout,
    },
    Compute {
        compute: ShaderStageLayout,
    },
}

impl ProgramStages {
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self {
            Self::Graphics { .. } => vk::PipelineBindPoint::GRAPHICS,
            Self::Compute { .. } => vk::PipelineBindPoint::COMPUTE,
        }
    }

    fn stages(&self) -> SmallVec<[&ShaderStageLayout; 2]> {
        match self {
            Self::Graphics { vertex, fragment } => SmallVec::from_buf([vertex, fragment]),
            Self::Compute { compute } => {
                let mut stages = SmallVec::new();
                stages.push(compute);
                stages
            }
        }
    }

    /// Combines the stages into one binding list per set.
    ///
    /// Stages that disagree about a binding are logged and the first stage wins,
    /// except for immutable samplers, which are dropped when the stages disagree.
    pub fn merged_sets(&self) -> Result<[Vec<LayoutBinding>; MAX_DESCRIPTOR_SETS], RenderError> {
        let mut sets: [Vec<LayoutBinding>; MAX_DESCRIPTOR_SETS] = Default::default();

        for stage in self.stages() {
            for (set, binding) in &stage.bindings {
                let merged = sets
                    .get_mut(*set as usize)
                    .ok_or(RenderError::UnknownDescriptorSet { set: *set })?;

                let Some(index) = merged.iter().position(|existing| existing.binding == binding.binding) else {
                    merged.push(binding.clone());
                    continue;
                };
                let existing = &mut merged[index];

                existing.stages |= binding.stages;
                if existing.descriptor_type != binding.descriptor_type {
                    log::error!(
                        "Descriptor type mismatch for set {set} binding {}: {:?} vs {:?}",
                        binding.binding,
                        existing.descriptor_type,
                        binding.descriptor_type
                    );
                }
                if existing.count != binding.count {
                    log::error!(
                        "Array size mismatch for set {set} binding {}: {} vs {}",
                        binding.binding,
                        existing.count,
                        binding.count
                    );
                }
                if existing.immutable_sampler != binding.immutable_sampler {
                    log::error!(
                        "Immutable sampler mismatch for set {set} binding {}, dropping the immutable sampler",
                        binding.binding
                    );
                    existing.immutable_sampler = None;
                }
            }
        }

        for set in &mut sets {
            set.sort_by_key(|binding| binding.binding);
        }
        Ok(sets)
    }
}

/// Descriptor set allocators for every set a program uses.
pub struct ProgramLayout {
    bind_point: vk::PipelineBindPoint,
    sets: [Option<Arc<DescriptorSetAllocator>>; MAX_DESCRIPTOR_SETS],
    hash: u64,
}

impl ProgramLayout {
    pub fn new(
        bind_point: vk::PipelineBindPoint,
        sets: [Option<Arc<DescriptorSetAllocator>>; MAX_DESCRIPTOR_SETS],
        hash: u64,
    ) -> Self {
        Self {
            bind_point,
            sets,
            hash,
        }
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn set_allocator(&self, set: u32) -> Result<&Arc<DescriptorSetAllocator>, RenderError> {
        self.sets
            .get(set as usize)
            .and_then(Option::as_ref)
            .ok_or(RenderError::UnknownDescriptorSet { set })
    }

    /// Bit `i` is set when set `i` has bindings.
    pub fn active_sets(&self) -> u32 {
        self.sets
            .iter()
            .enumerate()
            .filter(|(_, allocator)| allocator.is_some())
            .fold(0, |mask, (set, _)| mask | (1 << set))
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    #[test]
    fn stage_flags_are_combined() {
        let program = ProgramStages::Graphics {
            vertex: ShaderStageLayout::new(vk::ShaderStageFlags::VERTEX)
                .add_binding(0, 0, RenderResourceType::UniformBuffer, 1),
            fragment: ShaderStageLayout::new(vk::ShaderStageFlags::FRAGMENT)
                .add_binding(0, 0, RenderResourceType::UniformBuffer, 1)
                .add_binding(1, 2, RenderResourceType::SampledImage, 4),
        };
        let sets = program.merged_sets().unwrap();

        assert_eq!(sets[0].len(), 1);
        assert_eq!(
            sets[0][0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(sets[1][0].stages, vk::ShaderStageFlags::FRAGMENT);
        assert!(sets[2].is_empty());
        assert_eq!(program.bind_point(), vk::PipelineBindPoint::GRAPHICS);
    }

    #[test]
    fn mismatches_keep_running() {
        let sampler = vk::Sampler::from_raw(3);
        let program = ProgramStages::Graphics {
            vertex: ShaderStageLayout::new(vk::ShaderStageFlags::VERTEX)
                .add_binding(0, 0, RenderResourceType::SampledImage, 4)
                .add_immutable_sampler(0, 1, RenderResourceType::CombinedImageSampler, sampler),
            fragment: ShaderStageLayout::new(vk::ShaderStageFlags::FRAGMENT)
                .add_binding(0, 0, RenderResourceType::SampledImage, 2)
                .add_binding(0, 1, RenderResourceType::CombinedImageSampler, 1),
        };
        let sets = program.merged_sets().unwrap();

        assert_eq!(sets[0][0].count, 4);
        assert_eq!(sets[0][1].immutable_sampler, None);
    }

    #[test]
    fn compute_programs_reject_sets_past_the_limit() {
        let program = ProgramStages::Compute {
            compute: ShaderStageLayout::new(vk::ShaderStageFlags::COMPUTE).add_binding(
                MAX_DESCRIPTOR_SETS as u32,
                0,
                RenderResourceType::StorageBuffer,
                1,
            ),
        };
        assert_eq!(program.bind_point(), vk::PipelineBindPoint::COMPUTE);
        assert!(matches!(
            program.merged_sets(),
            Err(RenderError::UnknownDescriptorSet { set: 4 })
        ));
    }
}
