use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use xxhash_rust::xxh3::Xxh3;

use crate::renderer::contexts::resource_ctx::resource_type::RenderResourceType;
use crate::renderer::error::{HalResultExt, RenderError};
use crate::renderer::hal::{LayoutBinding, RenderHal};

pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<LayoutBinding>,
}

impl Default for DescriptorSetLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        descriptor_count: u32,
        stages: vk::ShaderStageFlags,
        immutable_sampler: Option<vk::Sampler>,
    ) -> Self {
        self.bindings.push(LayoutBinding {
            binding,
            descriptor_type,
            count: descriptor_count,
            stages,
            immutable_sampler,
        });
        self
    }

    pub fn add_binding_for_resource_type(
        self,
        binding: u32,
        resource_type: RenderResourceType,
        descriptor_count: u32,
    ) -> Self {
        self.add_binding(
            binding,
            resource_type.descriptor_type(),
            descriptor_count,
            vk::ShaderStageFlags::ALL,
            None,
        )
    }

    pub fn from_bindings(bindings: Vec<LayoutBinding>) -> Self {
        Self { bindings }
    }

    /// Hash identifying the layout. Two builders with the same bindings share a layout.
    pub fn layout_hash(&self) -> u64 {
        let mut bindings: Vec<&LayoutBinding> = self.bindings.iter().collect();
        bindings.sort_by_key(|binding| binding.binding);
        hash_bindings(bindings.into_iter())
    }

    pub fn build(mut self, hal: Arc<dyn RenderHal>) -> Result<DescriptorSetLayout, RenderError> {
        self.bindings.sort_by_key(|binding| binding.binding);
        let hash = hash_bindings(self.bindings.iter());

        let raw = hal
            .create_descriptor_set_layout(&self.bindings)
            .hal_context("vkCreateDescriptorSetLayout")?;

        let update_template = if hal.capabilities().descriptor_update_template {
            let template = hal
                .create_descriptor_update_template(raw, &self.bindings)
                .hal_context("vkCreateDescriptorUpdateTemplate")
                .inspect_err(|_| hal.destroy_descriptor_set_layout(raw))?;
            Some(template)
        } else {
            None
        };

        let descriptor_count = self
            .bindings
            .iter()
            .filter(|binding| binding.is_written())
            .map(|binding| binding.count as usize)
            .sum();

        Ok(DescriptorSetLayout {
            raw,
            bindings: self.bindings,
            update_template,
            descriptor_count,
            hash,
            hal,
        })
    }
}

fn hash_bindings<'a>(bindings: impl Iterator<Item = &'a LayoutBinding>) -> u64 {
    let mut hasher = Xxh3::new();
    for binding in bindings {
        hasher.update(&binding.binding.to_le_bytes());
        hasher.update(&binding.descriptor_type.as_raw().to_le_bytes());
        hasher.update(&binding.count.to_le_bytes());
        hasher.update(&binding.stages.as_raw().to_le_bytes());
        let sampler = binding.immutable_sampler.map_or(0, |sampler| sampler.as_raw());
        hasher.update(&sampler.to_le_bytes());
    }
    hasher.digest()
}

/// A hardware descriptor set layout together with the description it was built from.
pub struct DescriptorSetLayout {
    raw: vk::DescriptorSetLayout,
    /// Sorted by binding number.
    bindings: Vec<LayoutBinding>,
    update_template: Option<vk::DescriptorUpdateTemplate>,
    descriptor_count: usize,
    hash: u64,
    hal: Arc<dyn RenderHal>,
}

impl DescriptorSetLayout {
    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.raw
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn binding(&self, binding: u32) -> Option<&LayoutBinding> {
        self.bindings
            .binary_search_by_key(&binding, |layout_binding| layout_binding.binding)
            .ok()
            .map(|index| &self.bindings[index])
    }

    pub fn update_template(&self) -> Option<vk::DescriptorUpdateTemplate> {
        self.update_template
    }

    /// Number of descriptors a full update writes.
    pub fn descriptor_count(&self) -> usize {
        self.descriptor_count
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        if let Some(template) = self.update_template.take() {
            self.hal.destroy_descriptor_update_template(template);
        }
        self.hal.destroy_descriptor_set_layout(self.raw);
    }
}
