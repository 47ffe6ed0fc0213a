//! The narrow set of hardware calls the renderer makes.
//!
//! Everything above this module talks to the GPU through [`RenderHal`], using
//! raw `ash` handle types. [`vulkan::AshHal`] forwards to a real device,
//! [`headless::HeadlessDevice`] simulates one in memory.

pub mod headless;
pub mod vulkan;

use ash::prelude::VkResult;
use ash::vk;
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HalCapabilities {
    pub timeline_semaphore: bool,
    pub descriptor_update_template: bool,
}

impl Default for HalCapabilities {
    fn default() -> Self {
        Self {
            timeline_semaphore: true,
            descriptor_update_template: true,
        }
    }
}

/// A semaphore wait or signal inside a batch. `value` is ignored for binary semaphores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stages: vk::PipelineStageFlags2,
}

/// One `VkSubmitInfo2`.
#[derive(Clone, Debug, Default)]
pub struct SubmitBatch {
    pub wait_semaphores: SmallVec<[SemaphoreSubmit; 4]>,
    pub command_buffers: SmallVec<[vk::CommandBuffer; 8]>,
    pub signal_semaphores: SmallVec<[SemaphoreSubmit; 4]>,
}

impl SubmitBatch {
    pub fn is_empty(&self) -> bool {
        self.wait_semaphores.is_empty()
            && self.command_buffers.is_empty()
            && self.signal_semaphores.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
pub enum DescriptorInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
    TexelBuffer(vk::BufferView),
}

#[derive(Clone, Copy, Debug)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub info: DescriptorInfo,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub immutable_sampler: Option<vk::Sampler>,
}

impl LayoutBinding {
    /// Whether descriptor updates touch this binding. Immutable plain samplers are baked into the layout.
    pub fn is_written(&self) -> bool {
        !(self.descriptor_type == vk::DescriptorType::SAMPLER && self.immutable_sampler.is_some())
    }
}

/// Descriptor sets allocated together. Freed as a unit.
#[derive(Debug)]
pub struct DescriptorSetBlock {
    pub id: u64,
    pub sets: Vec<vk::DescriptorSet>,
}

pub trait RenderHal: Send + Sync {
    fn capabilities(&self) -> HalCapabilities;

    // ------------------------------------------------------------------------
    // Synchronization
    // ------------------------------------------------------------------------

    /// Creates a binary semaphore, or a timeline semaphore starting at the given value.
    fn create_semaphore(&self, initial_timeline_value: Option<u64>) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64>;
    /// Returns `Ok(false)` if the timeout elapsed first.
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> VkResult<bool>;

    fn create_fence(&self) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    /// Returns `Ok(false)` if the timeout elapsed first.
    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool>;

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()>;
    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> VkResult<Vec<vk::CommandBuffer>>;
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    fn queue_submit(&self, queue: vk::Queue, batches: &[SubmitBatch], fence: vk::Fence) -> VkResult<()>;

    // ------------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------------

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    /// Template entries follow the written bindings in order, array elements consecutive.
    fn create_descriptor_update_template(
        &self,
        layout: vk::DescriptorSetLayout,
        bindings: &[LayoutBinding],
    ) -> VkResult<vk::DescriptorUpdateTemplate>;
    fn destroy_descriptor_update_template(&self, template: vk::DescriptorUpdateTemplate);
    fn allocate_descriptor_sets(
        &self,
        layout: vk::DescriptorSetLayout,
        bindings: &[LayoutBinding],
        count: u32,
    ) -> VkResult<DescriptorSetBlock>;
    fn free_descriptor_sets(&self, block: DescriptorSetBlock);
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);
    fn update_descriptor_set_with_template(
        &self,
        set: vk::DescriptorSet,
        template: vk::DescriptorUpdateTemplate,
        infos: &[DescriptorInfo],
    );
}
