use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::prelude::VkResult;
use ash::vk;
use gpu_descriptor::{
    AllocationError, CreatePoolError, DescriptorAllocator, DescriptorDevice, DescriptorPoolCreateFlags,
    DescriptorSetLayoutCreateFlags, DescriptorTotalCount, DeviceAllocationError,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::renderer::hal::{
    DescriptorInfo, DescriptorSetBlock, DescriptorWrite, HalCapabilities, LayoutBinding, RenderHal, SemaphoreSubmit,
    SubmitBatch,
};

const MAX_UPDATE_AFTER_BIND_DESCRIPTORS: u32 = 1024;

/// [`RenderHal`] over an application-created `ash::Device`.
///
/// The device must have `synchronization2` enabled, plus `timelineSemaphore` when
/// `capabilities.timeline_semaphore` is set.
pub struct AshHal {
    device: Arc<ash::Device>,
    capabilities: HalCapabilities,
    descriptor_device: DescriptorAshDevice,
    descriptor_allocator: Mutex<DescriptorAllocator<vk::DescriptorPool, vk::DescriptorSet>>,
    descriptor_blocks: Mutex<FxHashMap<u64, Vec<gpu_descriptor::DescriptorSet<vk::DescriptorSet>>>>,
    next_block_id: AtomicU64,
}

impl AshHal {
    pub fn new(device: Arc<ash::Device>, capabilities: HalCapabilities) -> Self {
        Self {
            descriptor_device: DescriptorAshDevice::from(device.clone()),
            device,
            capabilities,
            descriptor_allocator: Mutex::new(DescriptorAllocator::new(MAX_UPDATE_AFTER_BIND_DESCRIPTORS)),
            descriptor_blocks: Mutex::new(FxHashMap::default()),
            next_block_id: AtomicU64::new(1),
        }
    }

    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }
}

impl Drop for AshHal {
    fn drop(&mut self) {
        let blocks: Vec<_> = self.descriptor_blocks.get_mut().drain().flat_map(|(_, sets)| sets).collect();
        let allocator = self.descriptor_allocator.get_mut();
        unsafe {
            allocator.free(&self.descriptor_device, blocks);
            allocator.cleanup(&self.descriptor_device);
        }
    }
}

/// Layout of one descriptor in template update data.
#[repr(C)]
#[derive(Clone, Copy)]
union RawDescriptor {
    buffer: vk::DescriptorBufferInfo,
    image: vk::DescriptorImageInfo,
    texel_buffer: vk::BufferView,
}

impl From<&DescriptorInfo> for RawDescriptor {
    fn from(info: &DescriptorInfo) -> Self {
        match *info {
            DescriptorInfo::Buffer(buffer) => Self { buffer },
            DescriptorInfo::Image(image) => Self { image },
            DescriptorInfo::TexelBuffer(texel_buffer) => Self { texel_buffer },
        }
    }
}

fn timeout_to_bool(result: VkResult<()>) -> VkResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(vk::Result::TIMEOUT) => Ok(false),
        Err(err) => Err(err),
    }
}

fn total_count(bindings: &[LayoutBinding]) -> DescriptorTotalCount {
    let mut total = DescriptorTotalCount::default();
    for binding in bindings {
        let slot = match binding.descriptor_type {
            vk::DescriptorType::SAMPLER => &mut total.sampler,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => &mut total.combined_image_sampler,
            vk::DescriptorType::SAMPLED_IMAGE => &mut total.sampled_image,
            vk::DescriptorType::STORAGE_IMAGE => &mut total.storage_image,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER => &mut total.uniform_texel_buffer,
            vk::DescriptorType::STORAGE_TEXEL_BUFFER => &mut total.storage_texel_buffer,
            vk::DescriptorType::UNIFORM_BUFFER => &mut total.uniform_buffer,
            vk::DescriptorType::STORAGE_BUFFER => &mut total.storage_buffer,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => &mut total.uniform_buffer_dynamic,
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => &mut total.storage_buffer_dynamic,
            vk::DescriptorType::INPUT_ATTACHMENT => &mut total.input_attachment,
            other => {
                log::error!("Unsupported descriptor type in layout: {other:?}");
                continue;
            }
        };
        *slot += binding.count;
    }
    total
}

impl RenderHal for AshHal {
    fn capabilities(&self) -> HalCapabilities {
        self.capabilities
    }

    fn create_semaphore(&self, initial_timeline_value: Option<u64>) -> VkResult<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_timeline_value.unwrap_or(0));
        let mut create_info = vk::SemaphoreCreateInfo::default();
        if initial_timeline_value.is_some() {
            create_info = create_info.push_next(&mut type_info);
        }
        unsafe { self.device.create_semaphore(&create_info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        unsafe { self.device.get_semaphore_counter_value(semaphore) }
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> VkResult<bool> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        timeout_to_bool(unsafe { self.device.wait_semaphores(&wait_info, timeout_ns) })
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
        timeout_to_bool(unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) })
    }

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool> {
        // No RESET_COMMAND_BUFFER: buffers are only ever reset together with their pool.
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        unsafe { self.device.create_command_pool(&pool_info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty()) }
    }

    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let command_buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .command_buffer_count(count)
            .level(vk::CommandBufferLevel::PRIMARY);
        unsafe { self.device.allocate_command_buffers(&command_buffer_info) }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn queue_submit(&self, queue: vk::Queue, batches: &[SubmitBatch], fence: vk::Fence) -> VkResult<()> {
        let to_info = |submit: &SemaphoreSubmit| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(submit.semaphore)
                .value(submit.value)
                .stage_mask(submit.stages)
        };

        let waits: Vec<SmallVec<[vk::SemaphoreSubmitInfo; 4]>> = batches
            .iter()
            .map(|batch| batch.wait_semaphores.iter().map(to_info).collect())
            .collect();
        let signals: Vec<SmallVec<[vk::SemaphoreSubmitInfo; 4]>> = batches
            .iter()
            .map(|batch| batch.signal_semaphores.iter().map(to_info).collect())
            .collect();
        let command_buffers: Vec<SmallVec<[vk::CommandBufferSubmitInfo; 8]>> = batches
            .iter()
            .map(|batch| {
                batch
                    .command_buffers
                    .iter()
                    .map(|&command_buffer| vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer))
                    .collect()
            })
            .collect();

        let submits: SmallVec<[vk::SubmitInfo2; 2]> = (0..batches.len())
            .map(|i| {
                vk::SubmitInfo2::default()
                    .wait_semaphore_infos(&waits[i])
                    .command_buffer_infos(&command_buffers[i])
                    .signal_semaphore_infos(&signals[i])
            })
            .collect();

        unsafe { self.device.queue_submit2(queue, &submits, fence) }
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> VkResult<vk::DescriptorSetLayout> {
        let immutable_samplers: Vec<Vec<vk::Sampler>> = bindings
            .iter()
            .map(|binding| match binding.immutable_sampler {
                Some(sampler) => vec![sampler; binding.count as usize],
                None => Vec::new(),
            })
            .collect();

        let raw_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .zip(immutable_samplers.iter())
            .map(|(binding, samplers)| {
                let raw = vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .stage_flags(binding.stages);
                if samplers.is_empty() {
                    raw.descriptor_count(binding.count)
                } else {
                    raw.immutable_samplers(samplers)
                }
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&raw_bindings);
        unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_update_template(
        &self,
        layout: vk::DescriptorSetLayout,
        bindings: &[LayoutBinding],
    ) -> VkResult<vk::DescriptorUpdateTemplate> {
        let stride = size_of::<RawDescriptor>();
        let mut offset = 0;
        let entries: Vec<vk::DescriptorUpdateTemplateEntry> = bindings
            .iter()
            .filter(|binding| binding.is_written())
            .map(|binding| {
                let entry = vk::DescriptorUpdateTemplateEntry::default()
                    .dst_binding(binding.binding)
                    .dst_array_element(0)
                    .descriptor_count(binding.count)
                    .descriptor_type(binding.descriptor_type)
                    .offset(offset)
                    .stride(stride);
                offset += stride * binding.count as usize;
                entry
            })
            .collect();

        let create_info = vk::DescriptorUpdateTemplateCreateInfo::default()
            .descriptor_update_entries(&entries)
            .template_type(vk::DescriptorUpdateTemplateType::DESCRIPTOR_SET)
            .descriptor_set_layout(layout);
        unsafe { self.device.create_descriptor_update_template(&create_info, None) }
    }

    fn destroy_descriptor_update_template(&self, template: vk::DescriptorUpdateTemplate) {
        unsafe { self.device.destroy_descriptor_update_template(template, None) }
    }

    fn allocate_descriptor_sets(
        &self,
        layout: vk::DescriptorSetLayout,
        bindings: &[LayoutBinding],
        count: u32,
    ) -> VkResult<DescriptorSetBlock> {
        let allocated = unsafe {
            self.descriptor_allocator.lock().allocate(
                &self.descriptor_device,
                &layout,
                DescriptorSetLayoutCreateFlags::empty(),
                &total_count(bindings),
                count,
            )
        }
        .map_err(|err| match err {
            AllocationError::OutOfDeviceMemory => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            AllocationError::OutOfHostMemory => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            AllocationError::Fragmentation => vk::Result::ERROR_FRAGMENTATION,
        })?;

        let id = self.next_block_id.fetch_add(1, Ordering::Relaxed);
        let sets = allocated.iter().map(|set| *set.raw()).collect();
        self.descriptor_blocks.lock().insert(id, allocated);

        Ok(DescriptorSetBlock { id, sets })
    }

    fn free_descriptor_sets(&self, block: DescriptorSetBlock) {
        let Some(sets) = self.descriptor_blocks.lock().remove(&block.id) else {
            log::warn!("Freeing unknown descriptor set block {}", block.id);
            return;
        };
        unsafe { self.descriptor_allocator.lock().free(&self.descriptor_device, sets) }
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let raw_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .map(|write| {
                let raw = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.descriptor_type);
                match &write.info {
                    DescriptorInfo::Buffer(info) => raw.buffer_info(std::slice::from_ref(info)),
                    DescriptorInfo::Image(info) => raw.image_info(std::slice::from_ref(info)),
                    DescriptorInfo::TexelBuffer(view) => raw.texel_buffer_view(std::slice::from_ref(view)),
                }
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&raw_writes, &[]) }
    }

    fn update_descriptor_set_with_template(
        &self,
        set: vk::DescriptorSet,
        template: vk::DescriptorUpdateTemplate,
        infos: &[DescriptorInfo],
    ) {
        let data: SmallVec<[RawDescriptor; 16]> = infos.iter().map(RawDescriptor::from).collect();
        unsafe {
            self.device
                .update_descriptor_set_with_template(set, template, data.as_ptr() as *const c_void)
        }
    }
}

pub struct DescriptorAshDevice(pub Arc<ash::Device>);

impl From<Arc<ash::Device>> for DescriptorAshDevice {
    fn from(device: Arc<ash::Device>) -> Self {
        Self(device)
    }
}

impl DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet>
for DescriptorAshDevice
{
    unsafe fn create_descriptor_pool(
        &self,
        descriptor_count: &DescriptorTotalCount,
        max_sets: u32,
        flags: DescriptorPoolCreateFlags,
    ) -> Result<vk::DescriptorPool, CreatePoolError> {
        let counts = [
            (vk::DescriptorType::SAMPLER, descriptor_count.sampler),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count.combined_image_sampler),
            (vk::DescriptorType::SAMPLED_IMAGE, descriptor_count.sampled_image),
            (vk::DescriptorType::STORAGE_IMAGE, descriptor_count.storage_image),
            (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, descriptor_count.uniform_texel_buffer),
            (vk::DescriptorType::STORAGE_TEXEL_BUFFER, descriptor_count.storage_texel_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER, descriptor_count.uniform_buffer),
            (vk::DescriptorType::STORAGE_BUFFER, descriptor_count.storage_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, descriptor_count.uniform_buffer_dynamic),
            (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, descriptor_count.storage_buffer_dynamic),
            (vk::DescriptorType::INPUT_ATTACHMENT, descriptor_count.input_attachment),
        ];
        let pool_sizes: SmallVec<[vk::DescriptorPoolSize; 11]> = counts
            .iter()
            .filter(|(_, count)| *count != 0)
            .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
            .collect();

        let mut ash_flags = vk::DescriptorPoolCreateFlags::empty();

        if flags.contains(DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            ash_flags |= vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        }

        if flags.contains(DescriptorPoolCreateFlags::UPDATE_AFTER_BIND) {
            ash_flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }

        let result = unsafe {
            self.0.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(max_sets)
                    .pool_sizes(&pool_sizes)
                    .flags(ash_flags),
                None,
            )
        };

        log::debug!("Created descriptor pool for {max_sets} sets");

        match result {
            Ok(pool) => Ok(pool),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(CreatePoolError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_FRAGMENTATION) => Err(CreatePoolError::Fragmentation),
            Err(err) => {
                log::error!("vkCreateDescriptorPool failed: {err}");
                Err(CreatePoolError::OutOfHostMemory)
            }
        }
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe {
            self.0.destroy_descriptor_pool(pool, None)
        }
    }

    unsafe fn alloc_descriptor_sets<'a>(
        &self,
        pool: &mut vk::DescriptorPool,
        layouts: impl ExactSizeIterator<Item = &'a vk::DescriptorSetLayout>,
        sets: &mut impl Extend<vk::DescriptorSet>,
    ) -> Result<(), DeviceAllocationError> {
        let set_layouts: SmallVec<[_; 16]> = layouts.copied().collect();

        let result = unsafe {
            self.0.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .set_layouts(&set_layouts)
                    .descriptor_pool(*pool),
            )
        };

        match result {
            Ok(allocated) => {
                sets.extend(allocated);
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(DeviceAllocationError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_FRAGMENTED_POOL) => Err(DeviceAllocationError::FragmentedPool),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => Err(DeviceAllocationError::OutOfPoolMemory),
            Err(err) => {
                log::error!("vkAllocateDescriptorSets failed: {err}");
                Err(DeviceAllocationError::OutOfHostMemory)
            }
        }
    }

    unsafe fn dealloc_descriptor_sets<'a>(
        &self,
        pool: &mut vk::DescriptorPool,
        sets: impl Iterator<Item = vk::DescriptorSet>,
    ) {
        let sets: SmallVec<[_; 16]> = sets.collect();
        if let Err(err) = unsafe { self.0.free_descriptor_sets(*pool, &sets) } {
            log::error!("vkFreeDescriptorSets failed: {err}");
        }
    }
}
