//! Resources bound to descriptor slots while a command buffer records.
//!
//! Binding never touches the hardware. Only when a draw or dispatch needs a
//! set does [`SetBindings::prepare`] walk the layout, hash every slot and
//! produce the writes a fresh descriptor set would need.

use ash::vk;
use smallvec::SmallVec;
use xxhash_rust::xxh3::Xxh3;

use crate::renderer::contexts::resource_ctx::descriptor_set_layout_builder::DescriptorSetLayout;
use crate::renderer::error::RenderError;
use crate::renderer::hal::{DescriptorInfo, DescriptorWrite};

pub const MAX_DESCRIPTOR_SETS: usize = 4;
pub const MAX_BINDINGS: u32 = 32;
pub const MAX_ARRAY_SIZE: u32 = 1024;

/// A resource in one descriptor slot.
///
/// Every resource carries a cookie, a number that uniquely identifies the
/// underlying object for as long as it lives. Cookies, not raw handles, decide
/// whether two binding states are the same.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResourceBinding {
    #[default]
    Unbound,
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
        cookie: u64,
    },
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        cookie: u64,
    },
    ImageSampler {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
        image_cookie: u64,
        sampler_cookie: u64,
    },
    Sampler {
        sampler: vk::Sampler,
        cookie: u64,
    },
    TexelBuffer {
        view: vk::BufferView,
        cookie: u64,
    },
}

impl ResourceBinding {
    pub fn buffer(cookie: u64, buffer: vk::Buffer, offset: u64, range: u64) -> Self {
        Self::Buffer {
            buffer,
            offset,
            range,
            cookie,
        }
    }

    pub fn image(cookie: u64, view: vk::ImageView, layout: vk::ImageLayout) -> Self {
        Self::Image { view, layout, cookie }
    }

    pub fn image_sampler(
        image_cookie: u64,
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler_cookie: u64,
        sampler: vk::Sampler,
    ) -> Self {
        Self::ImageSampler {
            view,
            sampler,
            layout,
            image_cookie,
            sampler_cookie,
        }
    }

    pub fn sampler(cookie: u64, sampler: vk::Sampler) -> Self {
        Self::Sampler { sampler, cookie }
    }

    pub fn texel_buffer(cookie: u64, view: vk::BufferView) -> Self {
        Self::TexelBuffer { view, cookie }
    }

    pub fn is_bound(&self) -> bool {
        !matches!(self, Self::Unbound)
    }
}

/// Slots of one descriptor set, indexed by binding number and array element.
#[derive(Clone, Debug, Default)]
pub struct SetBindings {
    bindings: Vec<SmallVec<[ResourceBinding; 1]>>,
}

impl SetBindings {
    pub fn get(&self, binding: u32, array_index: u32) -> ResourceBinding {
        self.bindings
            .get(binding as usize)
            .and_then(|slots| slots.get(array_index as usize))
            .copied()
            .unwrap_or_default()
    }

    /// Returns `None` when the slot lies outside the supported range.
    pub fn slot_mut(&mut self, binding: u32, array_index: u32) -> Option<&mut ResourceBinding> {
        if binding >= MAX_BINDINGS || array_index >= MAX_ARRAY_SIZE {
            return None;
        }

        let binding = binding as usize;
        let array_index = array_index as usize;
        if self.bindings.len() <= binding {
            self.bindings.resize_with(binding + 1, SmallVec::new);
        }
        let slots = &mut self.bindings[binding];
        if slots.len() <= array_index {
            slots.resize(array_index + 1, ResourceBinding::Unbound);
        }
        Some(&mut slots[array_index])
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    /// Hashes the slots `layout` uses and builds the writes that would reproduce them.
    ///
    /// Dynamic uniform buffer offsets are left out of the hash and returned separately.
    pub fn prepare(&self, set: u32, layout: &DescriptorSetLayout) -> Result<PreparedSet, RenderError> {
        let mut hasher = Xxh3::new();
        let mut writes = SmallVec::new();
        let mut dynamic_offsets = SmallVec::new();

        for layout_binding in layout.bindings().iter().filter(|binding| binding.is_written()) {
            let immutable = layout_binding.immutable_sampler.is_some();
            hasher.update(&layout_binding.binding.to_le_bytes());

            for array_index in 0..layout_binding.count {
                let missing = RenderError::MissingBinding {
                    set,
                    binding: layout_binding.binding,
                    array_index,
                };
                let slot = self.get(layout_binding.binding, array_index);

                let info = match (layout_binding.descriptor_type, slot) {
                    (
                        vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::STORAGE_BUFFER,
                        ResourceBinding::Buffer {
                            buffer,
                            offset,
                            range,
                            cookie,
                        },
                    ) => {
                        hasher.update(&cookie.to_le_bytes());
                        hasher.update(&offset.to_le_bytes());
                        hasher.update(&range.to_le_bytes());
                        DescriptorInfo::Buffer(vk::DescriptorBufferInfo { buffer, offset, range })
                    }
                    (
                        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                        ResourceBinding::Buffer {
                            buffer,
                            offset,
                            range,
                            cookie,
                        },
                    ) => {
                        hasher.update(&cookie.to_le_bytes());
                        hasher.update(&range.to_le_bytes());
                        let offset = u32::try_from(offset).map_err(|_| RenderError::BindingOutOfRange {
                            set,
                            binding: layout_binding.binding,
                            array_index,
                        })?;
                        dynamic_offsets.push(offset);
                        DescriptorInfo::Buffer(vk::DescriptorBufferInfo {
                            buffer,
                            offset: 0,
                            range,
                        })
                    }
                    (
                        vk::DescriptorType::SAMPLED_IMAGE
                        | vk::DescriptorType::STORAGE_IMAGE
                        | vk::DescriptorType::INPUT_ATTACHMENT,
                        ResourceBinding::Image { view, layout, cookie },
                    ) => {
                        hasher.update(&cookie.to_le_bytes());
                        hasher.update(&layout.as_raw().to_le_bytes());
                        DescriptorInfo::Image(vk::DescriptorImageInfo {
                            sampler: vk::Sampler::null(),
                            image_view: view,
                            image_layout: layout,
                        })
                    }
                    (
                        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        ResourceBinding::ImageSampler {
                            view,
                            sampler,
                            layout,
                            image_cookie,
                            sampler_cookie,
                        },
                    ) => {
                        hasher.update(&image_cookie.to_le_bytes());
                        hasher.update(&layout.as_raw().to_le_bytes());
                        if !immutable {
                            hasher.update(&sampler_cookie.to_le_bytes());
                        }
                        DescriptorInfo::Image(vk::DescriptorImageInfo {
                            sampler,
                            image_view: view,
                            image_layout: layout,
                        })
                    }
                    // The sampler is baked into the layout, so an image alone is enough.
                    (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, ResourceBinding::Image { view, layout, cookie })
                        if immutable =>
                    {
                        hasher.update(&cookie.to_le_bytes());
                        hasher.update(&layout.as_raw().to_le_bytes());
                        DescriptorInfo::Image(vk::DescriptorImageInfo {
                            sampler: vk::Sampler::null(),
                            image_view: view,
                            image_layout: layout,
                        })
                    }
                    (vk::DescriptorType::SAMPLER, ResourceBinding::Sampler { sampler, cookie }) => {
                        hasher.update(&cookie.to_le_bytes());
                        DescriptorInfo::Image(vk::DescriptorImageInfo {
                            sampler,
                            image_view: vk::ImageView::null(),
                            image_layout: vk::ImageLayout::UNDEFINED,
                        })
                    }
                    (
                        vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER,
                        ResourceBinding::TexelBuffer { view, cookie },
                    ) => {
                        hasher.update(&cookie.to_le_bytes());
                        DescriptorInfo::TexelBuffer(view)
                    }
                    _ => return Err(missing),
                };

                writes.push(DescriptorWrite {
                    binding: layout_binding.binding,
                    array_element: array_index,
                    descriptor_type: layout_binding.descriptor_type,
                    info,
                });
            }
        }

        Ok(PreparedSet {
            hash: hasher.digest(),
            writes,
            dynamic_offsets,
        })
    }
}

/// The hashed contents of one set, ready to be written.
#[derive(Clone, Debug)]
pub struct PreparedSet {
    pub hash: u64,
    /// In layout order, array elements consecutive. This is also the update template order.
    pub writes: SmallVec<[DescriptorWrite; 16]>,
    pub dynamic_offsets: SmallVec<[u32; 4]>,
}

impl PreparedSet {
    pub fn template_infos(&self) -> SmallVec<[DescriptorInfo; 16]> {
        self.writes.iter().map(|write| write.info).collect()
    }
}

/// Bindings for every set of a command buffer.
#[derive(Clone, Debug, Default)]
pub struct BindingState {
    sets: [SetBindings; MAX_DESCRIPTOR_SETS],
}

impl BindingState {
    pub fn set(&self, set: u32) -> Result<&SetBindings, RenderError> {
        self.sets
            .get(set as usize)
            .ok_or(RenderError::UnknownDescriptorSet { set })
    }

    pub fn slot_mut(&mut self, set: u32, binding: u32, array_index: u32) -> Result<&mut ResourceBinding, RenderError> {
        let bindings = self
            .sets
            .get_mut(set as usize)
            .ok_or(RenderError::UnknownDescriptorSet { set })?;
        bindings
            .slot_mut(binding, array_index)
            .ok_or(RenderError::BindingOutOfRange {
                set,
                binding,
                array_index,
            })
    }

    pub fn clear(&mut self) {
        for set in &mut self.sets {
            set.clear();
        }
    }
}
