use ash::vk;

/// Kind of resource a descriptor binding expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderResourceType {
    UniformBuffer,
    UniformBufferDynamic,
    StorageBuffer,
    StorageImage,
    Sampler,
    SampledImage,
    CombinedImageSampler,
    UniformTexelBuffer,
    StorageTexelBuffer,
    InputAttachment,
}

impl RenderResourceType {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::Sampler => vk::DescriptorType::SAMPLER,
            Self::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            Self::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            Self::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
        }
    }

    /// Image layout a descriptor of this kind is written with.
    pub fn image_layout(&self) -> vk::ImageLayout {
        match self {
            Self::StorageImage => vk::ImageLayout::GENERAL,
            Self::SampledImage | Self::CombinedImageSampler | Self::InputAttachment => {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            }
            _ => vk::ImageLayout::UNDEFINED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_images_carry_a_layout() {
        assert_eq!(RenderResourceType::StorageImage.image_layout(), vk::ImageLayout::GENERAL);
        assert_eq!(
            RenderResourceType::CombinedImageSampler.image_layout(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(RenderResourceType::StorageBuffer.image_layout(), vk::ImageLayout::UNDEFINED);
    }
}
