//! Backend-neutral descriptions of shader resource bindings.
//!
//! A [`BindingLayout`] is the ordered list of `(kind, stages, count)` tuples a
//! pipeline expects in its single descriptor set. Binding numbers are list
//! positions. [`DescriptorWrite`] is the resolved form of one binding update,
//! consumed by [`GpuBackend::update_descriptor_set`](crate::backend::GpuBackend::update_descriptor_set).

use std::collections::BTreeMap;

use ash::vk;
use serde::{Deserialize, Serialize};

/// Kind of resource a binding slot holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingKind {
    /// Uniform buffer (read-only, small).
    UniformBuffer,
    /// Storage buffer (read/write, large).
    StorageBuffer,
    /// Image and sampler in one descriptor.
    CombinedImageSampler,
    /// Sampled image without a sampler.
    SampledImage,
    /// Standalone sampler.
    Sampler,
}

impl BindingKind {
    /// Every kind, in pool-size order.
    pub const ALL: [BindingKind; 5] = [
        BindingKind::UniformBuffer,
        BindingKind::StorageBuffer,
        BindingKind::CombinedImageSampler,
        BindingKind::SampledImage,
        BindingKind::Sampler,
    ];

    /// Vulkan descriptor type for this kind.
    #[inline]
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            BindingKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            BindingKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            BindingKind::Sampler => vk::DescriptorType::SAMPLER,
        }
    }

    /// Whether descriptors of this kind point at buffers.
    #[inline]
    pub fn is_buffer(self) -> bool {
        matches!(self, BindingKind::UniformBuffer | BindingKind::StorageBuffer)
    }
}

/// One binding slot of a [`BindingLayout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingLayoutEntry {
    /// Resource kind.
    pub kind: BindingKind,
    /// Shader stages that read the binding.
    pub stages: vk::ShaderStageFlags,
    /// Array length; 1 for non-arrayed bindings.
    pub count: u32,
}

impl BindingLayoutEntry {
    /// Creates an entry with an explicit array count.
    #[inline]
    pub fn new(kind: BindingKind, stages: vk::ShaderStageFlags, count: u32) -> Self {
        Self {
            kind,
            stages,
            count,
        }
    }

    /// Creates a single uniform buffer entry.
    #[inline]
    pub fn uniform_buffer(stages: vk::ShaderStageFlags) -> Self {
        Self::new(BindingKind::UniformBuffer, stages, 1)
    }

    /// Creates a single storage buffer entry.
    #[inline]
    pub fn storage_buffer(stages: vk::ShaderStageFlags) -> Self {
        Self::new(BindingKind::StorageBuffer, stages, 1)
    }

    /// Creates a combined image sampler entry with `count` array elements.
    #[inline]
    pub fn combined_image_sampler(stages: vk::ShaderStageFlags, count: u32) -> Self {
        Self::new(BindingKind::CombinedImageSampler, stages, count)
    }

    /// Vulkan layout binding for this entry at `binding`.
    pub fn to_vk(&self, binding: u32) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(self.kind.descriptor_type())
            .descriptor_count(self.count)
            .stage_flags(self.stages)
    }
}

/// Ordered list of binding slots making up one descriptor set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BindingLayout {
    entries: Vec<BindingLayoutEntry>,
}

impl BindingLayout {
    /// Creates a layout from ordered entries.
    pub fn new(entries: Vec<BindingLayoutEntry>) -> Self {
        Self { entries }
    }

    /// Appends an entry, builder style.
    #[must_use]
    pub fn with(mut self, entry: BindingLayoutEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// The ordered entries.
    #[inline]
    pub fn entries(&self) -> &[BindingLayoutEntry] {
        &self.entries
    }

    /// Number of binding slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the layout has no bindings.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at binding number `binding`.
    #[inline]
    pub fn entry(&self, binding: u32) -> Option<&BindingLayoutEntry> {
        self.entries.get(binding as usize)
    }

    /// Descriptor count per kind needed by one set of this layout.
    pub fn demand(&self) -> BTreeMap<BindingKind, u32> {
        let mut demand = BTreeMap::new();
        for entry in &self.entries {
            *demand.entry(entry.kind).or_insert(0) += entry.count;
        }
        demand
    }

    /// Vulkan layout bindings numbered by position.
    pub fn vk_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.entries
            .iter()
            .enumerate()
            .map(|(binding, entry)| entry.to_vk(binding as u32))
            .collect()
    }
}

/// Image element of an image-kind descriptor write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Image view, null for pure sampler bindings.
    pub view: vk::ImageView,
    /// Sampler, null for sampled-image bindings.
    pub sampler: vk::Sampler,
    /// Layout the image is in when sampled.
    pub layout: vk::ImageLayout,
}

impl ImageDescriptor {
    /// Shader-read-only image with a sampler.
    #[inline]
    pub fn sampled(view: vk::ImageView, sampler: vk::Sampler) -> Self {
        Self {
            view,
            sampler,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

/// One resolved descriptor update.
#[derive(Clone, Debug, PartialEq)]
pub enum DescriptorWrite {
    /// A buffer range at `binding`.
    Buffer {
        /// Binding number.
        binding: u32,
        /// Buffer kind of the binding.
        kind: BindingKind,
        /// Buffer handle.
        buffer: vk::Buffer,
        /// Byte offset into the buffer.
        offset: vk::DeviceSize,
        /// Byte range, or `vk::WHOLE_SIZE`.
        range: vk::DeviceSize,
    },
    /// Image array elements starting at element 0 of `binding`.
    Images {
        /// Binding number.
        binding: u32,
        /// Image kind of the binding.
        kind: BindingKind,
        /// Elements to write.
        images: Vec<ImageDescriptor>,
    },
}

impl DescriptorWrite {
    /// Binding number targeted by this write.
    #[inline]
    pub fn binding(&self) -> u32 {
        match self {
            DescriptorWrite::Buffer { binding, .. } | DescriptorWrite::Images { binding, .. } => {
                *binding
            }
        }
    }

    /// Kind of the targeted binding.
    #[inline]
    pub fn kind(&self) -> BindingKind {
        match self {
            DescriptorWrite::Buffer { kind, .. } | DescriptorWrite::Images { kind, .. } => *kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured_layout() -> BindingLayout {
        BindingLayout::default()
            .with(BindingLayoutEntry::uniform_buffer(
                vk::ShaderStageFlags::VERTEX,
            ))
            .with(BindingLayoutEntry::combined_image_sampler(
                vk::ShaderStageFlags::FRAGMENT,
                2,
            ))
            .with(BindingLayoutEntry::uniform_buffer(
                vk::ShaderStageFlags::FRAGMENT,
            ))
    }

    #[test]
    fn test_descriptor_types() {
        assert_eq!(
            BindingKind::UniformBuffer.descriptor_type(),
            vk::DescriptorType::UNIFORM_BUFFER
        );
        assert_eq!(
            BindingKind::CombinedImageSampler.descriptor_type(),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert!(BindingKind::StorageBuffer.is_buffer());
        assert!(!BindingKind::SampledImage.is_buffer());
    }

    #[test]
    fn test_entry_to_vk() {
        let binding =
            BindingLayoutEntry::combined_image_sampler(vk::ShaderStageFlags::FRAGMENT, 4).to_vk(2);
        assert_eq!(binding.binding, 2);
        assert_eq!(
            binding.descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(binding.descriptor_count, 4);
        assert_eq!(binding.stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn test_layout_binding_numbers_follow_order() {
        let bindings = textured_layout().vk_bindings();
        let numbers: Vec<u32> = bindings.iter().map(|b| b.binding).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn test_layout_demand_sums_counts_per_kind() {
        let demand = textured_layout().demand();
        assert_eq!(demand.get(&BindingKind::UniformBuffer), Some(&2));
        assert_eq!(demand.get(&BindingKind::CombinedImageSampler), Some(&2));
        assert_eq!(demand.get(&BindingKind::StorageBuffer), None);
    }

    #[test]
    fn test_layouts_hash_by_content() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(textured_layout());
        assert!(set.contains(&textured_layout()));
        assert!(!set.contains(&BindingLayout::default()));
    }

    #[test]
    fn test_descriptor_write_accessors() {
        let write = DescriptorWrite::Images {
            binding: 3,
            kind: BindingKind::SampledImage,
            images: vec![ImageDescriptor::sampled(
                vk::ImageView::null(),
                vk::Sampler::null(),
            )],
        };
        assert_eq!(write.binding(), 3);
        assert_eq!(write.kind(), BindingKind::SampledImage);
    }
}
