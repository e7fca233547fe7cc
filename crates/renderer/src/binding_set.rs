//! Resource binding sets.
//!
//! A [`BindingSet`] is an ordered list of bindings matching a
//! [`BindingLayout`], plus one descriptor set per swap image. Uniform blocks
//! are owned by the set and duplicated per swap image, so a frame writing
//! its duplicate never touches memory an earlier, still in-flight frame
//! reads.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use tracing::debug;

use vkframe_rhi::backend::GpuBackend;
use vkframe_rhi::binding::{
    BindingKind, BindingLayout, BindingLayoutEntry, DescriptorWrite, ImageDescriptor,
};
use vkframe_rhi::buffer::{BufferUsage, GpuBuffer};
use vkframe_rhi::{RhiError, RhiResult};

use crate::arena::ArenaKey;
use crate::binding_pool::{PoolResource, layout_demand};

/// The content of one binding.
#[derive(Clone, Debug, PartialEq)]
pub enum BindingWrite {
    /// A uniform block owned by the set, duplicated per swap image.
    Uniform {
        size: vk::DeviceSize,
        initial: Option<Vec<u8>>,
    },
    /// A range of an externally owned buffer.
    Buffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    /// Externally owned sampled images, one per array element.
    Images(Vec<ImageDescriptor>),
}

impl BindingWrite {
    /// A zero-initialized uniform block of `size` bytes.
    pub fn uniform(size: vk::DeviceSize) -> Self {
        BindingWrite::Uniform {
            size,
            initial: None,
        }
    }

    /// A uniform block initialized with `bytes`.
    pub fn uniform_bytes(bytes: &[u8]) -> Self {
        BindingWrite::Uniform {
            size: bytes.len() as vk::DeviceSize,
            initial: Some(bytes.to_vec()),
        }
    }

    /// A uniform block initialized with a plain-old-data value.
    pub fn uniform_pod<T: Pod>(value: &T) -> Self {
        Self::uniform_bytes(bytemuck::bytes_of(value))
    }

    /// A whole external buffer.
    pub fn buffer(buffer: vk::Buffer, range: vk::DeviceSize) -> Self {
        BindingWrite::Buffer {
            buffer,
            offset: 0,
            range,
        }
    }

    pub fn images(images: Vec<ImageDescriptor>) -> Self {
        BindingWrite::Images(images)
    }

    fn check(&self, binding: usize, entry: &BindingLayoutEntry) -> RhiResult<()> {
        let mismatch =
            |what: String| Err(RhiError::LayoutMismatch(format!("binding {binding}: {what}")));
        match self {
            BindingWrite::Uniform { size, initial } => {
                if entry.kind != BindingKind::UniformBuffer || entry.count != 1 {
                    return mismatch(format!("uniform block written to {:?}", entry.kind));
                }
                if *size == 0 {
                    return mismatch("uniform block must not be empty".to_string());
                }
                if let Some(bytes) = initial
                    && bytes.len() as vk::DeviceSize > *size
                {
                    return mismatch(format!(
                        "{} initial bytes exceed the {size}-byte block",
                        bytes.len()
                    ));
                }
                Ok(())
            }
            BindingWrite::Buffer { range, .. } => {
                if !entry.kind.is_buffer() || entry.count != 1 {
                    return mismatch(format!("buffer written to {:?}", entry.kind));
                }
                if *range == 0 {
                    return mismatch("buffer range must not be empty".to_string());
                }
                Ok(())
            }
            BindingWrite::Images(images) => {
                if entry.kind.is_buffer() {
                    return mismatch(format!("images written to {:?}", entry.kind));
                }
                if images.len() != entry.count as usize {
                    return mismatch(format!(
                        "{} images for {} array elements",
                        images.len(),
                        entry.count
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Checks that `writes` fills every binding of `layout` with matching data.
///
/// # Errors
///
/// Returns [`RhiError::LayoutMismatch`] naming the first offending binding.
pub fn validate_writes(layout: &BindingLayout, writes: &[BindingWrite]) -> RhiResult<()> {
    if writes.len() != layout.len() {
        return Err(RhiError::LayoutMismatch(format!(
            "layout has {} bindings, got {} writes",
            layout.len(),
            writes.len()
        )));
    }
    layout
        .entries()
        .iter()
        .zip(writes)
        .enumerate()
        .try_for_each(|(binding, (entry, write))| write.check(binding, entry))
}

/// Handle to a binding set owned by the binding pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingSetId {
    index: u32,
    generation: u32,
}

impl BindingSetId {
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl ArenaKey for BindingSetId {
    fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    fn index(self) -> u32 {
        self.index
    }

    fn generation(self) -> u32 {
        self.generation
    }
}

/// One uniform block and its per-image duplicates.
pub(crate) struct UniformBlock<B: GpuBackend> {
    size: vk::DeviceSize,
    duplicates: Vec<GpuBuffer<B>>,
}

impl<B: GpuBackend> UniformBlock<B> {
    fn new(
        backend: &Arc<B>,
        size: vk::DeviceSize,
        initial: Option<&[u8]>,
        image_count: u32,
    ) -> RhiResult<Self> {
        let duplicates = (0..image_count)
            .map(|_| {
                let buffer = GpuBuffer::new(backend.clone(), BufferUsage::Uniform, size)?;
                if let Some(bytes) = initial {
                    buffer.write(0, bytes)?;
                }
                Ok(buffer)
            })
            .collect::<RhiResult<Vec<_>>>()?;
        Ok(Self { size, duplicates })
    }

    fn duplicate(&self, image: u32) -> RhiResult<&GpuBuffer<B>> {
        self.duplicates.get(image as usize).ok_or_else(|| {
            RhiError::InvalidHandle(format!("no uniform duplicate for swap image {image}"))
        })
    }
}

/// A live binding set; see the module docs.
pub struct BindingSet<B: GpuBackend> {
    layout: BindingLayout,
    set_layout: vk::DescriptorSetLayout,
    writes: Vec<BindingWrite>,
    uniforms: BTreeMap<u32, UniformBlock<B>>,
    pub(crate) demand: Vec<(PoolResource, u32)>,
    pub(crate) descriptor_sets: Vec<vk::DescriptorSet>,
    pub(crate) external_refs: u32,
    pub(crate) last_used: Option<u64>,
}

impl<B: GpuBackend> BindingSet<B> {
    /// Creates the set's uniform duplicates. Descriptor sets are allocated
    /// by the pool afterwards.
    pub(crate) fn new(
        backend: &Arc<B>,
        layout: &BindingLayout,
        set_layout: vk::DescriptorSetLayout,
        writes: Vec<BindingWrite>,
        image_count: u32,
    ) -> RhiResult<Self> {
        let mut uniforms = BTreeMap::new();
        for (binding, write) in writes.iter().enumerate() {
            if let BindingWrite::Uniform { size, initial } = write {
                let block = UniformBlock::new(backend, *size, initial.as_deref(), image_count)?;
                uniforms.insert(binding as u32, block);
            }
        }
        Ok(Self {
            layout: layout.clone(),
            set_layout,
            writes,
            uniforms,
            demand: layout_demand(layout),
            descriptor_sets: Vec::new(),
            external_refs: 1,
            last_used: None,
        })
    }

    #[inline]
    pub fn layout(&self) -> &BindingLayout {
        &self.layout
    }

    #[inline]
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    /// Owners outside the pool.
    #[inline]
    pub fn external_refs(&self) -> u32 {
        self.external_refs
    }

    /// Newest frame that bound this set.
    #[inline]
    pub fn last_used(&self) -> Option<u64> {
        self.last_used
    }

    /// Descriptor set for swap image `image`.
    #[inline]
    pub fn descriptor_set(&self, image: u32) -> Option<vk::DescriptorSet> {
        self.descriptor_sets.get(image as usize).copied()
    }

    /// Uniform buffer behind `binding` for swap image `image`.
    pub fn uniform_buffer(&self, binding: u32, image: u32) -> Option<vk::Buffer> {
        self.uniforms
            .get(&binding)
            .and_then(|block| block.duplicates.get(image as usize))
            .map(GpuBuffer::handle)
    }

    /// Whether the sweep may destroy this set.
    pub(crate) fn is_reclaimable(&self, completed: u64) -> bool {
        self.external_refs == 0 && self.last_used.is_none_or(|frame| frame <= completed)
    }

    /// Descriptor contents for swap image `image`.
    pub(crate) fn descriptor_writes(&self, image: u32) -> Vec<DescriptorWrite> {
        self.writes
            .iter()
            .zip(self.layout.entries())
            .enumerate()
            .filter_map(|(binding, (write, entry))| {
                let binding = binding as u32;
                let kind = entry.kind;
                match write {
                    BindingWrite::Uniform { size, .. } => Some(DescriptorWrite::Buffer {
                        binding,
                        kind,
                        buffer: self.uniform_buffer(binding, image)?,
                        offset: 0,
                        range: *size,
                    }),
                    BindingWrite::Buffer {
                        buffer,
                        offset,
                        range,
                    } => Some(DescriptorWrite::Buffer {
                        binding,
                        kind,
                        buffer: *buffer,
                        offset: *offset,
                        range: *range,
                    }),
                    BindingWrite::Images(images) => Some(DescriptorWrite::Images {
                        binding,
                        kind,
                        images: images.clone(),
                    }),
                }
            })
            .collect()
    }

    fn uniform(&self, binding: u32) -> RhiResult<&UniformBlock<B>> {
        self.uniforms.get(&binding).ok_or_else(|| {
            RhiError::LayoutMismatch(format!("binding {binding} is not a uniform block"))
        })
    }

    pub(crate) fn write_uniform(
        &self,
        binding: u32,
        image: u32,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> RhiResult<()> {
        self.uniform(binding)?.duplicate(image)?.write(offset, bytes)
    }

    pub(crate) fn read_uniform(
        &self,
        binding: u32,
        image: u32,
        offset: vk::DeviceSize,
        len: usize,
    ) -> RhiResult<Vec<u8>> {
        self.uniform(binding)?.duplicate(image)?.read(offset, len)
    }

    /// Matches the uniform duplicates to a new swap image count.
    ///
    /// New duplicates start as copies of duplicate 0. Returns the surplus
    /// duplicates, which may still be read by in-flight frames.
    pub(crate) fn resize_duplicates(
        &mut self,
        backend: &Arc<B>,
        image_count: u32,
    ) -> RhiResult<Vec<GpuBuffer<B>>> {
        let mut surplus = Vec::new();
        for block in self.uniforms.values_mut() {
            let count = image_count as usize;
            if block.duplicates.len() > count {
                surplus.extend(block.duplicates.drain(count..));
                continue;
            }
            let contents = match block.duplicates.first() {
                Some(first) => Some(first.read(0, block.size as usize)?),
                None => None,
            };
            while block.duplicates.len() < count {
                let buffer = GpuBuffer::new(backend.clone(), BufferUsage::Uniform, block.size)?;
                if let Some(bytes) = &contents {
                    buffer.write(0, bytes)?;
                }
                block.duplicates.push(buffer);
            }
        }
        if !surplus.is_empty() {
            debug!("Retiring {} surplus uniform duplicates", surplus.len());
        }
        Ok(surplus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkframe_rhi::headless::HeadlessBackend;

    fn layout() -> BindingLayout {
        BindingLayout::default()
            .with(BindingLayoutEntry::uniform_buffer(
                vk::ShaderStageFlags::VERTEX,
            ))
            .with(BindingLayoutEntry::combined_image_sampler(
                vk::ShaderStageFlags::FRAGMENT,
                2,
            ))
    }

    fn images(count: usize) -> Vec<ImageDescriptor> {
        vec![ImageDescriptor::sampled(vk::ImageView::null(), vk::Sampler::null()); count]
    }

    #[test]
    fn test_validate_accepts_matching_writes() {
        let writes = vec![BindingWrite::uniform(64), BindingWrite::images(images(2))];
        assert!(validate_writes(&layout(), &writes).is_ok());
    }

    #[test]
    fn test_validate_rejects_mismatches() {
        let missing = vec![BindingWrite::uniform(64)];
        assert!(matches!(
            validate_writes(&layout(), &missing),
            Err(RhiError::LayoutMismatch(_))
        ));

        let swapped = vec![BindingWrite::images(images(2)), BindingWrite::uniform(64)];
        assert!(validate_writes(&layout(), &swapped).is_err());

        let short_array = vec![BindingWrite::uniform(64), BindingWrite::images(images(1))];
        assert!(validate_writes(&layout(), &short_array).is_err());

        let oversized = vec![
            BindingWrite::Uniform {
                size: 4,
                initial: Some(vec![0; 8]),
            },
            BindingWrite::images(images(2)),
        ];
        assert!(validate_writes(&layout(), &oversized).is_err());
    }

    #[test]
    fn test_uniform_duplicates_are_independent() {
        let backend = Arc::new(HeadlessBackend::default());
        let set = BindingSet::new(
            &backend,
            &layout(),
            vk::DescriptorSetLayout::null(),
            vec![
                BindingWrite::uniform_bytes(&[1, 2, 3, 4]),
                BindingWrite::images(images(2)),
            ],
            3,
        )
        .unwrap();

        set.write_uniform(0, 1, 0, &[9, 9]).unwrap();
        assert_eq!(set.read_uniform(0, 0, 0, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(set.read_uniform(0, 1, 0, 4).unwrap(), vec![9, 9, 3, 4]);
        assert!(set.write_uniform(1, 0, 0, &[0]).is_err());
        assert!(set.write_uniform(0, 3, 0, &[0]).is_err());
        assert_eq!(backend.stats().live_buffers, 3);
    }

    #[test]
    fn test_descriptor_writes_point_at_the_image_duplicate() {
        let backend = Arc::new(HeadlessBackend::default());
        let set = BindingSet::new(
            &backend,
            &layout(),
            vk::DescriptorSetLayout::null(),
            vec![BindingWrite::uniform(16), BindingWrite::images(images(2))],
            2,
        )
        .unwrap();

        let writes = set.descriptor_writes(1);
        assert_eq!(writes.len(), 2);
        match &writes[0] {
            DescriptorWrite::Buffer { buffer, range, .. } => {
                assert_eq!(Some(*buffer), set.uniform_buffer(0, 1));
                assert_eq!(*range, 16);
            }
            other => panic!("unexpected write {other:?}"),
        }
        assert_eq!(writes[1].kind(), BindingKind::CombinedImageSampler);
    }

    #[test]
    fn test_resize_duplicates_copies_and_retires() {
        let backend = Arc::new(HeadlessBackend::default());
        let mut set = BindingSet::new(
            &backend,
            &layout(),
            vk::DescriptorSetLayout::null(),
            vec![
                BindingWrite::uniform_bytes(&[7; 8]),
                BindingWrite::images(images(2)),
            ],
            2,
        )
        .unwrap();

        assert!(set.resize_duplicates(&backend, 3).unwrap().is_empty());
        assert_eq!(set.read_uniform(0, 2, 0, 8).unwrap(), vec![7; 8]);

        let surplus = set.resize_duplicates(&backend, 1).unwrap();
        assert_eq!(surplus.len(), 2);
        assert!(set.uniform_buffer(0, 1).is_none());
    }

    #[test]
    fn test_reclaimable_only_after_release_and_retirement() {
        let backend = Arc::new(HeadlessBackend::default());
        let mut set = BindingSet::new(
            &backend,
            &layout(),
            vk::DescriptorSetLayout::null(),
            vec![BindingWrite::uniform(16), BindingWrite::images(images(2))],
            2,
        )
        .unwrap();
        assert!(!set.is_reclaimable(0));
        set.external_refs = 0;
        assert!(set.is_reclaimable(0));
        set.last_used = Some(5);
        assert!(!set.is_reclaimable(4));
        assert!(set.is_reclaimable(5));
    }
}
