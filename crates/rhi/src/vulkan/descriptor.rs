//! Descriptor layouts, pools and set updates on a Vulkan device.

use ash::vk;
use tracing::debug;

use crate::binding::{BindingKind, BindingLayoutEntry, DescriptorWrite};
use crate::error::{RhiError, RhiResult};

/// Creates a set layout numbered by entry position.
pub fn create_set_layout(
    device: &ash::Device,
    entries: &[BindingLayoutEntry],
) -> RhiResult<vk::DescriptorSetLayout> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = entries
        .iter()
        .enumerate()
        .map(|(binding, entry)| entry.to_vk(binding as u32))
        .collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    let layout = unsafe { device.create_descriptor_set_layout(&create_info, None)? };
    debug!("Created set layout with {} binding(s)", bindings.len());
    Ok(layout)
}

/// Pool sizes for `sizes`, merged per type with zero counts dropped.
pub fn pool_sizes(sizes: &[(BindingKind, u32)]) -> Vec<vk::DescriptorPoolSize> {
    let mut merged: Vec<vk::DescriptorPoolSize> = Vec::new();
    for &(kind, count) in sizes.iter().filter(|(_, count)| *count > 0) {
        let ty = kind.descriptor_type();
        match merged.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += count,
            None => merged.push(
                vk::DescriptorPoolSize::default()
                    .ty(ty)
                    .descriptor_count(count),
            ),
        }
    }
    merged
}

/// Creates a pool whose sets can be freed one by one.
pub fn create_pool(
    device: &ash::Device,
    max_sets: u32,
    sizes: &[(BindingKind, u32)],
) -> RhiResult<vk::DescriptorPool> {
    let pool_sizes = pool_sizes(sizes);
    let create_info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(max_sets)
        .pool_sizes(&pool_sizes);
    let pool = unsafe { device.create_descriptor_pool(&create_info, None)? };
    debug!(
        "Created descriptor pool: max_sets={}, {} size class(es)",
        max_sets,
        pool_sizes.len()
    );
    Ok(pool)
}

/// Allocates one set, reporting a full or fragmented pool as
/// [`RhiError::OutOfPoolMemory`].
pub fn allocate_set(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> RhiResult<vk::DescriptorSet> {
    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
        Ok(sets) => sets
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::InvalidHandle("driver returned no set".to_string())),
        Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
            Err(RhiError::OutOfPoolMemory)
        }
        Err(err) => Err(err.into()),
    }
}

/// Applies resolved writes to `set`.
pub fn write_set(device: &ash::Device, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
    // Info arrays must outlive the write structs pointing into them.
    let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = writes
        .iter()
        .filter_map(|write| match *write {
            DescriptorWrite::Buffer {
                buffer,
                offset,
                range,
                ..
            } => Some([vk::DescriptorBufferInfo {
                buffer,
                offset,
                range,
            }]),
            DescriptorWrite::Images { .. } => None,
        })
        .collect();
    let image_infos: Vec<Vec<vk::DescriptorImageInfo>> = writes
        .iter()
        .filter_map(|write| match write {
            DescriptorWrite::Images { images, .. } => Some(
                images
                    .iter()
                    .map(|image| vk::DescriptorImageInfo {
                        sampler: image.sampler,
                        image_view: image.view,
                        image_layout: image.layout,
                    })
                    .collect(),
            ),
            DescriptorWrite::Buffer { .. } => None,
        })
        .collect();

    let mut buffers = buffer_infos.iter();
    let mut images = image_infos.iter();
    let vk_writes: Vec<vk::WriteDescriptorSet> = writes
        .iter()
        .filter_map(|write| {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(write.binding())
                .descriptor_type(write.kind().descriptor_type());
            match write {
                DescriptorWrite::Buffer { .. } => buffers.next().map(|info| base.buffer_info(info)),
                DescriptorWrite::Images { .. } => images
                    .next()
                    .filter(|info| !info.is_empty())
                    .map(|info| base.image_info(info)),
            }
        })
        .collect();

    unsafe { device.update_descriptor_sets(&vk_writes, &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizes_merge_and_skip_zero() {
        let sizes = pool_sizes(&[
            (BindingKind::UniformBuffer, 4),
            (BindingKind::Sampler, 0),
            (BindingKind::UniformBuffer, 2),
            (BindingKind::CombinedImageSampler, 3),
        ]);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 6);
        assert_eq!(sizes[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[1].descriptor_count, 3);
    }
}
