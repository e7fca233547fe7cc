//! Buffers and depth images backed by `gpu-allocator`.
//!
//! Allocations are kept beside their handles in the backend's tables and
//! freed before the handle is destroyed.

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use super::device::Device;
use crate::backend::DepthTarget;
use crate::buffer::{BufferUsage, check_range};
use crate::error::{RhiError, RhiResult};

/// Depth format used for every depth target.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// A host-visible buffer and its memory.
pub struct MappedBuffer {
    pub(crate) buffer: vk::Buffer,
    allocation: Allocation,
    size: vk::DeviceSize,
}

impl MappedBuffer {
    /// Creates and binds a persistently mapped buffer.
    pub fn new(device: &Device, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<Self> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.handle().create_buffer(&info, None)? };
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name: usage.name(),
            requirements,
            location: usage.memory_location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.handle().destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };

        let bound = unsafe {
            device
                .handle()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let mapped = Self {
            buffer,
            allocation,
            size,
        };
        if let Err(err) = bound {
            mapped.destroy(device);
            return Err(err.into());
        }
        debug!("Created {} buffer: {} bytes", usage.name(), size);
        Ok(mapped)
    }

    fn mapped(&self) -> RhiResult<&[u8]> {
        self.allocation
            .mapped_slice()
            .ok_or_else(|| RhiError::InvalidHandle("buffer memory is not mapped".to_string()))
    }

    /// Copies `data` into the mapping at `offset`.
    pub fn write(&mut self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        check_range(offset, data.len(), self.size)?;
        let start = offset as usize;
        let mapping = self
            .allocation
            .mapped_slice_mut()
            .ok_or_else(|| RhiError::InvalidHandle("buffer memory is not mapped".to_string()))?;
        mapping[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copies `len` bytes out of the mapping at `offset`.
    pub fn read(&self, offset: vk::DeviceSize, len: usize) -> RhiResult<Vec<u8>> {
        check_range(offset, len, self.size)?;
        let start = offset as usize;
        Ok(self.mapped()?[start..start + len].to_vec())
    }

    /// Frees the memory, then destroys the buffer.
    pub fn destroy(self, device: &Device) {
        if let Err(err) = device.allocator().lock().free(self.allocation) {
            error!("Failed to free buffer allocation: {:?}", err);
        }
        unsafe { device.handle().destroy_buffer(self.buffer, None) };
    }
}

/// A device-local depth image and its memory.
pub struct DepthImage {
    pub(crate) target: DepthTarget,
    allocation: Allocation,
}

impl DepthImage {
    /// Creates a depth image and view of `extent`.
    pub fn new(device: &Device, extent: vk::Extent2D) -> RhiResult<Self> {
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::InvalidHandle(
                "depth target extent must be non-zero".to_string(),
            ));
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.handle().create_image(&image_info, None)? };
        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name: "depth_target",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.handle().destroy_image(image, None) };
                return Err(err.into());
            }
        };

        let view = unsafe {
            device
                .handle()
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .and_then(|()| {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(DEPTH_FORMAT)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::DEPTH)
                        .level_count(1)
                        .layer_count(1),
                );
            unsafe { device.handle().create_image_view(&view_info, None) }
        });

        let mut depth = Self {
            target: DepthTarget {
                image,
                view: vk::ImageView::null(),
                format: DEPTH_FORMAT,
            },
            allocation,
        };
        match view {
            Ok(view) => {
                depth.target.view = view;
                debug!("Created depth target {}x{}", extent.width, extent.height);
                Ok(depth)
            }
            Err(err) => {
                depth.destroy(device);
                Err(err.into())
            }
        }
    }

    /// Destroys the view, frees the memory and destroys the image.
    pub fn destroy(self, device: &Device) {
        unsafe {
            if self.target.view != vk::ImageView::null() {
                device.handle().destroy_image_view(self.target.view, None);
            }
        }
        if let Err(err) = device.allocator().lock().free(self.allocation) {
            error!("Failed to free depth allocation: {:?}", err);
        }
        unsafe { device.handle().destroy_image(self.target.image, None) };
    }
}
