//! Surface queries and `VkSwapchainKHR` creation.
//!
//! The choosers are pure functions over the surface's reported support, so
//! they are tested without a device.

use ash::vk;
use tracing::{debug, info, warn};

use super::device::Device;
use crate::backend::{PresentModePreference, SwapchainDesc, SwapchainImages};
use crate::error::{RhiError, RhiResult};

/// What a surface supports on the selected GPU.
#[derive(Clone, Debug)]
pub struct SurfaceSupport {
    /// Image count, extent and transform limits.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Format and color space pairs.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// Queries support of `surface` on `physical_device`.
    pub fn query(
        loader: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> RhiResult<Self> {
        let (capabilities, formats, present_modes) = unsafe {
            (
                loader.get_physical_device_surface_capabilities(physical_device, surface)?,
                loader.get_physical_device_surface_formats(physical_device, surface)?,
                loader.get_physical_device_surface_present_modes(physical_device, surface)?,
            )
        };
        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }
}

/// Prefers B8G8R8A8 sRGB, then B8G8R8A8 UNORM, then whatever comes first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let find = |format: vk::Format| {
        formats.iter().copied().find(|f| {
            f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
    };
    find(vk::Format::B8G8R8A8_SRGB)
        .or_else(|| {
            let fallback = find(vk::Format::B8G8R8A8_UNORM);
            if fallback.is_some() {
                warn!("Surface lacks B8G8R8A8_SRGB, using B8G8R8A8_UNORM");
            }
            fallback
        })
        .or_else(|| formats.first().copied())
}

/// Uses the preferred mode when offered, FIFO otherwise.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preference: PresentModePreference,
) -> vk::PresentModeKHR {
    let wanted = preference.to_vk();
    if available.contains(&wanted) {
        wanted
    } else {
        debug!("Present mode {:?} unavailable, using FIFO", wanted);
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's fixed extent, or the requested one clamped to its limits.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// `preferred`, or one above the minimum, within the surface's limits.
///
/// A `max_image_count` of zero means no upper limit.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, preferred: Option<u32>) -> u32 {
    let wanted = preferred
        .unwrap_or(caps.min_image_count + 1)
        .max(caps.min_image_count);
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

/// Creates a swapchain for `surface`, retiring `desc.old_swapchain`.
pub fn create_swapchain(
    device: &Device,
    loader: &ash::khr::swapchain::Device,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    desc: &SwapchainDesc,
) -> RhiResult<SwapchainImages> {
    let support = SurfaceSupport::query(surface_loader, device.physical_device(), surface)?;
    let format = choose_surface_format(&support.formats)
        .ok_or_else(|| RhiError::SwapchainError("surface reports no formats".to_string()))?;
    let present_mode = choose_present_mode(&support.present_modes, desc.present_mode);
    let extent = choose_extent(&support.capabilities, desc.extent);
    if extent.width == 0 || extent.height == 0 {
        return Err(RhiError::SwapchainError(
            "surface extent is zero".to_string(),
        ));
    }
    let min_images = choose_image_count(&support.capabilities, desc.preferred_image_count);

    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(min_images)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(support.capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(desc.old_swapchain);

    let swapchain = unsafe { loader.create_swapchain(&create_info, None)? };
    let images = match unsafe { loader.get_swapchain_images(swapchain) } {
        Ok(images) => images,
        Err(err) => {
            unsafe { loader.destroy_swapchain(swapchain, None) };
            return Err(err.into());
        }
    };

    info!(
        "Swapchain created: {}x{}, {:?}, {:?}, {} images",
        extent.width,
        extent.height,
        format.format,
        present_mode,
        images.len()
    );

    Ok(SwapchainImages {
        swapchain,
        images,
        format: format.format,
        extent,
    })
}

/// Creates a 2D color view over a whole swapchain image.
pub fn create_color_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> RhiResult<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
        );
    Ok(unsafe { device.create_image_view(&create_info, None)? })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32, current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: current,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    const UNDEFINED_EXTENT: vk::Extent2D = vk::Extent2D {
        width: u32::MAX,
        height: u32::MAX,
    };

    #[test]
    fn test_surface_format_preference() {
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let other = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[other, unorm, srgb]), Some(srgb));
        assert_eq!(choose_surface_format(&[other, unorm]), Some(unorm));
        assert_eq!(choose_surface_format(&[other]), Some(other));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn test_present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&available, PresentModePreference::Immediate),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&available, PresentModePreference::Mailbox),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_extent_uses_current_when_defined() {
        let current = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let requested = vk::Extent2D {
            width: 1024,
            height: 768,
        };
        assert_eq!(choose_extent(&caps(2, 3, current), requested), current);
    }

    #[test]
    fn test_extent_clamped_when_undefined() {
        let requested = vk::Extent2D {
            width: 10_000,
            height: 300,
        };
        let extent = choose_extent(&caps(2, 3, UNDEFINED_EXTENT), requested);
        assert_eq!(extent.width, 4096);
        assert_eq!(extent.height, 300);
    }

    #[test]
    fn test_image_count_limits() {
        assert_eq!(choose_image_count(&caps(2, 3, UNDEFINED_EXTENT), None), 3);
        assert_eq!(choose_image_count(&caps(3, 3, UNDEFINED_EXTENT), None), 3);
        assert_eq!(choose_image_count(&caps(2, 0, UNDEFINED_EXTENT), None), 3);
        assert_eq!(choose_image_count(&caps(2, 8, UNDEFINED_EXTENT), Some(1)), 2);
        assert_eq!(choose_image_count(&caps(2, 3, UNDEFINED_EXTENT), Some(6)), 3);
    }
}
