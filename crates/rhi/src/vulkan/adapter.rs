//! Physical device selection.
//!
//! The frame core drives a single queue that both renders and presents, so a
//! GPU qualifies only if one queue family does both. Among qualifying GPUs,
//! discrete ones win, then the one with the most device-local memory.

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};

/// Device extensions every candidate must expose.
pub(crate) const DEVICE_EXTENSIONS: &[&CStr] = &[ash::khr::swapchain::NAME];

/// The selected GPU.
#[derive(Clone, Copy)]
pub struct Adapter {
    /// Physical device handle.
    pub physical_device: vk::PhysicalDevice,
    /// Device properties.
    pub properties: vk::PhysicalDeviceProperties,
    /// Family of the graphics+present queue.
    pub queue_family: u32,
}

impl Adapter {
    /// Device name reported by the driver.
    pub fn name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("unknown device")
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name())
            .field("type", &self.properties.device_type)
            .field("queue_family", &self.queue_family)
            .finish()
    }
}

/// Picks the best GPU able to render to and present on `surface`.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] when no device qualifies.
pub fn select_adapter(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> RhiResult<Adapter> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    debug!("Found {} physical device(s)", devices.len());

    let best = devices
        .into_iter()
        .filter_map(|device| {
            let adapter = qualify(instance, surface_loader, surface, device)?;
            let memory = unsafe { instance.get_physical_device_memory_properties(device) };
            let score = score(adapter.properties.device_type, device_local_bytes(&memory));
            debug!("Candidate '{}' scored {}", adapter.name(), score);
            Some((score, adapter))
        })
        .max_by_key(|(score, _)| *score)
        .map(|(_, adapter)| adapter);

    match best {
        Some(adapter) => {
            info!(
                "Selected GPU '{}' (queue family {})",
                adapter.name(),
                adapter.queue_family
            );
            Ok(adapter)
        }
        None => {
            warn!("No GPU offers Vulkan 1.3 with a graphics+present queue");
            Err(RhiError::NoSuitableGpu)
        }
    }
}

fn qualify(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> Option<Adapter> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    if properties.api_version < vk::API_VERSION_1_3 {
        return None;
    }

    let extensions = unsafe { instance.enumerate_device_extension_properties(device) }.ok()?;
    let has_extensions = DEVICE_EXTENSIONS.iter().all(|required| {
        extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(*required))
    });
    if !has_extensions {
        return None;
    }

    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let queue_family = families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        let graphics = family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let present = unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        };
        (graphics && present).then_some(index)
    })?;

    Some(Adapter {
        physical_device: device,
        properties,
        queue_family,
    })
}

fn device_local_bytes(memory: &vk::PhysicalDeviceMemoryProperties) -> u64 {
    memory
        .memory_heaps_as_slice()
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum()
}

/// Ranks device types first, then memory in MiB.
fn score(device_type: vk::PhysicalDeviceType, device_local: u64) -> u64 {
    let type_rank = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    };
    (type_rank << 32) | (device_local >> 20).min(u32::MAX as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    #[test]
    fn test_discrete_beats_integrated_regardless_of_memory() {
        assert!(
            score(vk::PhysicalDeviceType::DISCRETE_GPU, GIB)
                > score(vk::PhysicalDeviceType::INTEGRATED_GPU, 64 * GIB)
        );
    }

    #[test]
    fn test_memory_breaks_ties() {
        assert!(
            score(vk::PhysicalDeviceType::DISCRETE_GPU, 8 * GIB)
                > score(vk::PhysicalDeviceType::DISCRETE_GPU, 4 * GIB)
        );
    }

    #[test]
    fn test_swapchain_extension_required() {
        assert!(DEVICE_EXTENSIONS.contains(&ash::khr::swapchain::NAME));
    }
}
