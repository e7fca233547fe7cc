//! Logical device, the graphics+present queue and the memory allocator.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::adapter::{Adapter, DEVICE_EXTENSIONS};
use super::instance::Instance;
use crate::error::RhiResult;

/// Logical device shared by every Vulkan-side object.
///
/// Dynamic rendering is enabled, so pipelines render straight into swap
/// image views without render pass objects.
pub struct Device {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    queue: vk::Queue,
    queue_family: u32,
    allocator: ManuallyDrop<Mutex<Allocator>>,
}

impl Device {
    /// Creates the device with one queue from the adapter's family.
    pub fn new(instance: &Instance, adapter: &Adapter) -> RhiResult<Arc<Self>> {
        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(adapter.queue_family)
            .queue_priorities(&priorities)];

        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let features = vk::PhysicalDeviceFeatures::default().fill_mode_non_solid(true);

        let extension_names: Vec<*const std::ffi::c_char> =
            DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features)
            .push_next(&mut features_1_3);

        let device = unsafe {
            instance
                .handle()
                .create_device(adapter.physical_device, &create_info, None)?
        };
        let queue = unsafe { device.get_device_queue(adapter.queue_family, 0) };
        debug!("Queue retrieved from family {}", adapter.queue_family);

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: adapter.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err.into());
            }
        };
        info!("Logical device and allocator ready on '{}'", adapter.name());

        Ok(Arc::new(Self {
            device,
            physical_device: adapter.physical_device,
            queue,
            queue_family: adapter.queue_family,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
        }))
    }

    /// Device function table.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// The graphics+present queue.
    #[inline]
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Family index of [`queue`](Self::queue).
    #[inline]
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Memory allocator.
    #[inline]
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Blocks until the device is idle.
    pub fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                error!("Device wait idle failed during drop: {:?}", err);
            }
            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// The allocator is behind a mutex and everything else is a plain handle.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}
