use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::debug;

use super::instance::Instance;
use crate::error::{RhiError, RhiResult};

/// Owned `VkSurfaceKHR`; destroyed on drop, before the instance.
pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Creates a surface for a platform window.
    ///
    /// # Safety
    ///
    /// The window behind `window` must outlive the returned surface.
    pub unsafe fn new(
        instance: &Instance,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> RhiResult<Self> {
        let handle = unsafe {
            ash_window::create_surface(instance.entry(), instance.handle(), display, window, None)
        }
        .map_err(|err| RhiError::SurfaceError(format!("surface creation failed: {err}")))?;
        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        debug!("Vulkan surface created");
        Ok(Self { handle, loader })
    }

    /// Raw surface handle.
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Surface extension loader.
    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
        debug!("Vulkan surface destroyed");
    }
}
