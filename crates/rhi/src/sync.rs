//! Owned synchronization primitives.
//!
//! This module provides RAII wrappers over backend sync objects:
//! - [`Semaphore`] - GPU-to-GPU ordering between queue operations
//! - [`Fence`] - GPU-to-CPU signal the host can wait on
//!
//! # Overview
//!
//! Each wrapper holds an `Arc` of the backend that created it and returns
//! its handle to that backend when dropped. The raw handle stays available
//! through `handle()` for submissions and presentation.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vkframe_rhi::backend::WAIT_FOREVER;
//! use vkframe_rhi::headless::HeadlessBackend;
//! use vkframe_rhi::sync::{Fence, Semaphore};
//!
//! # fn example() -> Result<(), vkframe_rhi::RhiError> {
//! let backend = Arc::new(HeadlessBackend::default());
//! let image_available = Semaphore::new(backend.clone())?;
//!
//! // Signaled so the first wait returns immediately.
//! let in_flight = Fence::new(backend, true)?;
//! in_flight.wait(WAIT_FOREVER)?;
//! in_flight.reset()?;
//! # let _ = image_available;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::backend::GpuBackend;
use crate::error::RhiResult;

/// Owned binary semaphore.
///
/// Semaphores order GPU work and are never observed by the CPU:
/// - Image available: signaled when a swapchain image is ready
/// - Render finished: signaled when rendering is complete
pub struct Semaphore<B: GpuBackend> {
    backend: Arc<B>,
    semaphore: vk::Semaphore,
}

impl<B: GpuBackend> Semaphore<B> {
    /// Creates a new semaphore in the unsignaled state.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(backend: Arc<B>) -> RhiResult<Self> {
        let semaphore = backend.create_semaphore()?;
        debug!("Created semaphore {:?}", semaphore);
        Ok(Self { backend, semaphore })
    }

    /// Returns the raw semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl<B: GpuBackend> Drop for Semaphore<B> {
    fn drop(&mut self) {
        self.backend.destroy_semaphore(self.semaphore);
        debug!("Destroyed semaphore {:?}", self.semaphore);
    }
}

/// Owned fence.
///
/// Fences let the host wait for GPU work:
/// - Frame-in-flight fence: wait before reusing a frame slot
/// - Image fence: wait before rendering into an image a pending frame still owns
pub struct Fence<B: GpuBackend> {
    backend: Arc<B>,
    fence: vk::Fence,
}

impl<B: GpuBackend> Fence<B> {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `backend` - The device
    /// * `signaled` - If true, the fence starts signaled so the first wait
    ///   on it returns immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(backend: Arc<B>, signaled: bool) -> RhiResult<Self> {
        let fence = backend.create_fence(signaled)?;
        debug!(
            "Created fence {:?} ({})",
            fence,
            if signaled { "signaled" } else { "unsignaled" }
        );
        Ok(Self { backend, fence })
    }

    /// Returns the raw fence handle.
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Waits for the fence to become signaled.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout in nanoseconds. Use
    ///   [`WAIT_FOREVER`](crate::backend::WAIT_FOREVER) for an unbounded wait.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait times out or the device is lost.
    pub fn wait(&self, timeout: u64) -> RhiResult<()> {
        self.backend.wait_for_fence(self.fence, timeout)
    }

    /// Resets the fence to the unsignaled state.
    ///
    /// The fence must not be attached to a pending submission.
    pub fn reset(&self) -> RhiResult<()> {
        self.backend.reset_fence(self.fence)
    }

    /// Non-blocking check whether the fence is signaled.
    pub fn is_signaled(&self) -> bool {
        matches!(self.backend.fence_status(self.fence), Ok(true))
    }
}

impl<B: GpuBackend> Drop for Fence<B> {
    fn drop(&mut self) {
        self.backend.destroy_fence(self.fence);
        debug!("Destroyed fence {:?}", self.fence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WAIT_FOREVER;
    use crate::headless::HeadlessBackend;

    #[test]
    fn test_semaphore_is_send_sync() {
        // Compile-time check that Semaphore is Send + Sync
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore<HeadlessBackend>>();
    }

    #[test]
    fn test_fence_is_send_sync() {
        // Compile-time check that Fence is Send + Sync
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Fence<HeadlessBackend>>();
    }

    #[test]
    fn test_signaled_fence_wait_and_reset() {
        let backend = Arc::new(HeadlessBackend::default());
        let fence = Fence::new(backend.clone(), true).unwrap();
        assert!(fence.is_signaled());
        fence.wait(WAIT_FOREVER).unwrap();
        fence.reset().unwrap();
        assert!(!fence.is_signaled());
    }

    #[test]
    fn test_drop_returns_handles() {
        let backend = Arc::new(HeadlessBackend::default());
        {
            let _fence = Fence::new(backend.clone(), false).unwrap();
            let _semaphore = Semaphore::new(backend.clone()).unwrap();
            assert_eq!(backend.stats().live_fences, 1);
            assert_eq!(backend.stats().live_semaphores, 1);
        }
        assert_eq!(backend.stats().live_fences, 0);
        assert_eq!(backend.stats().live_semaphores, 0);
    }
}
