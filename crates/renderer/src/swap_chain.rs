//! The swap buffer chain.
//!
//! [`SwapChain`] owns the presentable images, their color views, one
//! render-finished semaphore per image and the depth target they share. It
//! is the only place the render thread blocks: [`SwapChain::acquire_image`]
//! first waits on the frame slot's fence and then, if needed, on the fence
//! of whichever frame last wrote the acquired image.
//!
//! # State machine
//!
//! ```text
//! Ready --(out of date | suboptimal | resize)--> RecreatePending
//! RecreatePending --(next acquire, non-zero extent)--> Recreating --> Ready
//! ```
//!
//! Recreation drains the device and swaps every image-dependent object at
//! once, so callers never see a half-built chain.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, trace, warn};

use vkframe_rhi::backend::{
    DepthTarget, GpuBackend, PresentModePreference, SwapchainDesc, WAIT_FOREVER,
};
use vkframe_rhi::command::{RenderTarget, Submission};
use vkframe_rhi::sync::Semaphore;
use vkframe_rhi::{RhiError, RhiResult};

use crate::config::RendererConfig;
use crate::frame_manager::{FrameClock, FrameSlot};

/// Presentation settings of a [`SwapChain`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapChainOptions {
    pub present_mode: PresentModePreference,
    pub preferred_image_count: Option<u32>,
    /// Acquire attempts per frame; an out-of-date chain past this is fatal.
    pub max_acquire_attempts: u32,
}

impl Default for SwapChainOptions {
    fn default() -> Self {
        Self::from_config(&RendererConfig::default())
    }
}

impl SwapChainOptions {
    pub fn from_config(config: &RendererConfig) -> Self {
        Self {
            present_mode: config.present_mode,
            preferred_image_count: config.preferred_image_count,
            max_acquire_attempts: config.max_acquire_attempts.max(1),
        }
    }
}

/// Why the chain must be rebuilt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecreateReason {
    OutOfDate,
    Suboptimal,
    Resized,
}

/// Lifecycle state of the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainState {
    Ready,
    RecreatePending(RecreateReason),
    Recreating,
}

/// The frame that last wrote a swap image and the fence its submission
/// signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameStamp {
    pub frame: u64,
    pub fence: vk::Fence,
}

/// Result of a successful acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    /// Swap image index to render into.
    pub index: u32,
    /// The chain was recreated since the previous acquire.
    pub recreated: bool,
    /// The device reported the chain suboptimal; it is rebuilt next frame.
    pub suboptimal: bool,
}

/// Outcome of presenting a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// Presented, but the chain will be rebuilt before the next acquire.
    Suboptimal,
    /// Not presented; the chain will be rebuilt before the next acquire.
    OutOfDate,
}

struct SwapImage<B: GpuBackend> {
    image: vk::Image,
    view: vk::ImageView,
    render_finished: Semaphore<B>,
    last_write: Option<FrameStamp>,
}

/// Presentable images and their per-image synchronization.
pub struct SwapChain<B: GpuBackend> {
    backend: Arc<B>,
    options: SwapChainOptions,
    requested_extent: vk::Extent2D,
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<SwapImage<B>>,
    depth: Option<DepthTarget>,
    state: ChainState,
    recreate_count: u64,
    updated: bool,
}

#[inline]
fn is_zero(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

impl<B: GpuBackend> SwapChain<B> {
    /// Creates the chain for a drawable of `extent`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SwapchainError`] for a zero extent and device
    /// errors from swapchain, view or depth creation.
    pub fn new(
        backend: Arc<B>,
        extent: vk::Extent2D,
        options: SwapChainOptions,
    ) -> RhiResult<Self> {
        if is_zero(extent) {
            return Err(RhiError::SwapchainError(
                "cannot create a swap chain for a zero-sized drawable".to_string(),
            ));
        }
        let mut chain = Self {
            backend,
            options,
            requested_extent: extent,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::Format::UNDEFINED,
            extent,
            images: Vec::new(),
            depth: None,
            state: ChainState::Recreating,
            recreate_count: 0,
            updated: false,
        };
        chain.rebuild()?;
        info!(
            "Swap chain created: {}x{}, {} images, {:?}",
            chain.extent.width,
            chain.extent.height,
            chain.images.len(),
            chain.format
        );
        Ok(chain)
    }

    /// Asks for a rebuild at `extent` before the next acquire.
    pub fn request_resize(&mut self, extent: vk::Extent2D) {
        debug!(
            "Resize requested: {}x{} -> {}x{}",
            self.extent.width, self.extent.height, extent.width, extent.height
        );
        self.requested_extent = extent;
        self.state = ChainState::RecreatePending(RecreateReason::Resized);
    }

    /// Waits for the slot to be reusable and acquires a swap image.
    ///
    /// Returns `Ok(None)` when the drawable is zero-sized; the frame must be
    /// skipped and the slot stays unused.
    ///
    /// # Errors
    ///
    /// Fatal device errors, and [`RhiError::SwapchainError`] when the chain
    /// stays out of date for `max_acquire_attempts` attempts.
    pub fn acquire_image(
        &mut self,
        slot: &mut FrameSlot<B>,
        clock: &mut FrameClock,
    ) -> RhiResult<Option<AcquiredImage>> {
        slot.wait_retired(clock)?;

        let attempts = self.options.max_acquire_attempts.max(1);
        for attempt in 1..=attempts {
            if self.needs_recreate() {
                if is_zero(self.requested_extent) {
                    trace!("Drawable is zero-sized; skipping frame");
                    return Ok(None);
                }
                self.recreate()?;
                clock.retire_all();
            }

            match self
                .backend
                .acquire_next_image(self.swapchain, slot.image_available().handle())
            {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        warn!("Swap chain is suboptimal; recreating after this frame");
                        self.state = ChainState::RecreatePending(RecreateReason::Suboptimal);
                    }
                    self.wait_image_retired(index, clock)?;
                    return Ok(Some(AcquiredImage {
                        index,
                        recreated: std::mem::take(&mut self.updated),
                        suboptimal,
                    }));
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    warn!(
                        "Swap chain out of date on acquire (attempt {}/{})",
                        attempt, attempts
                    );
                    self.state = ChainState::RecreatePending(RecreateReason::OutOfDate);
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(RhiError::SwapchainError(format!(
            "swap chain still out of date after {attempts} acquire attempts"
        )))
    }

    /// Images may come back out of slot order, so the frame that last wrote
    /// this image can still be pending even after the slot wait.
    fn wait_image_retired(&self, index: u32, clock: &mut FrameClock) -> RhiResult<()> {
        let image = self.image(index)?;
        if let Some(stamp) = image.last_write
            && !clock.is_retired(stamp.frame)
        {
            trace!(
                "Image {} still written by frame {}; waiting on its fence",
                index, stamp.frame
            );
            self.backend.wait_for_fence(stamp.fence, WAIT_FOREVER)?;
            clock.retire(stamp.frame);
        }
        Ok(())
    }

    /// Submits the slot's recorded commands for `frame` and presents
    /// `image_index`.
    ///
    /// The submission waits on the slot's acquire semaphore, signals the
    /// image's render-finished semaphore and the slot's fence.
    pub fn submit(
        &mut self,
        slot: &mut FrameSlot<B>,
        image_index: u32,
        frame: u64,
    ) -> RhiResult<PresentStatus> {
        let render_finished = self.image(image_index)?.render_finished.handle();

        slot.prepare_submit(frame)?;
        self.backend.submit(&Submission::frame(
            slot.command_buffer(),
            slot.image_available().handle(),
            render_finished,
            slot.fence().handle(),
        ))?;

        let stamp = FrameStamp {
            frame,
            fence: slot.fence().handle(),
        };
        if let Some(image) = self.images.get_mut(image_index as usize) {
            image.last_write = Some(stamp);
        }

        match self
            .backend
            .present(self.swapchain, image_index, render_finished)
        {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => {
                warn!("Swap chain suboptimal on present");
                self.state = ChainState::RecreatePending(RecreateReason::Suboptimal);
                Ok(PresentStatus::Suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                warn!("Swap chain out of date on present");
                self.state = ChainState::RecreatePending(RecreateReason::OutOfDate);
                Ok(PresentStatus::OutOfDate)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Drains the device and rebuilds every image-dependent object.
    pub fn recreate(&mut self) -> RhiResult<()> {
        let reason = match self.state {
            ChainState::RecreatePending(reason) => reason,
            _ => RecreateReason::Resized,
        };
        if is_zero(self.requested_extent) {
            return Err(RhiError::SwapchainError(
                "cannot recreate a swap chain for a zero-sized drawable".to_string(),
            ));
        }

        self.state = ChainState::Recreating;
        if let Err(err) = self.backend.wait_idle().and_then(|()| self.rebuild()) {
            self.state = ChainState::RecreatePending(reason);
            return Err(err);
        }

        self.recreate_count += 1;
        self.updated = true;
        info!(
            "Swap chain recreated ({:?}): {}x{}, {} images",
            reason,
            self.extent.width,
            self.extent.height,
            self.images.len()
        );
        Ok(())
    }

    /// Builds the new objects first and only then replaces the old ones.
    fn rebuild(&mut self) -> RhiResult<()> {
        let created = self.backend.create_swapchain(&SwapchainDesc {
            extent: self.requested_extent,
            present_mode: self.options.present_mode,
            preferred_image_count: self.options.preferred_image_count,
            old_swapchain: self.swapchain,
        })?;

        let mut images = Vec::with_capacity(created.images.len());
        let built = created.images.iter().try_for_each(|&image| {
            let view = self.backend.create_color_view(image, created.format)?;
            let render_finished = match Semaphore::new(self.backend.clone()) {
                Ok(semaphore) => semaphore,
                Err(err) => {
                    self.backend.destroy_image_view(view);
                    return Err(err);
                }
            };
            images.push(SwapImage {
                image,
                view,
                render_finished,
                last_write: None,
            });
            Ok(())
        });
        let depth = built.and_then(|()| self.backend.create_depth_target(created.extent));
        let depth = match depth {
            Ok(depth) => depth,
            Err(err) => {
                for image in images {
                    self.backend.destroy_image_view(image.view);
                }
                self.backend.destroy_swapchain(created.swapchain);
                return Err(err);
            }
        };

        let old_images = std::mem::replace(&mut self.images, images);
        let old_depth = self.depth.replace(depth);
        let old_swapchain = std::mem::replace(&mut self.swapchain, created.swapchain);
        self.destroy_objects(old_images, old_depth, old_swapchain);

        self.format = created.format;
        self.extent = created.extent;
        self.state = ChainState::Ready;
        debug!(
            "Built {} swap images with views and render-finished semaphores",
            self.images.len()
        );
        Ok(())
    }

    fn destroy_objects(
        &self,
        images: Vec<SwapImage<B>>,
        depth: Option<DepthTarget>,
        swapchain: vk::SwapchainKHR,
    ) {
        for image in images {
            self.backend.destroy_image_view(image.view);
        }
        if let Some(depth) = depth {
            self.backend.destroy_depth_target(depth);
        }
        if swapchain != vk::SwapchainKHR::null() {
            self.backend.destroy_swapchain(swapchain);
        }
    }

    fn image(&self, index: u32) -> RhiResult<&SwapImage<B>> {
        self.images
            .get(index as usize)
            .ok_or_else(|| RhiError::InvalidHandle(format!("swap image index {index}")))
    }

    #[inline]
    fn needs_recreate(&self) -> bool {
        !matches!(self.state, ChainState::Ready)
    }

    /// Attachments for rendering into `index`.
    pub fn render_target(&self, index: u32) -> RhiResult<RenderTarget> {
        let image = self.image(index)?;
        Ok(RenderTarget {
            color_image: image.image,
            color_view: image.view,
            depth: self.depth,
            extent: self.extent,
        })
    }

    /// The frame that last wrote image `index`.
    pub fn last_write(&self, index: u32) -> Option<FrameStamp> {
        self.images.get(index as usize).and_then(|i| i.last_write)
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn depth_format(&self) -> Option<vk::Format> {
        self.depth.map(|d| d.format)
    }

    #[inline]
    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Number of recreations since creation.
    #[inline]
    pub fn recreate_count(&self) -> u64 {
        self.recreate_count
    }
}

impl<B: GpuBackend> Drop for SwapChain<B> {
    fn drop(&mut self) {
        if let Err(err) = self.backend.wait_idle() {
            warn!("wait_idle failed while destroying swap chain: {}", err);
        }
        let images = std::mem::take(&mut self.images);
        let depth = self.depth.take();
        self.destroy_objects(images, depth, self.swapchain);
        debug!("Swap chain destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_manager::FrameManager;
    use vkframe_rhi::headless::{HeadlessBackend, HeadlessConfig};

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    type Setup = (
        Arc<HeadlessBackend>,
        FrameManager<HeadlessBackend>,
        SwapChain<HeadlessBackend>,
    );

    fn setup(image_count: u32) -> Setup {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig {
            image_count,
            ..Default::default()
        }));
        let frames = FrameManager::new(&backend, 2).unwrap();
        let chain =
            SwapChain::new(backend.clone(), extent(640, 480), SwapChainOptions::default()).unwrap();
        (backend, frames, chain)
    }

    fn run_frame(
        backend: &HeadlessBackend,
        frames: &mut FrameManager<HeadlessBackend>,
        chain: &mut SwapChain<HeadlessBackend>,
    ) -> Option<(AcquiredImage, PresentStatus)> {
        let (slot, clock) = frames.current_mut();
        let acquired = chain.acquire_image(slot, clock).unwrap()?;
        let frame = clock.begin();
        backend.begin_commands(slot.command_buffer()).unwrap();
        backend.end_commands(slot.command_buffer()).unwrap();
        let status = chain.submit(slot, acquired.index, frame).unwrap();
        clock.record_submit(frame);
        frames.advance();
        Some((acquired, status))
    }

    #[test]
    fn test_new_rejects_zero_extent() {
        let backend = Arc::new(HeadlessBackend::default());
        let result = SwapChain::new(backend, extent(0, 480), SwapChainOptions::default());
        assert!(matches!(result, Err(RhiError::SwapchainError(_))));
    }

    #[test]
    fn test_new_builds_views_and_depth() {
        let (backend, _frames, chain) = setup(3);
        assert_eq!(chain.image_count(), 3);
        assert_eq!(chain.state(), ChainState::Ready);
        assert_eq!(chain.recreate_count(), 0);
        assert!(chain.depth_format().is_some());
        // three color views plus the shared depth view
        assert_eq!(backend.stats().live_image_views, 4);
    }

    #[test]
    fn test_out_of_date_acquire_recreates_once() {
        let (backend, mut frames, mut chain) = setup(3);
        run_frame(&backend, &mut frames, &mut chain).unwrap();
        backend.invalidate_surface();

        let (acquired, _) = run_frame(&backend, &mut frames, &mut chain).unwrap();
        assert!(acquired.recreated);
        assert_eq!(chain.recreate_count(), 1);

        let (acquired, _) = run_frame(&backend, &mut frames, &mut chain).unwrap();
        assert!(!acquired.recreated);
        assert_eq!(chain.recreate_count(), 1);
    }

    #[test]
    fn test_zero_extent_skips_without_consuming_slot() {
        let (backend, mut frames, mut chain) = setup(2);
        chain.request_resize(extent(0, 0));
        assert!(run_frame(&backend, &mut frames, &mut chain).is_none());
        assert_eq!(frames.current_index(), 0);
        assert_eq!(backend.stats().submitted, 0);

        chain.request_resize(extent(800, 600));
        let (acquired, _) = run_frame(&backend, &mut frames, &mut chain).unwrap();
        assert!(acquired.recreated);
        assert_eq!(chain.extent(), extent(800, 600));
    }

    #[test]
    fn test_suboptimal_presents_then_recreates() {
        let (backend, mut frames, mut chain) = setup(3);
        backend.report_suboptimal_once();
        let (acquired, status) = run_frame(&backend, &mut frames, &mut chain).unwrap();
        assert!(acquired.suboptimal);
        assert_eq!(status, PresentStatus::Presented);
        assert_eq!(backend.stats().presents, 1);
        assert_eq!(
            chain.state(),
            ChainState::RecreatePending(RecreateReason::Suboptimal)
        );

        let (acquired, _) = run_frame(&backend, &mut frames, &mut chain).unwrap();
        assert!(acquired.recreated);
    }

    #[test]
    fn test_submit_stamps_image() {
        let (backend, mut frames, mut chain) = setup(3);
        let (acquired, _) = run_frame(&backend, &mut frames, &mut chain).unwrap();
        let stamp = chain.last_write(acquired.index).unwrap();
        assert_eq!(stamp.frame, 1);
    }

    #[test]
    fn test_recreate_replaces_objects_without_leaks() {
        let (backend, _frames, mut chain) = setup(3);
        backend.set_image_count(2);
        chain.request_resize(extent(320, 240));
        chain.recreate().unwrap();
        let stats = backend.stats();
        assert_eq!(chain.image_count(), 2);
        assert_eq!(stats.live_swapchains, 1);
        assert_eq!(stats.live_image_views, 3);
        drop(chain);
        let stats = backend.stats();
        assert_eq!(stats.live_swapchains, 0);
        assert_eq!(stats.live_image_views, 0);
    }
}
