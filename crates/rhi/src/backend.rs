//! The device seam between the frame core and a concrete graphics API.
//!
//! # Overview
//!
//! [`GpuBackend`] is the set of device operations the swap chain, frame
//! slots and binding pool need. It speaks raw `ash::vk` handles so the
//! Vulkan implementation is a thin forwarding layer, while
//! [`HeadlessBackend`](crate::headless::HeadlessBackend) can hand out
//! synthetic handles and simulate GPU completion deterministically.
//!
//! Handles returned by a backend are owned by the caller, which must return
//! them through the matching `destroy_*` call. The RAII wrappers in
//! [`sync`](crate::sync) and [`buffer`](crate::buffer) do that for the common
//! cases.
//!
//! Waits take a timeout in nanoseconds; the frame core always passes
//! [`WAIT_FOREVER`].

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::binding::{BindingKind, BindingLayoutEntry, DescriptorWrite};
use crate::buffer::BufferUsage;
use crate::command::{RenderCommand, Submission};
use crate::error::RhiResult;
use crate::pipeline::PipelineConfig;
use crate::vertex::VertexLayout;

/// Effectively unbounded fence timeout.
pub const WAIT_FOREVER: u64 = u64::MAX;

/// Preferred presentation mode; FIFO is the fallback everywhere.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePreference {
    /// V-sync, always supported.
    Fifo,
    /// Triple-buffered low latency when available.
    #[default]
    Mailbox,
    /// No v-sync, may tear.
    Immediate,
}

impl PresentModePreference {
    /// The Vulkan present mode to look for.
    #[inline]
    pub fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            PresentModePreference::Fifo => vk::PresentModeKHR::FIFO,
            PresentModePreference::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentModePreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

/// Parameters for (re)creating a swapchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainDesc {
    /// Drawable size reported by the window.
    pub extent: vk::Extent2D,
    /// Preferred present mode.
    pub present_mode: PresentModePreference,
    /// Desired image count, clamped to surface limits.
    pub preferred_image_count: Option<u32>,
    /// Swapchain being replaced, or null.
    pub old_swapchain: vk::SwapchainKHR,
}

/// A created swapchain and its presentable images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapchainImages {
    /// Swapchain handle.
    pub swapchain: vk::SwapchainKHR,
    /// Presentable images, indexed by acquire index.
    pub images: Vec<vk::Image>,
    /// Color format of the images.
    pub format: vk::Format,
    /// Actual extent chosen by the surface.
    pub extent: vk::Extent2D,
}

/// A depth attachment shared by every swap image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthTarget {
    /// Depth image.
    pub image: vk::Image,
    /// Depth view.
    pub view: vk::ImageView,
    /// Depth format.
    pub format: vk::Format,
}

/// Inputs for graphics pipeline creation.
#[derive(Clone, Copy, Debug)]
pub struct PipelineDesc<'a> {
    /// SPIR-V vertex shader bytes.
    pub vertex_spirv: &'a [u8],
    /// SPIR-V fragment shader bytes.
    pub fragment_spirv: &'a [u8],
    /// Vertex input layout for binding 0.
    pub vertex_layout: &'a VertexLayout,
    /// The single descriptor set layout at set 0.
    pub set_layout: vk::DescriptorSetLayout,
    /// Fixed-function state.
    pub config: &'a PipelineConfig,
    /// Color attachment format (swap image format).
    pub color_format: vk::Format,
    /// Depth attachment format of the pass, set even when `config` neither
    /// tests nor writes depth.
    pub depth_format: Option<vk::Format>,
}

/// A created pipeline and its layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineObjects {
    /// Pipeline handle.
    pub pipeline: vk::Pipeline,
    /// Pipeline layout handle.
    pub layout: vk::PipelineLayout,
}

/// Device operations used by the frame core.
pub trait GpuBackend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    // --- synchronization ---

    /// Creates a fence, optionally already signaled.
    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;

    /// Destroys a fence.
    fn destroy_fence(&self, fence: vk::Fence);

    /// Blocks until `fence` is signaled or `timeout` nanoseconds pass.
    ///
    /// # Errors
    ///
    /// Returns `VulkanError(TIMEOUT)` on timeout and device errors otherwise.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> RhiResult<()>;

    /// Returns `fence` to the unsignaled state.
    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()>;

    /// Non-blocking fence query.
    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool>;

    /// Creates a binary semaphore.
    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;

    /// Destroys a semaphore.
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Blocks until all submitted work has completed.
    fn wait_idle(&self) -> RhiResult<()>;

    // --- presentation ---

    /// Creates a swapchain for the backend's surface.
    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<SwapchainImages>;

    /// Destroys a swapchain. Its images go with it.
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Acquires the next presentable image, signaling `semaphore`.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    /// `ERROR_OUT_OF_DATE_KHR` is returned as an error.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result>;

    /// Queues `image_index` for presentation after `wait_semaphore`.
    ///
    /// Returns whether the swapchain is suboptimal.
    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result>;

    /// Creates a 2D color view of a swapchain image.
    fn create_color_view(&self, image: vk::Image, format: vk::Format) -> RhiResult<vk::ImageView>;

    /// Destroys an image view.
    fn destroy_image_view(&self, view: vk::ImageView);

    /// Creates a depth attachment of the given size.
    fn create_depth_target(&self, extent: vk::Extent2D) -> RhiResult<DepthTarget>;

    /// Destroys a depth attachment.
    fn destroy_depth_target(&self, target: DepthTarget);

    // --- commands ---

    /// Allocates a primary command buffer from the backend's pool.
    fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer>;

    /// Resets `cmd` and begins one-time-submit recording.
    fn begin_commands(&self, cmd: vk::CommandBuffer) -> RhiResult<()>;

    /// Records one command into `cmd`.
    fn record(&self, cmd: vk::CommandBuffer, command: &RenderCommand);

    /// Ends recording of `cmd`.
    fn end_commands(&self, cmd: vk::CommandBuffer) -> RhiResult<()>;

    /// Submits one command buffer to the graphics queue.
    fn submit(&self, submission: &Submission) -> RhiResult<()>;

    // --- buffers ---

    /// Creates a host-visible buffer of `size` bytes.
    fn create_buffer(&self, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<vk::Buffer>;

    /// Copies `data` into the buffer at `offset`.
    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8])
    -> RhiResult<()>;

    /// Reads `len` bytes from the buffer at `offset`.
    fn read_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: usize,
    ) -> RhiResult<Vec<u8>>;

    /// Destroys a buffer and frees its memory.
    fn destroy_buffer(&self, buffer: vk::Buffer);

    // --- bindings ---

    /// Creates a descriptor set layout numbered by entry position.
    fn create_binding_layout(
        &self,
        entries: &[BindingLayoutEntry],
    ) -> RhiResult<vk::DescriptorSetLayout>;

    /// Destroys a descriptor set layout.
    fn destroy_binding_layout(&self, layout: vk::DescriptorSetLayout);

    /// Creates a descriptor pool whose sets may be freed individually.
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[(BindingKind, u32)],
    ) -> RhiResult<vk::DescriptorPool>;

    /// Destroys a descriptor pool and every set allocated from it.
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocates one set of `layout` from `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::OutOfPoolMemory`](crate::RhiError::OutOfPoolMemory)
    /// when the pool has no room left.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet>;

    /// Returns sets to their pool.
    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> RhiResult<()>;

    /// Writes bindings into a set.
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    // --- pipelines ---

    /// Creates a graphics pipeline for dynamic rendering.
    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> RhiResult<PipelineObjects>;

    /// Destroys a pipeline and its layout.
    fn destroy_pipeline(&self, objects: PipelineObjects);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_mode_preference_to_vk() {
        assert_eq!(
            PresentModePreference::Fifo.to_vk(),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            PresentModePreference::Mailbox.to_vk(),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            PresentModePreference::Immediate.to_vk(),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn test_present_mode_preference_serde_names() {
        let parsed: PresentModePreference = serde_json::from_str("\"immediate\"").unwrap();
        assert_eq!(parsed, PresentModePreference::Immediate);
        assert_eq!(PresentModePreference::default(), PresentModePreference::Mailbox);
    }
}
