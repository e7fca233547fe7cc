//! [`GpuBackend`] on a real Vulkan 1.3 device.
//!
//! # Overview
//!
//! [`VulkanBackend`] owns the instance, surface, logical device and one
//! command pool, and forwards every trait call to the matching `ash` call.
//! Buffers and depth targets carry a `gpu-allocator` allocation, so they are
//! kept in tables keyed by their handle and freed on destroy.
//!
//! Submission and presentation share one queue; both take the queue lock.

mod adapter;
mod commands;
mod descriptor;
mod device;
mod instance;
mod memory;
mod pipeline;
mod surface;
mod swapchain;

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::{error, info, warn};

pub use adapter::Adapter;
pub use device::Device;
pub use instance::Instance;
pub use surface::Surface;
pub use swapchain::{
    SurfaceSupport, choose_extent, choose_image_count, choose_present_mode, choose_surface_format,
};

use self::memory::{DepthImage, MappedBuffer};
use crate::backend::{
    DepthTarget, GpuBackend, PipelineDesc, PipelineObjects, SwapchainDesc, SwapchainImages,
};
use crate::binding::{BindingKind, BindingLayoutEntry, DescriptorWrite};
use crate::buffer::BufferUsage;
use crate::command::{RenderCommand, Submission};
use crate::error::{RhiError, RhiResult};

/// Vulkan implementation of [`GpuBackend`].
pub struct VulkanBackend {
    adapter: Adapter,
    swapchain_loader: ash::khr::swapchain::Device,
    command_pool: Mutex<vk::CommandPool>,
    queue_lock: Mutex<()>,
    buffers: Mutex<HashMap<vk::Buffer, MappedBuffer>>,
    depth_targets: Mutex<HashMap<vk::Image, DepthImage>>,
    // Drop order: device, then surface, then instance.
    device: Arc<Device>,
    surface: Surface,
    instance: Instance,
}

impl VulkanBackend {
    /// Brings up Vulkan for a window.
    ///
    /// # Safety
    ///
    /// The window behind `window` must outlive the backend.
    ///
    /// # Errors
    ///
    /// Fails when Vulkan cannot be loaded, the surface cannot be created or
    /// no GPU offers Vulkan 1.3 with a graphics+present queue.
    pub unsafe fn new(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        enable_validation: bool,
    ) -> RhiResult<Self> {
        let instance = Instance::new(display, enable_validation)?;
        let surface = unsafe { Surface::new(&instance, display, window)? };
        let adapter =
            adapter::select_adapter(instance.handle(), surface.loader(), surface.handle())?;
        let device = Device::new(&instance, &adapter)?;
        let swapchain_loader =
            ash::khr::swapchain::Device::new(instance.handle(), device.handle());
        let command_pool = commands::create_command_pool(device.handle(), device.queue_family())?;

        info!("Vulkan backend ready on '{}'", adapter.name());
        Ok(Self {
            adapter,
            swapchain_loader,
            command_pool: Mutex::new(command_pool),
            queue_lock: Mutex::new(()),
            buffers: Mutex::new(HashMap::new()),
            depth_targets: Mutex::new(HashMap::new()),
            device,
            surface,
            instance,
        })
    }

    /// The selected GPU.
    #[inline]
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Whether validation layers are active.
    #[inline]
    pub fn has_validation(&self) -> bool {
        self.instance.has_validation()
    }

    fn raw(&self) -> &ash::Device {
        self.device.handle()
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            error!("Device wait idle failed during shutdown: {}", err);
        }
        let leaked_buffers: Vec<MappedBuffer> =
            self.buffers.get_mut().drain().map(|(_, b)| b).collect();
        if !leaked_buffers.is_empty() {
            warn!("{} buffer(s) still alive at shutdown", leaked_buffers.len());
        }
        for buffer in leaked_buffers {
            buffer.destroy(&self.device);
        }
        for (_, depth) in self.depth_targets.get_mut().drain() {
            depth.destroy(&self.device);
        }
        let pool = *self.command_pool.get_mut();
        unsafe { self.device.handle().destroy_command_pool(pool, None) };
        info!("Vulkan backend shut down");
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.raw().create_fence(&create_info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.raw().destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> RhiResult<()> {
        unsafe { self.raw().wait_for_fences(&[fence], true, timeout)? };
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        unsafe { self.raw().reset_fences(&[fence])? };
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        Ok(unsafe { self.raw().get_fence_status(fence)? })
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.raw().create_semaphore(&create_info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.raw().destroy_semaphore(semaphore, None) };
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let _queue = self.queue_lock.lock();
        self.device.wait_idle()
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<SwapchainImages> {
        swapchain::create_swapchain(
            &self.device,
            &self.swapchain_loader,
            self.surface.loader(),
            self.surface.handle(),
            desc,
        )
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain,
                crate::backend::WAIT_FOREVER,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let swapchains = [swapchain];
        let indices = [image_index];
        let waits = [wait_semaphore];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        let _queue = self.queue_lock.lock();
        unsafe {
            self.swapchain_loader
                .queue_present(self.device.queue(), &present_info)
        }
    }

    fn create_color_view(&self, image: vk::Image, format: vk::Format) -> RhiResult<vk::ImageView> {
        swapchain::create_color_view(self.raw(), image, format)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.raw().destroy_image_view(view, None) };
    }

    fn create_depth_target(&self, extent: vk::Extent2D) -> RhiResult<DepthTarget> {
        let depth = DepthImage::new(&self.device, extent)?;
        let target = depth.target;
        self.depth_targets.lock().insert(target.image, depth);
        Ok(target)
    }

    fn destroy_depth_target(&self, target: DepthTarget) {
        if let Some(depth) = self.depth_targets.lock().remove(&target.image) {
            depth.destroy(&self.device);
        }
    }

    fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer> {
        let pool = self.command_pool.lock();
        commands::allocate_command_buffer(self.raw(), *pool)
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        commands::begin(self.raw(), cmd)
    }

    fn record(&self, cmd: vk::CommandBuffer, command: &RenderCommand) {
        commands::record(self.raw(), cmd, command);
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        unsafe { self.raw().end_command_buffer(cmd)? };
        Ok(())
    }

    fn submit(&self, submission: &Submission) -> RhiResult<()> {
        let _queue = self.queue_lock.lock();
        commands::submit(self.raw(), self.device.queue(), submission)
    }

    fn create_buffer(&self, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<vk::Buffer> {
        let buffer = MappedBuffer::new(&self.device, usage, size)?;
        let handle = buffer.buffer;
        self.buffers.lock().insert(handle, buffer);
        Ok(handle)
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> RhiResult<()> {
        self.buffers
            .lock()
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown buffer {buffer:?}")))?
            .write(offset, data)
    }

    fn read_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: usize,
    ) -> RhiResult<Vec<u8>> {
        self.buffers
            .lock()
            .get(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown buffer {buffer:?}")))?
            .read(offset, len)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if let Some(mapped) = self.buffers.lock().remove(&buffer) {
            mapped.destroy(&self.device);
        }
    }

    fn create_binding_layout(
        &self,
        entries: &[BindingLayoutEntry],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        descriptor::create_set_layout(self.raw(), entries)
    }

    fn destroy_binding_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.raw().destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[(BindingKind, u32)],
    ) -> RhiResult<vk::DescriptorPool> {
        descriptor::create_pool(self.raw(), max_sets, sizes)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.raw().destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        descriptor::allocate_set(self.raw(), pool, layout)
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> RhiResult<()> {
        if sets.is_empty() {
            return Ok(());
        }
        unsafe { self.raw().free_descriptor_sets(pool, sets)? };
        Ok(())
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        descriptor::write_set(self.raw(), set, writes);
    }

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> RhiResult<PipelineObjects> {
        pipeline::create_pipeline(self.raw(), desc)
    }

    fn destroy_pipeline(&self, objects: PipelineObjects) {
        unsafe {
            self.raw().destroy_pipeline(objects.pipeline, None);
            self.raw().destroy_pipeline_layout(objects.layout, None);
        }
    }
}
