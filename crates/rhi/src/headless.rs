//! A simulated device without a GPU.
//!
//! # Overview
//!
//! [`HeadlessBackend`] implements [`GpuBackend`] with synthetic handles and a
//! deterministic model of queue execution:
//!
//! - Submissions complete strictly in FIFO order, and only when the host
//!   waits for them: waiting on a fence completes every earlier submission
//!   up to and including the one that signals it. Each wait is logged as a
//!   [`FenceWait`].
//! - Waiting on an unsignaled fence that no pending submission will signal
//!   reports `TIMEOUT`, which is how a deadlock shows up.
//! - Presentation can be invalidated ([`invalidate_surface`]) or made
//!   suboptimal once, and the acquire order can be scripted.
//! - Descriptor pools enforce their limits and can be told to fail.
//! - Buffers are plain byte vectors.
//!
//! Misuse that a validation layer would flag (resubmitting a signaled fence,
//! resetting a pending fence or command buffer) is rejected with an error.
//!
//! [`invalidate_surface`]: HeadlessBackend::invalidate_surface

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::backend::{
    DepthTarget, GpuBackend, PipelineDesc, PipelineObjects, SwapchainDesc, SwapchainImages,
};
use crate::binding::{BindingKind, BindingLayoutEntry, DescriptorWrite};
use crate::buffer::{BufferUsage, check_range};
use crate::command::{RenderCommand, Submission};
use crate::error::{RhiError, RhiResult};
use crate::shader::{ShaderStage, spirv_words};

/// Format of every simulated depth target.
pub const HEADLESS_DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Shape of the simulated surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadlessConfig {
    /// Images every swapchain gets.
    pub image_count: u32,
    /// Extent forced by the surface; `None` accepts the requested extent.
    pub surface_extent: Option<vk::Extent2D>,
    /// Swap image format.
    pub color_format: vk::Format,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            image_count: 3,
            surface_extent: None,
            color_format: vk::Format::B8G8R8A8_SRGB,
        }
    }
}

/// One host wait on a fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FenceWait {
    /// The fence waited on.
    pub fence: vk::Fence,
    /// Whether the wait had to complete pending work.
    pub blocked: bool,
    /// Newest submission serial complete once the wait returned.
    pub completed_through: u64,
}

/// A submission as the queue saw it.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmissionRecord {
    /// 1-based submission order.
    pub serial: u64,
    /// The submission itself.
    pub submission: Submission,
    /// Commands recorded into its command buffer.
    pub commands: Vec<RenderCommand>,
}

/// Counters describing the simulated device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    /// Submissions accepted.
    pub submitted: u64,
    /// Submissions completed.
    pub completed: u64,
    /// Largest number of submissions pending at once.
    pub max_in_flight: usize,
    /// Swapchains created.
    pub swapchain_creations: u32,
    /// Descriptor pools created.
    pub descriptor_pool_creations: u32,
    /// `wait_idle` calls.
    pub wait_idle_calls: u32,
    /// Successful presents.
    pub presents: u64,
    /// Fences alive.
    pub live_fences: usize,
    /// Semaphores alive.
    pub live_semaphores: usize,
    /// Buffers alive.
    pub live_buffers: usize,
    /// Swapchains alive.
    pub live_swapchains: usize,
    /// Image views alive, depth views included.
    pub live_image_views: usize,
    /// Descriptor pools alive.
    pub live_descriptor_pools: usize,
    /// Descriptor sets alive.
    pub live_descriptor_sets: usize,
    /// Descriptor set layouts alive.
    pub live_set_layouts: usize,
    /// Pipelines alive.
    pub live_pipelines: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommandState {
    Initial,
    Recording,
    Executable,
}

struct CommandRecording {
    state: CommandState,
    commands: Vec<RenderCommand>,
}

struct PendingSubmission {
    serial: u64,
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
}

struct SwapchainState {
    images: Vec<vk::Image>,
    next_image: u32,
    retired: bool,
}

struct PoolState {
    free_sets: u32,
    free: BTreeMap<BindingKind, u32>,
    sets: HashSet<vk::DescriptorSet>,
}

struct SetState {
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    writes: BTreeMap<u32, DescriptorWrite>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    pending: VecDeque<PendingSubmission>,
    fence_waits: Vec<FenceWait>,
    submissions: Vec<SubmissionRecord>,
    command_buffers: HashMap<vk::CommandBuffer, CommandRecording>,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainState>,
    image_views: HashSet<vk::ImageView>,
    depth_images: HashSet<vk::Image>,
    acquire_script: VecDeque<u32>,
    surface_out_of_date: bool,
    suboptimal_once: bool,
    presented: Vec<u32>,
    buffers: HashMap<vk::Buffer, Vec<u8>>,
    set_layouts: HashMap<vk::DescriptorSetLayout, Vec<BindingLayoutEntry>>,
    pools: HashMap<vk::DescriptorPool, PoolState>,
    sets: HashMap<vk::DescriptorSet, SetState>,
    failing_allocations: u32,
    failing_frees: u32,
    pipelines: HashSet<vk::Pipeline>,
    stats: HeadlessStats,
}

impl State {
    fn next<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn complete_front(&mut self) -> Option<vk::Fence> {
        let done = self.pending.pop_front()?;
        self.stats.completed = done.serial;
        if done.fence != vk::Fence::null()
            && let Some(signaled) = self.fences.get_mut(&done.fence)
        {
            *signaled = true;
        }
        trace!("Completed submission {}", done.serial);
        Some(done.fence)
    }

    fn is_pending_fence(&self, fence: vk::Fence) -> bool {
        self.pending.iter().any(|p| p.fence == fence)
    }
}

/// Simulated device; see the module docs.
pub struct HeadlessBackend {
    config: Mutex<HeadlessConfig>,
    state: Mutex<State>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl HeadlessBackend {
    /// Creates a simulated device with the given surface shape.
    pub fn new(config: HeadlessConfig) -> Self {
        debug!(
            "Created headless backend with {} swap images",
            config.image_count
        );
        Self {
            config: Mutex::new(config),
            state: Mutex::new(State::default()),
        }
    }

    /// Makes acquire and present report out-of-date until the next
    /// swapchain creation, as after a surface resize.
    pub fn invalidate_surface(&self) {
        self.state.lock().surface_out_of_date = true;
    }

    /// Makes the next acquire report a suboptimal swapchain.
    pub fn report_suboptimal_once(&self) {
        self.state.lock().suboptimal_once = true;
    }

    /// Queues image indices for upcoming acquires, overriding round-robin.
    pub fn script_acquire_order(&self, indices: impl IntoIterator<Item = u32>) {
        self.state.lock().acquire_script.extend(indices);
    }

    /// Changes the image count of swapchains created from now on.
    pub fn set_image_count(&self, image_count: u32) {
        self.config.lock().image_count = image_count;
    }

    /// Forces the surface extent of swapchains created from now on.
    pub fn set_surface_extent(&self, extent: Option<vk::Extent2D>) {
        self.config.lock().surface_extent = extent;
    }

    /// Makes the next `count` descriptor set allocations fail with
    /// out-of-pool-memory regardless of capacity.
    pub fn fail_descriptor_allocations(&self, count: u32) {
        self.state.lock().failing_allocations = count;
    }

    /// Makes the next `count` descriptor set frees fail with an unknown
    /// device error, leaving the sets allocated.
    pub fn fail_descriptor_frees(&self, count: u32) {
        self.state.lock().failing_frees = count;
    }

    /// Completes every pending submission, as if the GPU caught up.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        while state.complete_front().is_some() {}
    }

    /// Snapshot of the device counters.
    pub fn stats(&self) -> HeadlessStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.live_fences = state.fences.len();
        stats.live_semaphores = state.semaphores.len();
        stats.live_buffers = state.buffers.len();
        stats.live_swapchains = state.swapchains.len();
        stats.live_image_views = state.image_views.len();
        stats.live_descriptor_pools = state.pools.len();
        stats.live_descriptor_sets = state.sets.len();
        stats.live_set_layouts = state.set_layouts.len();
        stats.live_pipelines = state.pipelines.len();
        stats
    }

    /// Every host fence wait so far.
    pub fn fence_waits(&self) -> Vec<FenceWait> {
        self.state.lock().fence_waits.clone()
    }

    /// Clears the fence wait log.
    pub fn clear_fence_waits(&self) {
        self.state.lock().fence_waits.clear();
    }

    /// Every submission so far, in queue order.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    /// Image indices presented so far, in order.
    pub fn presented(&self) -> Vec<u32> {
        self.state.lock().presented.clone()
    }

    /// Number of submissions not yet completed.
    pub fn in_flight(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Current descriptor writes of a set, ordered by binding.
    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> Vec<DescriptorWrite> {
        self.state
            .lock()
            .sets
            .get(&set)
            .map(|s| s.writes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a descriptor set is still allocated.
    pub fn is_descriptor_set_alive(&self, set: vk::DescriptorSet) -> bool {
        self.state.lock().sets.contains_key(&set)
    }

    /// Whether a buffer is still alive.
    pub fn is_buffer_alive(&self, buffer: vk::Buffer) -> bool {
        self.state.lock().buffers.contains_key(&buffer)
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = state.next();
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> RhiResult<()> {
        let mut state = self.state.lock();
        let signaled = *state
            .fences
            .get(&fence)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown fence {fence:?}")))?;

        if signaled {
            let completed_through = state.stats.completed;
            state.fence_waits.push(FenceWait {
                fence,
                blocked: false,
                completed_through,
            });
            return Ok(());
        }

        if !state.is_pending_fence(fence) {
            return Err(RhiError::VulkanError(vk::Result::TIMEOUT));
        }

        while let Some(done) = state.complete_front() {
            if done == fence {
                break;
            }
        }
        let completed_through = state.stats.completed;
        state.fence_waits.push(FenceWait {
            fence,
            blocked: true,
            completed_through,
        });
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        let mut state = self.state.lock();
        if state.is_pending_fence(fence) {
            return Err(RhiError::InvalidHandle(format!(
                "fence {fence:?} reset while its submission is pending"
            )));
        }
        let signaled = state
            .fences
            .get_mut(&fence)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown fence {fence:?}")))?;
        *signaled = false;
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown fence {fence:?}")))
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = state.next();
        state.semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        while state.complete_front().is_some() {}
        state.stats.wait_idle_calls += 1;
        Ok(())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<SwapchainImages> {
        let config = *self.config.lock();
        let extent = config.surface_extent.unwrap_or(desc.extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::SwapchainError(
                "cannot create a swapchain with a zero extent".to_string(),
            ));
        }

        let mut state = self.state.lock();
        if desc.old_swapchain != vk::SwapchainKHR::null() {
            let old = state.swapchains.get_mut(&desc.old_swapchain).ok_or_else(|| {
                RhiError::InvalidHandle(format!("unknown swapchain {:?}", desc.old_swapchain))
            })?;
            old.retired = true;
        }

        let swapchain = state.next();
        let images: Vec<vk::Image> = (0..config.image_count).map(|_| state.next()).collect();
        state.swapchains.insert(
            swapchain,
            SwapchainState {
                images: images.clone(),
                next_image: 0,
                retired: false,
            },
        );
        state.surface_out_of_date = false;
        state.stats.swapchain_creations += 1;

        Ok(SwapchainImages {
            swapchain,
            images,
            format: config.color_format,
            extent,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state.lock().swapchains.remove(&swapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        let mut state = self.state.lock();
        if !state.semaphores.contains(&semaphore) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let out_of_date = state.surface_out_of_date;
        let scripted = state.acquire_script.pop_front();
        let suboptimal = std::mem::take(&mut state.suboptimal_once);

        let chain = state
            .swapchains
            .get_mut(&swapchain)
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        if out_of_date || chain.retired {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }

        let count = chain.images.len() as u32;
        let index = match scripted {
            Some(index) if index < count => index,
            Some(_) => return Err(vk::Result::ERROR_UNKNOWN),
            None => {
                let index = chain.next_image;
                chain.next_image = (index + 1) % count;
                index
            }
        };
        Ok((index, suboptimal))
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let mut state = self.state.lock();
        let out_of_date = state.surface_out_of_date;
        let chain = state
            .swapchains
            .get(&swapchain)
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        if out_of_date || chain.retired {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        if image_index as usize >= chain.images.len() {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        state.presented.push(image_index);
        state.stats.presents += 1;
        Ok(false)
    }

    fn create_color_view(&self, _image: vk::Image, _format: vk::Format) -> RhiResult<vk::ImageView> {
        let mut state = self.state.lock();
        let view = state.next();
        state.image_views.insert(view);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().image_views.remove(&view);
    }

    fn create_depth_target(&self, extent: vk::Extent2D) -> RhiResult<DepthTarget> {
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::InvalidHandle(
                "depth target extent must be non-zero".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let image = state.next();
        let view = state.next();
        state.depth_images.insert(image);
        state.image_views.insert(view);
        Ok(DepthTarget {
            image,
            view,
            format: HEADLESS_DEPTH_FORMAT,
        })
    }

    fn destroy_depth_target(&self, target: DepthTarget) {
        let mut state = self.state.lock();
        state.image_views.remove(&target.view);
        state.depth_images.remove(&target.image);
    }

    fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let cmd = state.next();
        state.command_buffers.insert(
            cmd,
            CommandRecording {
                state: CommandState::Initial,
                commands: Vec::new(),
            },
        );
        Ok(cmd)
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state.lock();
        if state.pending.iter().any(|p| p.command_buffer == cmd) {
            return Err(RhiError::InvalidHandle(format!(
                "command buffer {cmd:?} reset while pending"
            )));
        }
        let recording = state
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown command buffer {cmd:?}")))?;
        recording.state = CommandState::Recording;
        recording.commands.clear();
        Ok(())
    }

    fn record(&self, cmd: vk::CommandBuffer, command: &RenderCommand) {
        let mut state = self.state.lock();
        if let Some(recording) = state.command_buffers.get_mut(&cmd)
            && recording.state == CommandState::Recording
        {
            recording.commands.push(*command);
        }
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state.lock();
        let recording = state
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown command buffer {cmd:?}")))?;
        if recording.state != CommandState::Recording {
            return Err(RhiError::InvalidHandle(format!(
                "command buffer {cmd:?} is not recording"
            )));
        }
        recording.state = CommandState::Executable;
        Ok(())
    }

    fn submit(&self, submission: &Submission) -> RhiResult<()> {
        let mut state = self.state.lock();
        let commands = match state.command_buffers.get(&submission.command_buffer) {
            Some(recording) if recording.state == CommandState::Executable => {
                recording.commands.clone()
            }
            _ => {
                return Err(RhiError::InvalidHandle(format!(
                    "command buffer {:?} is not executable",
                    submission.command_buffer
                )));
            }
        };

        if submission.fence != vk::Fence::null() {
            match state.fences.get(&submission.fence) {
                Some(false) if !state.is_pending_fence(submission.fence) => {}
                _ => {
                    return Err(RhiError::InvalidHandle(format!(
                        "fence {:?} must be unsignaled and idle at submit",
                        submission.fence
                    )));
                }
            }
        }

        let serial = state.stats.submitted + 1;
        state.stats.submitted = serial;
        state.pending.push_back(PendingSubmission {
            serial,
            fence: submission.fence,
            command_buffer: submission.command_buffer,
        });
        state.stats.max_in_flight = state.stats.max_in_flight.max(state.pending.len());
        state.submissions.push(SubmissionRecord {
            serial,
            submission: *submission,
            commands,
        });
        trace!("Queued submission {}", serial);
        Ok(())
    }

    fn create_buffer(&self, _usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<vk::Buffer> {
        let mut state = self.state.lock();
        let buffer = state.next();
        state.buffers.insert(buffer, vec![0; size as usize]);
        Ok(buffer)
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> RhiResult<()> {
        let mut state = self.state.lock();
        let bytes = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown buffer {buffer:?}")))?;
        check_range(offset, data.len(), bytes.len() as vk::DeviceSize)?;
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: usize,
    ) -> RhiResult<Vec<u8>> {
        let state = self.state.lock();
        let bytes = state
            .buffers
            .get(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown buffer {buffer:?}")))?;
        check_range(offset, len, bytes.len() as vk::DeviceSize)?;
        let start = offset as usize;
        Ok(bytes[start..start + len].to_vec())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.lock().buffers.remove(&buffer);
    }

    fn create_binding_layout(
        &self,
        entries: &[BindingLayoutEntry],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        let layout = state.next();
        state.set_layouts.insert(layout, entries.to_vec());
        Ok(layout)
    }

    fn destroy_binding_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.lock().set_layouts.remove(&layout);
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[(BindingKind, u32)],
    ) -> RhiResult<vk::DescriptorPool> {
        if max_sets == 0 {
            return Err(RhiError::InvalidHandle(
                "descriptor pool needs max_sets > 0".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let pool = state.next();
        let mut free = BTreeMap::new();
        for &(kind, count) in sizes {
            let free_count = free.entry(kind).or_insert(0u32);
            *free_count = free_count.saturating_add(count);
        }
        state.pools.insert(
            pool,
            PoolState {
                free_sets: max_sets,
                free,
                sets: HashSet::new(),
            },
        );
        state.stats.descriptor_pool_creations += 1;
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        if let Some(pool_state) = state.pools.remove(&pool) {
            for set in pool_state.sets {
                state.sets.remove(&set);
            }
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        if state.failing_allocations > 0 {
            state.failing_allocations -= 1;
            return Err(RhiError::OutOfPoolMemory);
        }

        let entries = state
            .set_layouts
            .get(&layout)
            .cloned()
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown set layout {layout:?}")))?;
        let pool_state = state
            .pools
            .get_mut(&pool)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown pool {pool:?}")))?;

        let mut need: BTreeMap<BindingKind, u32> = BTreeMap::new();
        for entry in &entries {
            *need.entry(entry.kind).or_insert(0) += entry.count;
        }
        let fits = pool_state.free_sets > 0
            && need
                .iter()
                .all(|(kind, count)| pool_state.free.get(kind).copied().unwrap_or(0) >= *count);
        if !fits {
            return Err(RhiError::OutOfPoolMemory);
        }

        pool_state.free_sets -= 1;
        for (kind, count) in need {
            if let Some(free) = pool_state.free.get_mut(&kind) {
                *free -= count;
            }
        }

        let set = state.next();
        if let Some(pool_state) = state.pools.get_mut(&pool) {
            pool_state.sets.insert(set);
        }
        state.sets.insert(
            set,
            SetState {
                pool,
                layout,
                writes: BTreeMap::new(),
            },
        );
        Ok(set)
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> RhiResult<()> {
        let mut state = self.state.lock();
        if state.failing_frees > 0 {
            state.failing_frees -= 1;
            return Err(RhiError::VulkanError(vk::Result::ERROR_UNKNOWN));
        }
        for set in sets {
            let set_state = state
                .sets
                .remove(set)
                .ok_or_else(|| RhiError::InvalidHandle(format!("unknown set {set:?}")))?;
            if set_state.pool != pool {
                return Err(RhiError::InvalidHandle(format!(
                    "set {set:?} does not belong to pool {pool:?}"
                )));
            }
            let entries = state
                .set_layouts
                .get(&set_state.layout)
                .cloned()
                .unwrap_or_default();
            if let Some(pool_state) = state.pools.get_mut(&pool) {
                pool_state.sets.remove(set);
                pool_state.free_sets += 1;
                for entry in entries {
                    *pool_state.free.entry(entry.kind).or_insert(0) += entry.count;
                }
            }
        }
        Ok(())
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        if let Some(set_state) = state.sets.get_mut(&set) {
            for write in writes {
                set_state.writes.insert(write.binding(), write.clone());
            }
        }
    }

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> RhiResult<PipelineObjects> {
        spirv_words(desc.vertex_spirv, ShaderStage::Vertex)?;
        spirv_words(desc.fragment_spirv, ShaderStage::Fragment)?;
        if !desc.vertex_layout.is_valid() {
            return Err(RhiError::PipelineError(
                "vertex attribute lies outside the vertex stride".to_string(),
            ));
        }

        let mut state = self.state.lock();
        if !state.set_layouts.contains_key(&desc.set_layout) {
            return Err(RhiError::InvalidHandle(format!(
                "unknown set layout {:?}",
                desc.set_layout
            )));
        }
        // Dynamic rendering needs the pipeline to name the pass's depth format.
        if !state.depth_images.is_empty() && desc.depth_format != Some(HEADLESS_DEPTH_FORMAT) {
            return Err(RhiError::PipelineError(format!(
                "depth attachment format {:?} does not match the pass ({:?})",
                desc.depth_format, HEADLESS_DEPTH_FORMAT
            )));
        }
        let pipeline = state.next();
        let layout = state.next();
        state.pipelines.insert(pipeline);
        Ok(PipelineObjects { pipeline, layout })
    }

    fn destroy_pipeline(&self, objects: PipelineObjects) {
        self.state.lock().pipelines.remove(&objects.pipeline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PresentModePreference, WAIT_FOREVER};

    fn swapchain(backend: &HeadlessBackend) -> SwapchainImages {
        backend
            .create_swapchain(&SwapchainDesc {
                extent: vk::Extent2D {
                    width: 640,
                    height: 480,
                },
                present_mode: PresentModePreference::Fifo,
                preferred_image_count: None,
                old_swapchain: vk::SwapchainKHR::null(),
            })
            .unwrap()
    }

    fn submit_empty(backend: &HeadlessBackend, fence: vk::Fence) -> vk::CommandBuffer {
        let cmd = backend.allocate_command_buffer().unwrap();
        backend.begin_commands(cmd).unwrap();
        backend.end_commands(cmd).unwrap();
        backend
            .submit(&Submission::frame(
                cmd,
                vk::Semaphore::null(),
                vk::Semaphore::null(),
                fence,
            ))
            .unwrap();
        cmd
    }

    #[test]
    fn test_fence_wait_completes_in_fifo_order() {
        let backend = HeadlessBackend::default();
        let first = backend.create_fence(false).unwrap();
        let second = backend.create_fence(false).unwrap();
        submit_empty(&backend, first);
        submit_empty(&backend, second);
        assert_eq!(backend.in_flight(), 2);

        backend.wait_for_fence(first, WAIT_FOREVER).unwrap();
        assert_eq!(backend.in_flight(), 1);
        assert!(backend.fence_status(first).unwrap());
        assert!(!backend.fence_status(second).unwrap());

        let waits = backend.fence_waits();
        assert_eq!(
            waits,
            vec![FenceWait {
                fence: first,
                blocked: true,
                completed_through: 1
            }]
        );
        assert_eq!(backend.stats().max_in_flight, 2);
    }

    #[test]
    fn test_waiting_on_orphan_fence_times_out() {
        let backend = HeadlessBackend::default();
        let fence = backend.create_fence(false).unwrap();
        assert!(matches!(
            backend.wait_for_fence(fence, WAIT_FOREVER),
            Err(RhiError::VulkanError(vk::Result::TIMEOUT))
        ));
    }

    #[test]
    fn test_submit_rejects_signaled_fence() {
        let backend = HeadlessBackend::default();
        let fence = backend.create_fence(true).unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();
        backend.begin_commands(cmd).unwrap();
        backend.end_commands(cmd).unwrap();
        let result = backend.submit(&Submission::frame(
            cmd,
            vk::Semaphore::null(),
            vk::Semaphore::null(),
            fence,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_pending_command_buffer_cannot_be_reset() {
        let backend = HeadlessBackend::default();
        let fence = backend.create_fence(false).unwrap();
        let cmd = submit_empty(&backend, fence);
        assert!(backend.begin_commands(cmd).is_err());
        assert!(backend.reset_fence(fence).is_err());
        backend.wait_for_fence(fence, WAIT_FOREVER).unwrap();
        assert!(backend.begin_commands(cmd).is_ok());
    }

    #[test]
    fn test_acquire_round_robin_and_script() {
        let backend = HeadlessBackend::default();
        let chain = swapchain(&backend);
        let semaphore = backend.create_semaphore().unwrap();
        let indices: Vec<u32> = (0..4)
            .map(|_| backend.acquire_next_image(chain.swapchain, semaphore).unwrap().0)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);

        backend.script_acquire_order([2, 2]);
        assert_eq!(
            backend.acquire_next_image(chain.swapchain, semaphore),
            Ok((2, false))
        );
        assert_eq!(
            backend.acquire_next_image(chain.swapchain, semaphore),
            Ok((2, false))
        );
    }

    #[test]
    fn test_invalidated_surface_until_recreated() {
        let backend = HeadlessBackend::default();
        let chain = swapchain(&backend);
        let semaphore = backend.create_semaphore().unwrap();
        backend.invalidate_surface();
        assert_eq!(
            backend.acquire_next_image(chain.swapchain, semaphore),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );

        let replacement = backend
            .create_swapchain(&SwapchainDesc {
                extent: chain.extent,
                present_mode: PresentModePreference::Fifo,
                preferred_image_count: None,
                old_swapchain: chain.swapchain,
            })
            .unwrap();
        assert_eq!(
            backend.acquire_next_image(chain.swapchain, semaphore),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );
        assert!(backend.acquire_next_image(replacement.swapchain, semaphore).is_ok());
        assert_eq!(backend.stats().swapchain_creations, 2);
    }

    #[test]
    fn test_zero_extent_swapchain_fails() {
        let backend = HeadlessBackend::default();
        let result = backend.create_swapchain(&SwapchainDesc {
            extent: vk::Extent2D {
                width: 0,
                height: 480,
            },
            present_mode: PresentModePreference::Fifo,
            preferred_image_count: None,
            old_swapchain: vk::SwapchainKHR::null(),
        });
        assert!(matches!(result, Err(RhiError::SwapchainError(_))));
    }

    #[test]
    fn test_descriptor_pool_limits() {
        let backend = HeadlessBackend::default();
        let layout = backend
            .create_binding_layout(&[BindingLayoutEntry::uniform_buffer(
                vk::ShaderStageFlags::VERTEX,
            )])
            .unwrap();
        let pool = backend
            .create_descriptor_pool(2, &[(BindingKind::UniformBuffer, 2)])
            .unwrap();

        let a = backend.allocate_descriptor_set(pool, layout).unwrap();
        let _b = backend.allocate_descriptor_set(pool, layout).unwrap();
        assert!(matches!(
            backend.allocate_descriptor_set(pool, layout),
            Err(RhiError::OutOfPoolMemory)
        ));

        backend.free_descriptor_sets(pool, &[a]).unwrap();
        assert!(backend.allocate_descriptor_set(pool, layout).is_ok());

        backend.fail_descriptor_allocations(1);
        assert!(matches!(
            backend.allocate_descriptor_set(pool, layout),
            Err(RhiError::OutOfPoolMemory)
        ));

        backend.destroy_descriptor_pool(pool);
        assert_eq!(backend.stats().live_descriptor_sets, 0);
    }

    #[test]
    fn test_failed_free_keeps_sets_allocated() {
        let backend = HeadlessBackend::default();
        let layout = backend
            .create_binding_layout(&[BindingLayoutEntry::uniform_buffer(
                vk::ShaderStageFlags::VERTEX,
            )])
            .unwrap();
        let pool = backend
            .create_descriptor_pool(1, &[(BindingKind::UniformBuffer, 1)])
            .unwrap();
        let set = backend.allocate_descriptor_set(pool, layout).unwrap();

        backend.fail_descriptor_frees(1);
        assert!(matches!(
            backend.free_descriptor_sets(pool, &[set]),
            Err(RhiError::VulkanError(_))
        ));
        assert!(backend.is_descriptor_set_alive(set));

        backend.free_descriptor_sets(pool, &[set]).unwrap();
        assert!(!backend.is_descriptor_set_alive(set));
    }

    #[test]
    fn test_pipeline_must_name_the_pass_depth_format() {
        let backend = HeadlessBackend::default();
        let set_layout = backend
            .create_binding_layout(&[BindingLayoutEntry::uniform_buffer(
                vk::ShaderStageFlags::VERTEX,
            )])
            .unwrap();
        let code: Vec<u8> = [crate::shader::SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect();
        let vertex_layout = crate::vertex::ColorVertex::layout();
        let overlay = crate::pipeline::PipelineConfig::overlay();
        let desc = |depth_format: Option<vk::Format>| PipelineDesc {
            vertex_spirv: &code,
            fragment_spirv: &code,
            vertex_layout: &vertex_layout,
            set_layout,
            config: &overlay,
            color_format: vk::Format::B8G8R8A8_SRGB,
            depth_format,
        };

        // Without a depth target any attachment format is accepted.
        assert!(backend.create_pipeline(&desc(None)).is_ok());

        let depth = backend
            .create_depth_target(vk::Extent2D {
                width: 640,
                height: 480,
            })
            .unwrap();
        assert!(matches!(
            backend.create_pipeline(&desc(None)),
            Err(RhiError::PipelineError(_))
        ));
        assert!(
            backend
                .create_pipeline(&desc(Some(HEADLESS_DEPTH_FORMAT)))
                .is_ok()
        );
        backend.destroy_depth_target(depth);
    }

    #[test]
    fn test_buffer_bounds() {
        let backend = HeadlessBackend::default();
        let buffer = backend.create_buffer(BufferUsage::Uniform, 8).unwrap();
        backend.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.read_buffer(buffer, 4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(backend.write_buffer(buffer, 6, &[0; 4]).is_err());
        backend.destroy_buffer(buffer);
        assert!(!backend.is_buffer_alive(buffer));
    }

    #[test]
    fn test_recorded_commands_are_kept_per_submission() {
        let backend = HeadlessBackend::default();
        let fence = backend.create_fence(false).unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();
        backend.begin_commands(cmd).unwrap();
        backend.record(
            cmd,
            &RenderCommand::Draw {
                vertex_count: 3,
                instance_count: 1,
                first_vertex: 0,
                first_instance: 0,
            },
        );
        backend.end_commands(cmd).unwrap();
        backend
            .submit(&Submission::frame(
                cmd,
                vk::Semaphore::null(),
                vk::Semaphore::null(),
                fence,
            ))
            .unwrap();

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].serial, 1);
        assert_eq!(submissions[0].commands.len(), 1);
    }
}
