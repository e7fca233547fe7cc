//! Frame slots and the frame clock.
//!
//! This module provides the per-slot CPU resources of the "frames in flight"
//! pattern and the bookkeeping that tells the rest of the renderer which
//! frames the GPU has already finished.
//!
//! # Overview
//!
//! A fixed number of [`FrameSlot`]s rotate `0, 1, .., N-1, 0, ..`
//! independently of the swap image count:
//!
//! 1. While the GPU renders frame k, the CPU records frame k+1
//! 2. Each slot owns its command buffer, fence and acquire semaphore
//! 3. Before slot reuse, its fence proves frame k-N has retired
//!
//! # Synchronization Flow
//!
//! ```text
//! 1. Wait on in_flight (CPU waits for the previous use of this slot)
//! 2. Acquire a swap image (signals image_available)
//! 3. Record commands into command_buffer
//! 4. Submit:
//!    - wait image_available
//!    - signal the swap image's render_finished semaphore
//!    - signal in_flight
//! 5. Present (waits on render_finished)
//! ```
//!
//! Frames are numbered from 1. The [`FrameClock`] tracks the newest
//! submitted and the newest retired frame number; every retirement proof
//! comes from a fence wait, and because all frames go through one queue a
//! fence for frame k also proves every frame before k.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, trace};

use vkframe_rhi::RhiResult;
use vkframe_rhi::backend::{GpuBackend, WAIT_FOREVER};
use vkframe_rhi::sync::{Fence, Semaphore};

/// Frame numbers handed out, submitted and known retired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameClock {
    next: u64,
    submitted: u64,
    completed: u64,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClock {
    /// A clock with no frames yet.
    pub const fn new() -> Self {
        Self {
            next: 1,
            submitted: 0,
            completed: 0,
        }
    }

    /// Hands out the next frame number.
    pub fn begin(&mut self) -> u64 {
        let frame = self.next;
        self.next += 1;
        frame
    }

    /// Records that `frame` was submitted.
    pub fn record_submit(&mut self, frame: u64) {
        self.submitted = self.submitted.max(frame);
    }

    /// Records that `frame` and every earlier frame retired.
    pub fn retire(&mut self, frame: u64) {
        self.completed = self.completed.max(frame.min(self.submitted));
    }

    /// Records that every submitted frame retired, as after a device drain.
    pub fn retire_all(&mut self) {
        self.completed = self.submitted;
    }

    /// Newest submitted frame number, 0 before the first submit.
    #[inline]
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Newest frame number known to have retired on the GPU.
    #[inline]
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Whether `frame` is known to have retired.
    #[inline]
    pub fn is_retired(&self, frame: u64) -> bool {
        frame <= self.completed
    }

    /// Submitted frames not yet known retired.
    #[inline]
    pub fn in_flight(&self) -> u64 {
        self.submitted - self.completed
    }
}

/// Per-slot rendering data.
pub struct FrameSlot<B: GpuBackend> {
    index: usize,
    command_buffer: vk::CommandBuffer,
    /// Created signaled so the first wait doesn't block forever.
    in_flight: Fence<B>,
    image_available: Semaphore<B>,
    last_submitted: Option<u64>,
}

impl<B: GpuBackend> FrameSlot<B> {
    fn new(backend: &Arc<B>, index: usize) -> RhiResult<Self> {
        let command_buffer = backend.allocate_command_buffer()?;
        let in_flight = Fence::new(backend.clone(), true)?;
        let image_available = Semaphore::new(backend.clone())?;
        debug!("Created frame slot {}", index);
        Ok(Self {
            index,
            command_buffer,
            in_flight,
            image_available,
            last_submitted: None,
        })
    }

    /// Position of this slot in the rotation.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    #[inline]
    pub fn fence(&self) -> &Fence<B> {
        &self.in_flight
    }

    #[inline]
    pub fn image_available(&self) -> &Semaphore<B> {
        &self.image_available
    }

    /// Frame number of this slot's newest submission.
    #[inline]
    pub fn last_submitted(&self) -> Option<u64> {
        self.last_submitted
    }

    /// Blocks until this slot's previous submission has retired.
    ///
    /// This is the backpressure point that keeps the CPU at most N frames
    /// ahead of the GPU.
    pub fn wait_retired(&self, clock: &mut FrameClock) -> RhiResult<()> {
        self.in_flight.wait(WAIT_FOREVER)?;
        if let Some(frame) = self.last_submitted {
            clock.retire(frame);
            trace!("Frame slot {} retired frame {}", self.index, frame);
        }
        Ok(())
    }

    /// Arms the fence for a new submission of `frame`.
    pub(crate) fn prepare_submit(&mut self, frame: u64) -> RhiResult<()> {
        self.in_flight.reset()?;
        self.last_submitted = Some(frame);
        Ok(())
    }
}

/// Owns the rotating frame slots and the frame clock.
///
/// The manager is not thread-safe; it is driven from the render thread.
pub struct FrameManager<B: GpuBackend> {
    slots: Vec<FrameSlot<B>>,
    current: usize,
    clock: FrameClock,
}

impl<B: GpuBackend> FrameManager<B> {
    /// Creates `frames_in_flight` slots (at least one).
    pub fn new(backend: &Arc<B>, frames_in_flight: usize) -> RhiResult<Self> {
        let count = frames_in_flight.max(1);
        let slots = (0..count)
            .map(|index| FrameSlot::new(backend, index))
            .collect::<RhiResult<Vec<_>>>()?;
        info!("Frame manager created with {} frames in flight", count);
        Ok(Self {
            slots,
            current: 0,
            clock: FrameClock::new(),
        })
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn current_index(&self) -> usize {
        self.current
    }

    #[inline]
    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    #[inline]
    pub fn clock_mut(&mut self) -> &mut FrameClock {
        &mut self.clock
    }

    /// The current slot together with the clock it reports into.
    pub fn current_mut(&mut self) -> (&mut FrameSlot<B>, &mut FrameClock) {
        (&mut self.slots[self.current], &mut self.clock)
    }

    /// Moves to the next slot in rotation.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Waits on every slot, retiring everything submitted.
    pub fn wait_all(&mut self) -> RhiResult<()> {
        for slot in &self.slots {
            slot.wait_retired(&mut self.clock)?;
        }
        Ok(())
    }
}
