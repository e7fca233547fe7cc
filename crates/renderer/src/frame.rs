//! The per-frame recording context.
//!
//! A [`Frame`] exists between [`Renderer::begin_frame`] and [`Frame::end`].
//! It mutably borrows the renderer, so nothing else can touch pipelines,
//! objects or binding sets while commands are being recorded. Uniform writes
//! go to the duplicate owned by the frame's swap image, which the acquire
//! already proved is no longer read by the GPU.
//!
//! # Example
//!
//! ```no_run
//! use vkframe_renderer::{BindingSetId, ObjectHandle, Renderer};
//! use vkframe_rhi::backend::GpuBackend;
//!
//! # fn example<B: GpuBackend>(
//! #     renderer: &mut Renderer<B>,
//! #     set: BindingSetId,
//! # ) -> vkframe_rhi::RhiResult<()> {
//! if let Some(mut frame) = renderer.begin_frame()? {
//!     frame.write_uniform_pod(set, 0, &[0.0f32; 16])?;
//!     frame.begin_rendering()?;
//!     frame.draw_objects()?;
//!     frame.end_rendering()?;
//!     let status = frame.end()?;
//!     if status.updated {
//!         // rebuild anything sized to the swap images
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use ash::vk;
use bytemuck::Pod;
use tracing::{error, trace, warn};

use vkframe_rhi::backend::GpuBackend;
use vkframe_rhi::command::{ClearValues, RenderCommand};
use vkframe_rhi::{RhiError, RhiResult};

use crate::binding_set::BindingSetId;
use crate::renderer::{Geometry, ObjectHandle, PipelineHandle, Renderer};
use crate::swap_chain::{AcquiredImage, PresentStatus};

/// What happened to an ended frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameStatus {
    pub frame_number: u64,
    pub image_index: u32,
    pub present: PresentStatus,
    /// The swap chain was recreated while acquiring this frame's image.
    pub updated: bool,
}

/// One frame's recording; see the module docs.
pub struct Frame<'r, B: GpuBackend> {
    renderer: &'r mut Renderer<B>,
    acquired: AcquiredImage,
    frame_number: u64,
    command_buffer: vk::CommandBuffer,
    rendering: bool,
    rendered: bool,
    bound_pipeline: Option<PipelineHandle>,
    finished: bool,
}

impl<'r, B: GpuBackend> Frame<'r, B> {
    pub(crate) fn new(
        renderer: &'r mut Renderer<B>,
        acquired: AcquiredImage,
        frame_number: u64,
        command_buffer: vk::CommandBuffer,
    ) -> Self {
        trace!(
            "Frame {} begins on image {}",
            frame_number, acquired.index
        );
        Self {
            renderer,
            acquired,
            frame_number,
            command_buffer,
            rendering: false,
            rendered: false,
            bound_pipeline: None,
            finished: false,
        }
    }

    /// Whether the swap chain was recreated while acquiring this frame.
    ///
    /// True for exactly one frame per recreation.
    #[inline]
    pub fn updated(&self) -> bool {
        self.acquired.recreated
    }

    #[inline]
    pub fn image_index(&self) -> u32 {
        self.acquired.index
    }

    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.renderer.swap_chain.extent()
    }

    fn record(&self, command: RenderCommand) {
        self.renderer.backend.record(self.command_buffer, &command);
    }

    /// Opens the frame's render pass with the configured clear color.
    pub fn begin_rendering(&mut self) -> RhiResult<()> {
        let clear = ClearValues {
            color: self.renderer.config.clear_color,
            ..ClearValues::default()
        };
        self.begin_rendering_with(clear)
    }

    /// Opens the frame's render pass. A frame has at most one.
    pub fn begin_rendering_with(&mut self, clear: ClearValues) -> RhiResult<()> {
        if self.rendered {
            return Err(RhiError::InvalidState(
                "render pass already opened this frame".to_string(),
            ));
        }
        let target = self.renderer.swap_chain.render_target(self.acquired.index)?;
        self.record(RenderCommand::BeginRendering { target, clear });
        self.record(RenderCommand::SetViewport {
            extent: target.extent,
        });
        self.rendering = true;
        self.rendered = true;
        Ok(())
    }

    /// Closes the render pass and readies the image for presentation.
    pub fn end_rendering(&mut self) -> RhiResult<()> {
        if !self.rendering {
            return Err(RhiError::InvalidState(
                "no render pass is open".to_string(),
            ));
        }
        let target = self.renderer.swap_chain.render_target(self.acquired.index)?;
        self.record(RenderCommand::EndRendering {
            color_image: target.color_image,
        });
        self.rendering = false;
        Ok(())
    }

    pub fn bind_pipeline(&mut self, handle: PipelineHandle) -> RhiResult<()> {
        let pipeline = self.renderer.pipeline(handle)?.objects.pipeline;
        self.record(RenderCommand::BindPipeline { pipeline });
        self.bound_pipeline = Some(handle);
        Ok(())
    }

    /// Binds the set's descriptor set for this frame's image and records
    /// this frame as the set's last use.
    pub fn bind_binding_set(&mut self, id: BindingSetId) -> RhiResult<()> {
        let handle = self.bound_pipeline.ok_or_else(|| {
            RhiError::InvalidState("bind a pipeline before its binding set".to_string())
        })?;
        let pipeline = self.renderer.pipeline(handle)?;
        let set = self
            .renderer
            .pool
            .get(id)
            .ok_or_else(|| RhiError::InvalidHandle(format!("stale binding set {id:?}")))?;
        if set.layout() != &pipeline.binding_layout {
            return Err(RhiError::LayoutMismatch(format!(
                "binding set {id:?} does not match the layout of {handle:?}"
            )));
        }
        let descriptor_set = set.descriptor_set(self.acquired.index).ok_or_else(|| {
            RhiError::InvalidHandle(format!(
                "binding set {id:?} has no descriptor set for image {}",
                self.acquired.index
            ))
        })?;
        let layout = pipeline.objects.layout;

        self.record(RenderCommand::BindDescriptorSet {
            layout,
            set: descriptor_set,
        });
        self.renderer.pool.mark_used(id, self.frame_number)
    }

    pub fn bind_geometry(&mut self, geometry: &Geometry) {
        self.record(RenderCommand::BindVertexBuffer {
            buffer: geometry.vertex_buffer,
            offset: 0,
        });
        if let Some(indices) = geometry.indices {
            self.record(RenderCommand::BindIndexBuffer {
                buffer: indices.buffer,
                offset: 0,
                index_type: indices.index_type,
            });
        }
    }

    fn require_rendering(&self) -> RhiResult<()> {
        if self.rendering {
            Ok(())
        } else {
            Err(RhiError::InvalidState(
                "draw recorded outside a render pass".to_string(),
            ))
        }
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> RhiResult<()> {
        self.require_rendering()?;
        self.record(RenderCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        });
        Ok(())
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> RhiResult<()> {
        self.require_rendering()?;
        self.record(RenderCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        });
        Ok(())
    }

    /// Binds everything `handle` needs and draws it once.
    pub fn draw_object(&mut self, handle: ObjectHandle) -> RhiResult<()> {
        let object = *self
            .renderer
            .object(handle)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown object {handle:?}")))?;
        if self.bound_pipeline != Some(object.pipeline) {
            self.bind_pipeline(object.pipeline)?;
        }
        self.bind_binding_set(object.binding_set)?;
        self.bind_geometry(&object.geometry);
        match object.geometry.indices {
            Some(indices) => self.draw_indexed(indices.count, 1),
            None => self.draw(object.geometry.vertex_count, 1),
        }
    }

    /// Draws every object in insertion order; returns how many.
    pub fn draw_objects(&mut self) -> RhiResult<usize> {
        let handles = self.renderer.objects.keys();
        for &handle in &handles {
            self.draw_object(handle)?;
        }
        Ok(handles.len())
    }

    /// Writes into the uniform duplicate of this frame's swap image.
    pub fn write_uniform(
        &mut self,
        id: BindingSetId,
        binding: u32,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> RhiResult<()> {
        self.renderer
            .pool
            .write_uniform(id, binding, self.acquired.index, offset, bytes)
    }

    pub fn write_uniform_pod<T: Pod>(
        &mut self,
        id: BindingSetId,
        binding: u32,
        value: &T,
    ) -> RhiResult<()> {
        self.write_uniform(id, binding, 0, bytemuck::bytes_of(value))
    }

    /// Reads back the uniform duplicate of this frame's swap image.
    pub fn read_uniform(
        &self,
        id: BindingSetId,
        binding: u32,
        offset: vk::DeviceSize,
        len: usize,
    ) -> RhiResult<Vec<u8>> {
        self.renderer
            .pool
            .read_uniform(id, binding, self.acquired.index, offset, len)
    }

    /// Submits the recorded commands and presents the image.
    pub fn end(mut self) -> RhiResult<FrameStatus> {
        self.finished = true;
        self.finish()
    }

    fn finish(&mut self) -> RhiResult<FrameStatus> {
        if !self.rendered {
            // The image still needs its layout transition for presentation.
            self.begin_rendering()?;
        }
        if self.rendering {
            self.end_rendering()?;
        }
        self.renderer.backend.end_commands(self.command_buffer)?;

        let renderer = &mut *self.renderer;
        let (slot, clock) = renderer.frames.current_mut();
        let present = renderer
            .swap_chain
            .submit(slot, self.acquired.index, self.frame_number)?;
        clock.record_submit(self.frame_number);
        renderer.frames.advance();

        Ok(FrameStatus {
            frame_number: self.frame_number,
            image_index: self.acquired.index,
            present,
            updated: self.acquired.recreated,
        })
    }
}

impl<B: GpuBackend> Drop for Frame<'_, B> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        warn!(
            "Frame {} dropped without end(); submitting it anyway",
            self.frame_number
        );
        if let Err(err) = self.finish() {
            error!("Failed to submit dropped frame {}: {}", self.frame_number, err);
        }
    }
}
