//! Recorded commands and queue submissions.
//!
//! Frame recording is expressed as a stream of [`RenderCommand`] values that a
//! backend translates one by one, in call order, into its command buffer. The
//! Vulkan backend maps each variant onto `cmd_*` calls; the headless backend
//! stores them so tests can inspect the exact stream a frame produced.

use ash::vk;

use crate::backend::DepthTarget;

/// Attachments a frame renders into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTarget {
    /// Swapchain image being rendered.
    pub color_image: vk::Image,
    /// View of `color_image`.
    pub color_view: vk::ImageView,
    /// Shared depth attachment.
    pub depth: Option<DepthTarget>,
    /// Render area.
    pub extent: vk::Extent2D,
}

/// Clear values applied when a render pass begins.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearValues {
    /// RGBA clear color.
    pub color: [f32; 4],
    /// Depth clear value.
    pub depth: f32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.1, 0.1, 0.15, 1.0],
            depth: 1.0,
        }
    }
}

/// One recorded operation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RenderCommand {
    /// Transition the target to attachment layouts and begin dynamic rendering.
    BeginRendering {
        /// Attachments.
        target: RenderTarget,
        /// Clear values.
        clear: ClearValues,
    },
    /// End dynamic rendering and transition the color image for presentation.
    EndRendering {
        /// The image to hand to the presentation engine.
        color_image: vk::Image,
    },
    /// Bind a graphics pipeline.
    BindPipeline {
        /// Pipeline handle.
        pipeline: vk::Pipeline,
    },
    /// Bind a descriptor set at set 0.
    BindDescriptorSet {
        /// Layout of the bound pipeline.
        layout: vk::PipelineLayout,
        /// Descriptor set.
        set: vk::DescriptorSet,
    },
    /// Bind a vertex buffer at binding 0.
    BindVertexBuffer {
        /// Buffer handle.
        buffer: vk::Buffer,
        /// Byte offset.
        offset: vk::DeviceSize,
    },
    /// Bind an index buffer.
    BindIndexBuffer {
        /// Buffer handle.
        buffer: vk::Buffer,
        /// Byte offset.
        offset: vk::DeviceSize,
        /// Index width.
        index_type: vk::IndexType,
    },
    /// Set a full-target viewport and scissor.
    SetViewport {
        /// Target size.
        extent: vk::Extent2D,
    },
    /// Non-indexed draw.
    Draw {
        /// Vertices per instance.
        vertex_count: u32,
        /// Instance count.
        instance_count: u32,
        /// First vertex.
        first_vertex: u32,
        /// First instance.
        first_instance: u32,
    },
    /// Indexed draw.
    DrawIndexed {
        /// Indices per instance.
        index_count: u32,
        /// Instance count.
        instance_count: u32,
        /// First index.
        first_index: u32,
        /// Value added to each index.
        vertex_offset: i32,
        /// First instance.
        first_instance: u32,
    },
}

/// One command buffer submission with its semaphore pair and fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Submission {
    /// The recorded command buffer.
    pub command_buffer: vk::CommandBuffer,
    /// Semaphore signaled by image acquisition.
    pub wait_semaphore: vk::Semaphore,
    /// Stage that waits on `wait_semaphore`.
    pub wait_stage: vk::PipelineStageFlags,
    /// Semaphore the presentation waits on.
    pub signal_semaphore: vk::Semaphore,
    /// Fence signaled when the GPU finishes this submission.
    pub fence: vk::Fence,
}

impl Submission {
    /// A frame submission waiting at color attachment output.
    pub fn frame(
        command_buffer: vk::CommandBuffer,
        image_available: vk::Semaphore,
        render_finished: vk::Semaphore,
        fence: vk::Fence,
    ) -> Self {
        Self {
            command_buffer,
            wait_semaphore: image_available,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: render_finished,
            fence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_submission_waits_at_color_output() {
        let submission = Submission::frame(
            vk::CommandBuffer::null(),
            vk::Semaphore::null(),
            vk::Semaphore::null(),
            vk::Fence::null(),
        );
        assert_eq!(
            submission.wait_stage,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
    }

    #[test]
    fn test_default_clear_values() {
        let clear = ClearValues::default();
        assert_eq!(clear.depth, 1.0);
        assert_eq!(clear.color[3], 1.0);
    }
}
