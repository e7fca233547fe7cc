//! Command pool and translation of [`RenderCommand`] into `cmd_*` calls.

use ash::vk;

use crate::command::{RenderCommand, RenderTarget, Submission};
use crate::error::{RhiError, RhiResult};

/// Creates a pool whose buffers are reset individually.
pub fn create_command_pool(device: &ash::Device, queue_family: u32) -> RhiResult<vk::CommandPool> {
    let create_info = vk::CommandPoolCreateInfo::default()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(queue_family);
    Ok(unsafe { device.create_command_pool(&create_info, None)? })
}

/// Allocates one primary command buffer.
pub fn allocate_command_buffer(
    device: &ash::Device,
    pool: vk::CommandPool,
) -> RhiResult<vk::CommandBuffer> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
    buffers
        .into_iter()
        .next()
        .ok_or_else(|| RhiError::InvalidHandle("driver returned no command buffer".to_string()))
}

/// Resets `cmd` and begins one-time-submit recording.
pub fn begin(device: &ash::Device, cmd: vk::CommandBuffer) -> RhiResult<()> {
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe {
        device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
        device.begin_command_buffer(cmd, &begin_info)?;
    }
    Ok(())
}

/// Submits one command buffer with its semaphore pair and fence.
pub fn submit(device: &ash::Device, queue: vk::Queue, submission: &Submission) -> RhiResult<()> {
    let command_buffers = [submission.command_buffer];
    let wait_semaphores = [submission.wait_semaphore];
    let wait_stages = [submission.wait_stage];
    let signal_semaphores = [submission.signal_semaphore];

    let mut submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
    if submission.wait_semaphore != vk::Semaphore::null() {
        submit_info = submit_info
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);
    }
    if submission.signal_semaphore != vk::Semaphore::null() {
        submit_info = submit_info.signal_semaphores(&signal_semaphores);
    }

    unsafe { device.queue_submit(queue, &[submit_info], submission.fence)? };
    Ok(())
}

/// Records one command.
pub fn record(device: &ash::Device, cmd: vk::CommandBuffer, command: &RenderCommand) {
    unsafe {
        match *command {
            RenderCommand::BeginRendering { target, clear } => {
                begin_rendering(device, cmd, &target, clear.color, clear.depth);
            }
            RenderCommand::EndRendering { color_image } => {
                device.cmd_end_rendering(cmd);
                transition(
                    device,
                    cmd,
                    color_image,
                    vk::ImageAspectFlags::COLOR,
                    Transition::ColorToPresent,
                );
            }
            RenderCommand::BindPipeline { pipeline } => {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            }
            RenderCommand::BindDescriptorSet { layout, set } => {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    0,
                    &[set],
                    &[],
                );
            }
            RenderCommand::BindVertexBuffer { buffer, offset } => {
                device.cmd_bind_vertex_buffers(cmd, 0, &[buffer], &[offset]);
            }
            RenderCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => {
                device.cmd_bind_index_buffer(cmd, buffer, offset, index_type);
            }
            RenderCommand::SetViewport { extent } => {
                let viewport = vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                device.cmd_set_viewport(cmd, 0, &[viewport]);
                device.cmd_set_scissor(cmd, 0, &[extent.into()]);
            }
            RenderCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                device.cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance);
            }
            RenderCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => {
                device.cmd_draw_indexed(
                    cmd,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                );
            }
        }
    }
}

unsafe fn begin_rendering(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    target: &RenderTarget,
    clear_color: [f32; 4],
    clear_depth: f32,
) {
    unsafe {
        transition(
            device,
            cmd,
            target.color_image,
            vk::ImageAspectFlags::COLOR,
            Transition::UndefinedToColor,
        );
        if let Some(depth) = target.depth {
            transition(
                device,
                cmd,
                depth.image,
                vk::ImageAspectFlags::DEPTH,
                Transition::UndefinedToDepth,
            );
        }

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(target.color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            });
        let depth_attachment = target.depth.map(|depth| {
            vk::RenderingAttachmentInfo::default()
                .image_view(depth.view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: clear_depth,
                        stencil: 0,
                    },
                })
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(target.extent.into())
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));
        if let Some(depth_attachment) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }
        device.cmd_begin_rendering(cmd, &rendering_info);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Transition {
    UndefinedToColor,
    UndefinedToDepth,
    ColorToPresent,
}

impl Transition {
    fn layouts(self) -> (vk::ImageLayout, vk::ImageLayout) {
        match self {
            Transition::UndefinedToColor => (
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ),
            Transition::UndefinedToDepth => (
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            ),
            Transition::ColorToPresent => (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
        }
    }

    /// `(src_stage, src_access, dst_stage, dst_access)`.
    fn masks(
        self,
    ) -> (
        vk::PipelineStageFlags,
        vk::AccessFlags,
        vk::PipelineStageFlags,
        vk::AccessFlags,
    ) {
        match self {
            // Waits on the acquire semaphore, which is signaled at this stage.
            Transition::UndefinedToColor => (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
            // The depth target is shared by frames in flight.
            Transition::UndefinedToDepth => (
                vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            ),
            Transition::ColorToPresent => (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
            ),
        }
    }
}

unsafe fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    transition: Transition,
) {
    let (old_layout, new_layout) = transition.layouts();
    let (src_stage, src_access, dst_stage, dst_access) = transition.masks();
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect_mask)
                .level_count(1)
                .layer_count(1),
        )
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}
