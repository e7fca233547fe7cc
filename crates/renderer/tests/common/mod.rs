//! Shared fixtures for the renderer integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ash::vk;
use glam::{Vec2, Vec3};

use vkframe_renderer::{
    BindingSetId, BindingWrite, FrameStatus, Geometry, ObjectHandle, PipelineHandle, Renderer,
    RendererConfig,
};
use vkframe_rhi::binding::{BindingLayout, BindingLayoutEntry};
use vkframe_rhi::buffer::{BufferUsage, GpuBuffer};
use vkframe_rhi::headless::{HeadlessBackend, HeadlessConfig};
use vkframe_rhi::pipeline::PipelineConfig;
use vkframe_rhi::shader::SPIRV_MAGIC;
use vkframe_rhi::vertex::ColorVertex;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;

pub fn extent() -> vk::Extent2D {
    vk::Extent2D {
        width: WIDTH,
        height: HEIGHT,
    }
}

pub fn backend(image_count: u32) -> Arc<HeadlessBackend> {
    Arc::new(HeadlessBackend::new(HeadlessConfig {
        image_count,
        ..Default::default()
    }))
}

pub fn renderer_with(
    backend: &Arc<HeadlessBackend>,
    config: RendererConfig,
) -> Renderer<HeadlessBackend> {
    Renderer::new(backend.clone(), extent(), config).unwrap()
}

pub fn renderer(backend: &Arc<HeadlessBackend>) -> Renderer<HeadlessBackend> {
    renderer_with(backend, RendererConfig::default())
}

/// A minimal module that passes SPIR-V validation.
pub fn spirv() -> Vec<u8> {
    [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}

/// One vertex-stage uniform block.
pub fn transform_layout() -> BindingLayout {
    BindingLayout::default().with(BindingLayoutEntry::uniform_buffer(
        vk::ShaderStageFlags::VERTEX,
    ))
}

pub fn transform_set(renderer: &mut Renderer<HeadlessBackend>) -> BindingSetId {
    renderer
        .get_binding_set(&transform_layout(), vec![BindingWrite::uniform(64)])
        .unwrap()
}

pub fn pipeline(renderer: &mut Renderer<HeadlessBackend>) -> PipelineHandle {
    let code = spirv();
    renderer
        .make_pipeline(
            &code,
            &code,
            &ColorVertex::layout(),
            &transform_layout(),
            &PipelineConfig::default(),
        )
        .unwrap()
}

/// A triangle uploaded to a vertex buffer the test keeps alive.
pub fn triangle(backend: &Arc<HeadlessBackend>) -> (GpuBuffer<HeadlessBackend>, Geometry) {
    let vertices = [
        ColorVertex::new(Vec2::new(0.0, -0.5), Vec3::X),
        ColorVertex::new(Vec2::new(0.5, 0.5), Vec3::Y),
        ColorVertex::new(Vec2::new(-0.5, 0.5), Vec3::Z),
    ];
    let buffer = GpuBuffer::with_data(
        backend.clone(),
        BufferUsage::Vertex,
        bytemuck::cast_slice(&vertices),
    )
    .unwrap();
    let geometry = Geometry::vertices(buffer.handle(), 3);
    (buffer, geometry)
}

/// Adds an object drawing `geometry` with a fresh transform set; the
/// caller's own reference to the set is released.
pub fn add_object(
    renderer: &mut Renderer<HeadlessBackend>,
    pipeline: PipelineHandle,
    geometry: Geometry,
) -> (ObjectHandle, BindingSetId) {
    let set = transform_set(renderer);
    let object = renderer.add_object(pipeline, geometry, set).unwrap();
    renderer.release_binding_set(set).unwrap();
    (object, set)
}

/// Records an empty pass and ends the frame.
pub fn run_frame(renderer: &mut Renderer<HeadlessBackend>) -> Option<FrameStatus> {
    let frame = renderer.begin_frame().unwrap()?;
    Some(frame.end().unwrap())
}

/// Draws every object and ends the frame.
pub fn draw_frame(renderer: &mut Renderer<HeadlessBackend>) -> FrameStatus {
    let mut frame = renderer.begin_frame().unwrap().unwrap();
    frame.begin_rendering().unwrap();
    frame.draw_objects().unwrap();
    frame.end_rendering().unwrap();
    frame.end().unwrap()
}
