//! The demo scene: a ring of quads whose transforms change every frame.
//!
//! Objects are retired and spawned on a fixed cadence so the binding pool
//! keeps growing past its reservation and reclaiming released sets.

use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::time::Duration;

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec2, Vec3};
use tracing::{debug, info};

use vkframe_core::{FrameCounter, Timer};
use vkframe_renderer::{
    BindingSetId, BindingWrite, FrameStatus, Geometry, ObjectHandle, PipelineHandle, Renderer,
};
use vkframe_rhi::backend::GpuBackend;
use vkframe_rhi::binding::{BindingLayout, BindingLayoutEntry};
use vkframe_rhi::buffer::{BufferUsage, GpuBuffer};
use vkframe_rhi::pipeline::PipelineConfig;
use vkframe_rhi::vertex::ColorVertex;

/// Objects spawned up front; the pool reserves room for this many.
const INITIAL_OBJECTS: usize = 8;
/// The ring stops growing here and churns one-for-one.
const MAX_OBJECTS: usize = 48;
/// Frames between churn steps.
const CHURN_INTERVAL: u64 = 30;

/// Per-object uniform block at binding 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Transform {
    model_view_projection: Mat4,
}

impl Transform {
    const IDENTITY: Self = Self {
        model_view_projection: Mat4::IDENTITY,
    };
}

struct RingEntry {
    object: ObjectHandle,
    set: BindingSetId,
    spawned_at: u64,
}

/// Owns the renderer and everything the scene draws with.
pub struct Demo<B: GpuBackend> {
    // Dropped first: the renderer drains the device before the buffers go.
    renderer: Renderer<B>,
    layout: BindingLayout,
    pipeline: PipelineHandle,
    geometry: Geometry,
    _vertices: GpuBuffer<B>,
    _indices: GpuBuffer<B>,
    ring: VecDeque<RingEntry>,
    ticks: u64,
    timer: Timer,
    counter: FrameCounter,
}

impl<B: GpuBackend> Demo<B> {
    pub fn new(
        mut renderer: Renderer<B>,
        vertex_spirv: &[u8],
        fragment_spirv: &[u8],
    ) -> Result<Self> {
        let layout = BindingLayout::default().with(BindingLayoutEntry::uniform_buffer(
            vk::ShaderStageFlags::VERTEX,
        ));
        let pipeline = renderer
            .make_pipeline(
                vertex_spirv,
                fragment_spirv,
                &ColorVertex::layout(),
                &layout,
                &PipelineConfig::default(),
            )
            .context("creating the transform pipeline")?;
        renderer.reserve_binding_space(INITIAL_OBJECTS as u32, &layout)?;

        let vertices = [
            ColorVertex::new(Vec2::new(-0.5, -0.5), Vec3::new(1.0, 0.3, 0.2)),
            ColorVertex::new(Vec2::new(0.5, -0.5), Vec3::new(0.2, 1.0, 0.3)),
            ColorVertex::new(Vec2::new(0.5, 0.5), Vec3::new(0.2, 0.3, 1.0)),
            ColorVertex::new(Vec2::new(-0.5, 0.5), Vec3::new(1.0, 1.0, 0.3)),
        ];
        let indices: [u16; 6] = [0, 1, 2, 2, 3, 0];
        let backend = renderer.backend().clone();
        let vertex_buffer = GpuBuffer::with_data(
            backend.clone(),
            BufferUsage::Vertex,
            bytemuck::cast_slice(&vertices),
        )?;
        let index_buffer =
            GpuBuffer::with_data(backend, BufferUsage::Index, bytemuck::cast_slice(&indices))?;
        let geometry = Geometry::indexed(
            vertex_buffer.handle(),
            vertices.len() as u32,
            index_buffer.handle(),
            vk::IndexType::UINT16,
            indices.len() as u32,
        );

        let mut demo = Self {
            renderer,
            layout,
            pipeline,
            geometry,
            _vertices: vertex_buffer,
            _indices: index_buffer,
            ring: VecDeque::new(),
            ticks: 0,
            timer: Timer::new(),
            counter: FrameCounter::new(Duration::from_secs(1)),
        };
        for _ in 0..INITIAL_OBJECTS {
            demo.spawn()?;
        }
        info!("Demo scene ready with {} objects", demo.ring.len());
        Ok(demo)
    }

    pub fn renderer(&self) -> &Renderer<B> {
        &self.renderer
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.renderer.resize(width, height);
    }

    pub fn wait_idle(&mut self) -> Result<()> {
        Ok(self.renderer.wait_idle()?)
    }

    fn spawn(&mut self) -> Result<()> {
        let writes = vec![BindingWrite::uniform_pod(&Transform::IDENTITY)];
        let set = self.renderer.get_binding_set(&self.layout, writes)?;
        let object = self.renderer.add_object(self.pipeline, self.geometry, set)?;
        // The object holds the set from here on.
        self.renderer.release_binding_set(set)?;
        self.ring.push_back(RingEntry {
            object,
            set,
            spawned_at: self.ticks,
        });
        Ok(())
    }

    /// Retires the oldest object and spawns replacements.
    fn churn(&mut self) -> Result<()> {
        if let Some(oldest) = self.ring.pop_front() {
            self.renderer.remove_object(oldest.object)?;
        }
        let spawns = if self.ring.len() + 2 <= MAX_OBJECTS { 2 } else { 1 };
        for _ in 0..spawns {
            self.spawn()?;
        }
        debug!(
            "Churned objects: {} live, {} binding sets registered",
            self.ring.len(),
            self.renderer.binding_pool().live_sets()
        );
        Ok(())
    }

    /// Runs one frame; `None` while the drawable is zero-sized.
    pub fn tick(&mut self) -> Result<Option<FrameStatus>> {
        let delta = self.timer.tick();
        if let Some(report) = self.counter.record(delta) {
            info!(
                "{} frames, {:.1} fps, worst {:.2} ms",
                report.frames,
                report.fps,
                report.worst_frame.as_secs_f64() * 1000.0
            );
        }

        self.ticks += 1;
        if self.ticks % CHURN_INTERVAL == 0 {
            self.churn()?;
        }

        let elapsed = self.timer.elapsed_secs();
        let Some(mut frame) = self.renderer.begin_frame()? else {
            return Ok(None);
        };
        let extent = frame.extent();
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let count = self.ring.len();
        for (index, entry) in self.ring.iter().enumerate() {
            let age = self.ticks - entry.spawned_at;
            let transform = ring_transform(index, count, age, elapsed, aspect);
            frame.write_uniform_pod(entry.set, 0, &transform)?;
        }
        frame.begin_rendering()?;
        frame.draw_objects()?;
        frame.end_rendering()?;
        let status = frame.end()?;

        if status.updated {
            info!(
                "Frame {} rendered into a rebuilt swap chain ({} images)",
                status.frame_number,
                self.renderer.swap_chain().image_count()
            );
        }
        Ok(Some(status))
    }
}

/// Places object `index` of `count` on a circle, growing in over one churn
/// interval and spinning with time.
fn ring_transform(index: usize, count: usize, age: u64, elapsed: f32, aspect: f32) -> Transform {
    let angle = TAU * index as f32 / count.max(1) as f32 + elapsed * 0.5;
    let scale = (age as f32 / CHURN_INTERVAL as f32).min(1.0) * 0.25;

    let model = Mat4::from_scale_rotation_translation(
        Vec3::splat(scale),
        Quat::from_rotation_z(elapsed + index as f32),
        Vec3::new(angle.cos() * 0.6, angle.sin() * 0.6, 0.0),
    );
    let projection = Mat4::orthographic_rh(-aspect, aspect, -1.0, 1.0, -1.0, 1.0);
    Transform {
        model_view_projection: projection * model,
    }
}
