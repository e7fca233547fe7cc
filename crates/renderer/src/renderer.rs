//! Renderer orchestration.
//!
//! [`Renderer`] ties the frame slots, the swap chain and the binding pool
//! together behind the API the scene layer uses: pipelines, drawable
//! objects, binding sets and [`Frame`]s.
//!
//! # Resource Destruction Order
//!
//! 1. Wait for all GPU work to complete
//! 2. Destroy pipelines
//! 3. Drop objects, then the binding pool (sets, uniforms, layouts)
//! 4. Drop the swap chain (views, depth, swapchain)
//! 5. Drop frame slots (fences, semaphores)
//!
//! Fields are declared in that order.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info};

use vkframe_rhi::backend::{GpuBackend, PipelineDesc, PipelineObjects};
use vkframe_rhi::binding::BindingLayout;
use vkframe_rhi::pipeline::PipelineConfig;
use vkframe_rhi::vertex::VertexLayout;
use vkframe_rhi::{RhiError, RhiResult};

use crate::arena::{Arena, ArenaKey};
use crate::binding_pool::BindingPool;
use crate::binding_set::{BindingSet, BindingSetId, BindingWrite};
use crate::config::RendererConfig;
use crate::frame::Frame;
use crate::frame_manager::{FrameClock, FrameManager};
use crate::swap_chain::{SwapChain, SwapChainOptions};

/// Handle to a pipeline made by [`Renderer::make_pipeline`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineHandle(u32);

impl PipelineHandle {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Handle to an object added with [`Renderer::add_object`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    index: u32,
    generation: u32,
}

impl ArenaKey for ObjectHandle {
    fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    fn index(self) -> u32 {
        self.index
    }

    fn generation(self) -> u32 {
        self.generation
    }
}

/// Index data of a [`Geometry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexData {
    pub buffer: vk::Buffer,
    pub index_type: vk::IndexType,
    pub count: u32,
}

/// Already-uploaded vertex (and optional index) buffers.
///
/// The renderer does not own these buffers; their owner keeps them alive
/// while objects draw them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub vertex_buffer: vk::Buffer,
    pub vertex_count: u32,
    pub indices: Option<IndexData>,
}

impl Geometry {
    /// Non-indexed geometry.
    pub fn vertices(vertex_buffer: vk::Buffer, vertex_count: u32) -> Self {
        Self {
            vertex_buffer,
            vertex_count,
            indices: None,
        }
    }

    /// Geometry drawn through a `u16` or `u32` index buffer.
    pub fn indexed(
        vertex_buffer: vk::Buffer,
        vertex_count: u32,
        index_buffer: vk::Buffer,
        index_type: vk::IndexType,
        index_count: u32,
    ) -> Self {
        Self {
            vertex_buffer,
            vertex_count,
            indices: Some(IndexData {
                buffer: index_buffer,
                index_type,
                count: index_count,
            }),
        }
    }
}

pub(crate) struct PipelineRecord {
    pub(crate) objects: PipelineObjects,
    pub(crate) binding_layout: BindingLayout,
}

/// A drawable: pipeline, geometry and the binding set it draws with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderObject {
    pub pipeline: PipelineHandle,
    pub geometry: Geometry,
    pub binding_set: BindingSetId,
}

/// The frame-synchronization core; see the module docs.
pub struct Renderer<B: GpuBackend> {
    pub(crate) pipelines: Vec<PipelineRecord>,
    pub(crate) objects: Arena<ObjectHandle, RenderObject>,
    pub(crate) pool: BindingPool<B>,
    pub(crate) swap_chain: SwapChain<B>,
    pub(crate) frames: FrameManager<B>,
    pub(crate) config: RendererConfig,
    pub(crate) backend: Arc<B>,
}

impl<B: GpuBackend> Renderer<B> {
    /// Creates the frame slots, the swap chain for `extent` and an empty
    /// binding pool.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidConfig`] for a config that fails
    /// [`RendererConfig::validate`], [`RhiError::SwapchainError`] for a zero
    /// extent and device errors otherwise.
    pub fn new(backend: Arc<B>, extent: vk::Extent2D, config: RendererConfig) -> RhiResult<Self> {
        config
            .validate()
            .map_err(|err| RhiError::InvalidConfig(err.to_string()))?;
        info!("Initializing renderer on {} backend", backend.name());

        let frames = FrameManager::new(&backend, config.frames_in_flight)?;
        let swap_chain = SwapChain::new(
            backend.clone(),
            extent,
            SwapChainOptions::from_config(&config),
        )?;
        let pool = BindingPool::new(
            backend.clone(),
            swap_chain.image_count(),
            config.binding_pool.clone(),
        );

        info!(
            "Renderer initialized: {} frames in flight, {} swap images",
            frames.frames_in_flight(),
            swap_chain.image_count()
        );
        Ok(Self {
            pipelines: Vec::new(),
            objects: Arena::new(),
            pool,
            swap_chain,
            frames,
            config,
            backend,
        })
    }

    /// Builds a graphics pipeline drawing into the swap images with one
    /// binding set of `binding_layout`.
    pub fn make_pipeline(
        &mut self,
        vertex_bytes: &[u8],
        fragment_bytes: &[u8],
        vertex_layout: &VertexLayout,
        binding_layout: &BindingLayout,
        config: &PipelineConfig,
    ) -> RhiResult<PipelineHandle> {
        let set_layout = self.pool.set_layout(binding_layout)?;
        // The pass always carries the shared depth target.
        let depth_format = self.swap_chain.depth_format();
        let objects = self.backend.create_pipeline(&PipelineDesc {
            vertex_spirv: vertex_bytes,
            fragment_spirv: fragment_bytes,
            vertex_layout,
            set_layout,
            config,
            color_format: self.swap_chain.format(),
            depth_format,
        })?;

        let handle = PipelineHandle(self.pipelines.len() as u32);
        self.pipelines.push(PipelineRecord {
            objects,
            binding_layout: binding_layout.clone(),
        });
        debug!("Created pipeline {:?}", handle);
        Ok(handle)
    }

    pub(crate) fn pipeline(&self, handle: PipelineHandle) -> RhiResult<&PipelineRecord> {
        self.pipelines
            .get(handle.0 as usize)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown pipeline {handle:?}")))
    }

    /// Adds a drawable object. The object holds one reference to
    /// `binding_set` until it is removed.
    pub fn add_object(
        &mut self,
        pipeline: PipelineHandle,
        geometry: Geometry,
        binding_set: BindingSetId,
    ) -> RhiResult<ObjectHandle> {
        let record = self.pipeline(pipeline)?;
        let set = self
            .pool
            .get(binding_set)
            .ok_or_else(|| RhiError::InvalidHandle(format!("stale binding set {binding_set:?}")))?;
        if set.layout() != &record.binding_layout {
            return Err(RhiError::LayoutMismatch(format!(
                "binding set {binding_set:?} does not match the layout of {pipeline:?}"
            )));
        }
        self.pool.retain(binding_set)?;
        Ok(self.objects.insert(RenderObject {
            pipeline,
            geometry,
            binding_set,
        }))
    }

    /// Removes an object and releases its binding set reference.
    pub fn remove_object(&mut self, handle: ObjectHandle) -> RhiResult<()> {
        let object = self
            .objects
            .remove(handle)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown object {handle:?}")))?;
        self.pool.release(object.binding_set)
    }

    pub fn object(&self, handle: ObjectHandle) -> Option<&RenderObject> {
        self.objects.get(handle)
    }

    #[inline]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Creates a binding set, held once by the caller.
    pub fn get_binding_set(
        &mut self,
        layout: &BindingLayout,
        writes: Vec<BindingWrite>,
    ) -> RhiResult<BindingSetId> {
        self.pool
            .get_binding_set(layout, writes, self.frames.clock())
    }

    pub fn retain_binding_set(&mut self, id: BindingSetId) -> RhiResult<()> {
        self.pool.retain(id)
    }

    pub fn release_binding_set(&mut self, id: BindingSetId) -> RhiResult<()> {
        self.pool.release(id)
    }

    /// Declares upfront demand for `count` sets of `layout`.
    pub fn reserve_binding_space(&mut self, count: u32, layout: &BindingLayout) -> RhiResult<()> {
        self.pool.reserve_space(count, layout, self.frames.clock())
    }

    pub fn binding_set(&self, id: BindingSetId) -> Option<&BindingSet<B>> {
        self.pool.get(id)
    }

    /// Reads the uniform duplicate of swap image `image` outside any frame.
    pub fn read_uniform(
        &self,
        id: BindingSetId,
        binding: u32,
        image: u32,
        offset: vk::DeviceSize,
        len: usize,
    ) -> RhiResult<Vec<u8>> {
        self.pool.read_uniform(id, binding, image, offset, len)
    }

    /// Forwards the platform's resize; the swap chain is rebuilt at the next
    /// acquire. A zero size pauses frame production.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.swap_chain
            .request_resize(vk::Extent2D { width, height });
    }

    /// Acquires a swap image and opens a frame.
    ///
    /// This is the only call that blocks: on the fence of frame k-N and, if
    /// images come back out of order, on the fence of the frame that last
    /// wrote the acquired image. Returns `Ok(None)` when the drawable is
    /// zero-sized.
    pub fn begin_frame(&mut self) -> RhiResult<Option<Frame<'_, B>>> {
        let (slot, clock) = self.frames.current_mut();
        let Some(acquired) = self.swap_chain.acquire_image(slot, clock)? else {
            return Ok(None);
        };
        let command_buffer = slot.command_buffer();
        let frame_number = clock.begin();

        if acquired.recreated {
            let clock = *self.frames.clock();
            self.pool
                .set_image_count(self.swap_chain.image_count(), &clock)?;
        }
        self.pool.release_retired(self.frames.clock().completed());

        self.backend.begin_commands(command_buffer)?;
        Ok(Some(Frame::new(
            self,
            acquired,
            frame_number,
            command_buffer,
        )))
    }

    /// Blocks until every submitted frame has retired.
    pub fn wait_idle(&mut self) -> RhiResult<()> {
        self.frames.wait_all()?;
        self.pool.release_retired(self.frames.clock().completed());
        Ok(())
    }

    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    #[inline]
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    #[inline]
    pub fn swap_chain(&self) -> &SwapChain<B> {
        &self.swap_chain
    }

    #[inline]
    pub fn binding_pool(&self) -> &BindingPool<B> {
        &self.pool
    }

    #[inline]
    pub fn frame_clock(&self) -> &FrameClock {
        self.frames.clock()
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames.frames_in_flight()
    }
}

impl<B: GpuBackend> Drop for Renderer<B> {
    fn drop(&mut self) {
        info!("Shutting down renderer...");
        if let Err(err) = self.backend.wait_idle() {
            error!("Failed to wait for device idle: {}", err);
        }
        for record in self.pipelines.drain(..) {
            self.backend.destroy_pipeline(record.objects);
        }
        info!("Renderer shutdown complete");
    }
}
