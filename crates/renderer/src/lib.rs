//! Frame-synchronization core.
//!
//! This crate orchestrates frame production on top of a
//! [`GpuBackend`](vkframe_rhi::backend::GpuBackend):
//! - Frame slots and the CPU/GPU backpressure fence
//! - The swap buffer chain and its in-place recreation
//! - The resource binding pool and reference-counted binding sets
//! - The per-frame recording context

mod arena;

pub mod binding_pool;
pub mod binding_set;
pub mod config;
pub mod frame;
pub mod frame_manager;
pub mod renderer;
pub mod swap_chain;

pub use arena::ArenaKey;
pub use binding_pool::{Allocation, BindingPool, CapacityCounter, PoolCapacity, PoolResource};
pub use binding_set::{BindingSet, BindingSetId, BindingWrite};
pub use config::{BindingPoolConfig, RendererConfig};
pub use frame::{Frame, FrameStatus};
pub use frame_manager::{FrameClock, FrameManager, FrameSlot};
pub use renderer::{Geometry, IndexData, ObjectHandle, PipelineHandle, RenderObject, Renderer};
pub use swap_chain::{
    AcquiredImage, ChainState, FrameStamp, PresentStatus, RecreateReason, SwapChain,
    SwapChainOptions,
};

/// Default number of frames that can be in flight simultaneously.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
