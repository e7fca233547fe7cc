//! Render hardware interface for the frame core.
//!
//! This crate provides the device seam the frame core is written against:
//! - [`GpuBackend`](backend::GpuBackend), the device operations
//! - [`vulkan::VulkanBackend`], the `ash` implementation
//! - [`headless::HeadlessBackend`], a deterministic simulated device
//! - RAII fences, semaphores and buffers generic over the backend
//! - backend-neutral binding, vertex and pipeline descriptions

mod error;

pub mod backend;
pub mod binding;
pub mod buffer;
pub mod command;
pub mod headless;
pub mod pipeline;
pub mod shader;
pub mod sync;
pub mod vertex;
pub mod vulkan;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
