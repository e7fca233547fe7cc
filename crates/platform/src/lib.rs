//! Platform layer for the frame core.
//!
//! This crate provides:
//! - Window management via winit
//! - Drawable size and resize tracking for swap chain recreation
//! - Raw window handles for Vulkan surface creation

mod window;

pub use window::Window;

// Re-export winit types that users might need
pub use winit::application::ApplicationHandler;
pub use winit::event::WindowEvent;
pub use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
pub use winit::window::WindowId;
