//! Window management using winit.
//!
//! The renderer never talks to winit directly. It asks this wrapper for the
//! drawable size and the resize-pending flag, and hands the raw handles to
//! the device backend for surface creation.

use std::sync::Arc;

use raw_window_handle::{
    HandleError, HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle,
};
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window as WinitWindow, WindowAttributes};

use vkframe_core::{Error, Result, WindowConfig};

/// A window wrapper that tracks resizes for the swap chain.
pub struct Window {
    window: Arc<WinitWindow>,
    resize_pending: bool,
}

impl Window {
    /// Create a window from `config`.
    pub fn new(event_loop: &ActiveEventLoop, config: &WindowConfig) -> Result<Self> {
        config.validate()?;
        let attrs = WindowAttributes::default()
            .with_title(config.title.clone())
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(config.resizable);

        let window = event_loop
            .create_window(attrs)
            .map_err(|e| Error::Window(e.to_string()))?;

        tracing::info!("Window created: {}x{}", config.width, config.height);

        Ok(Self {
            window: Arc::new(window),
            resize_pending: false,
        })
    }

    /// Get a reference to the underlying winit window.
    pub fn inner(&self) -> &WinitWindow {
        &self.window
    }

    /// Current drawable size in physical pixels; zero while minimized.
    pub fn drawable_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    /// Records that the drawable changed size since the last frame.
    pub fn mark_resized(&mut self) {
        self.resize_pending = true;
        let (width, height) = self.drawable_size();
        tracing::debug!("Window resized: {}x{}", width, height);
    }

    /// Returns and clears the resize-pending flag.
    pub fn take_resize_pending(&mut self) -> bool {
        std::mem::take(&mut self.resize_pending)
    }

    /// Raw display handle for surface creation.
    pub fn raw_display_handle(&self) -> std::result::Result<RawDisplayHandle, HandleError> {
        Ok(self.window.display_handle()?.as_raw())
    }

    /// Raw window handle for surface creation.
    pub fn raw_window_handle(&self) -> std::result::Result<RawWindowHandle, HandleError> {
        Ok(self.window.window_handle()?.as_raw())
    }

    /// Request a redraw of the window.
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}
