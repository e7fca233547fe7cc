//! vkframe demo: drives the frame core on a window or headless.
//!
//! ```text
//! vkframe --config vkframe.json
//! vkframe --headless --frames 600
//! ```

mod demo;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use vkframe_core::config::load_json_or_default;
use vkframe_core::{WindowConfig, init_logging};
use vkframe_platform::{
    ActiveEventLoop, ApplicationHandler, ControlFlow, EventLoop, Window, WindowEvent, WindowId,
};
use vkframe_renderer::{Renderer, RendererConfig};
use vkframe_rhi::headless::{HeadlessBackend, HeadlessConfig};
use vkframe_rhi::shader::SPIRV_MAGIC;
use vkframe_rhi::vulkan::VulkanBackend;

use demo::Demo;

#[derive(Parser, Debug, Clone)]
#[command(name = "vkframe", version, about = "Frame-synchronization demo renderer")]
struct Args {
    /// JSON configuration file; defaults apply when it does not exist.
    #[arg(long, default_value = "vkframe.json")]
    config: PathBuf,

    /// SPIR-V vertex shader.
    #[arg(long, default_value = "shaders/spirv/transform.vert.spv")]
    vertex_shader: PathBuf,

    /// SPIR-V fragment shader.
    #[arg(long, default_value = "shaders/spirv/transform.frag.spv")]
    fragment_shader: PathBuf,

    /// Run on the simulated device instead of opening a window.
    #[arg(long)]
    headless: bool,

    /// Frames to run in headless mode.
    #[arg(long, default_value_t = 600)]
    frames: u64,

    /// Enable the Vulkan validation layers.
    #[arg(long)]
    validation: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    window: WindowConfig,
    renderer: RendererConfig,
}

/// A minimal module header the headless device accepts.
fn placeholder_spirv() -> Vec<u8> {
    [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}

fn load_shader(path: &Path, headless: bool) -> Result<Vec<u8>> {
    if headless && !path.exists() {
        warn!("{:?} not found; using a placeholder module", path);
        return Ok(placeholder_spirv());
    }
    std::fs::read(path).with_context(|| format!("reading shader {}", path.display()))
}

fn load_shaders(args: &Args) -> Result<(Vec<u8>, Vec<u8>)> {
    Ok((
        load_shader(&args.vertex_shader, args.headless)?,
        load_shader(&args.fragment_shader, args.headless)?,
    ))
}

/// Runs the demo for `--frames` ticks on the simulated device, with one
/// resize halfway through.
fn run_headless(args: &Args, config: AppConfig) -> Result<()> {
    let backend = Arc::new(HeadlessBackend::new(HeadlessConfig::default()));
    let extent = vk::Extent2D {
        width: config.window.width,
        height: config.window.height,
    };
    let renderer = Renderer::new(backend.clone(), extent, config.renderer)
        .context("creating the headless renderer")?;
    let (vertex, fragment) = load_shaders(args)?;
    let mut demo = Demo::new(renderer, &vertex, &fragment)?;

    let mut skipped = 0u64;
    for tick in 0..args.frames {
        if tick == args.frames / 2 {
            demo.resize(extent.width / 2, extent.height / 2);
        }
        if demo.tick()?.is_none() {
            skipped += 1;
        }
    }
    demo.wait_idle()?;

    let stats = backend.stats();
    let renderer = demo.renderer();
    info!(
        "Headless run: {} frames submitted, {} presented, {} skipped, at most {} in flight",
        stats.submitted, stats.presents, skipped, stats.max_in_flight
    );
    info!(
        "Swap chain: {} recreations, {}x{}",
        renderer.swap_chain().recreate_count(),
        renderer.swap_chain().extent().width,
        renderer.swap_chain().extent().height
    );
    info!(
        "Binding pool: {} recreations, {} live sets, {} device pools created",
        renderer.binding_pool().recreation_count(),
        renderer.binding_pool().live_sets(),
        stats.descriptor_pool_creations
    );
    Ok(())
}

struct App {
    args: Args,
    config: AppConfig,
    // Declared before the window: the backend's surface must go first.
    demo: Option<Demo<VulkanBackend>>,
    window: Option<Window>,
}

impl App {
    fn new(args: Args, config: AppConfig) -> Self {
        Self {
            args,
            config,
            demo: None,
            window: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Window::new(event_loop, &self.config.window)?;
        let display = window.raw_display_handle()?;
        let handle = window.raw_window_handle()?;

        // SAFETY: the window is stored next to the demo and dropped after it.
        let backend = unsafe { VulkanBackend::new(display, handle, self.args.validation) }
            .context("initializing Vulkan")?;

        let (width, height) = window.drawable_size();
        let renderer = Renderer::new(
            Arc::new(backend),
            vk::Extent2D { width, height },
            self.config.renderer.clone(),
        )?;
        let (vertex, fragment) = load_shaders(&self.args)?;
        self.demo = Some(Demo::new(renderer, &vertex, &fragment)?);
        self.window = Some(window);
        info!("Initialization complete, entering main loop");
        Ok(())
    }

    fn redraw(&mut self) -> Result<()> {
        let (Some(window), Some(demo)) = (self.window.as_mut(), self.demo.as_mut()) else {
            return Ok(());
        };
        if window.take_resize_pending() {
            let (width, height) = window.drawable_size();
            demo.resize(width, height);
        }
        demo.tick()?;
        Ok(())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none()
            && let Err(e) = self.init(event_loop)
        {
            error!("Failed to initialize: {:#}", e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                if let Some(demo) = self.demo.as_mut()
                    && let Err(e) = demo.wait_idle()
                {
                    error!("Failed to drain the device: {:#}", e);
                }
                event_loop.exit();
            }
            WindowEvent::Resized(_) => {
                if let Some(window) = self.window.as_mut() {
                    window.mark_resized();
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.redraw() {
                    error!("Frame failed: {:#}", e);
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let config: AppConfig = load_json_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.window.validate()?;
    config.renderer.validate()?;

    if args.headless {
        info!("Starting vkframe headless for {} frames", args.frames);
        return run_headless(&args, config);
    }

    info!("Starting vkframe");
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);
    let mut app = App::new(args, config);
    event_loop.run_app(&mut app)?;
    Ok(())
}
