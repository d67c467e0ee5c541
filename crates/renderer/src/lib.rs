//! Renderer crate for shadechain.
//!
//! A main fragment shader is drawn into an offscreen texture, then threaded
//! through up to six post-processing nodes before the result reaches the
//! window. One node may be a feedback node that also samples its own output
//! from the previous frame. The overall flow is:
//!
//! ```text
//!   CLI / shadechain
//!          │ RendererConfig
//!          ▼
//!   Renderer::run ──▶ winit event loop ──▶ RenderSurface::render_frame()
//!          ▲                                      │
//!          │ ControlHandle (any thread)           ├─▶ main program ─▶ Main target
//!          └──────────────────────────────────────┤
//!                                                 └─▶ node 0..5 ─▶ screen
//! ```
//!
//! GPU work only happens on the event loop thread. Callers steer a running
//! renderer through [`ControlHandle`], which records intent that the render
//! thread picks up on its next frame, and wake it through [`RendererProxy`].
//! When a video source is configured the window shows decoded frames instead
//! of the shader chain.

pub mod chain;
pub mod control;
pub mod gl;
pub mod program;
pub mod reload;
pub mod runtime;
pub mod surface;
pub mod target;
pub mod types;
pub mod video;
mod window;

use anyhow::Result;
use winit::event_loop::{EventLoop, EventLoopBuilder};

pub use control::{ControlHandle, ControlSnapshot, SlotStatus};
pub use runtime::{RenderPolicy, TimeSample};
pub use surface::{RenderSurface, SurfaceError, SurfaceState};
pub use types::{NodeLayout, NodeRole, NodeSpec, RendererConfig, SlotIndex, VideoSource, NODE_COUNT};
pub use video::{DecodeSession, VideoError, VideoInfo};
pub use window::RendererProxy;

use window::WindowCommand;

/// Entry point that owns the event loop and the initial render surface.
pub struct Renderer {
    config: RendererConfig,
    surface: RenderSurface,
    event_loop: EventLoop<WindowCommand>,
}

impl Renderer {
    /// Prepares the renderer. Must be called on the thread that will call
    /// [`Renderer::run`]; on most platforms that is the main thread.
    pub fn new(config: RendererConfig) -> Result<Self> {
        let event_loop = EventLoopBuilder::<WindowCommand>::with_user_event()
            .build()
            .map_err(|err| anyhow::anyhow!("failed to create event loop: {err}"))?;
        let mut surface = RenderSurface::new(config.nodes.clone(), config.surface_size)
            .with_reload_poll(config.reload_poll);
        if let Some(path) = &config.shader_source {
            surface = surface.with_main_shader(path.clone());
        }
        Ok(Self {
            config,
            surface,
            event_loop,
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Handle for toggling nodes, adjusting values and swapping the main
    /// shader while the renderer runs.
    pub fn controls(&self) -> ControlHandle {
        self.surface.controls()
    }

    pub fn proxy(&self) -> RendererProxy {
        RendererProxy::new(self.event_loop.create_proxy())
    }

    /// Opens the window and blocks until it closes.
    pub fn run(self) -> Result<()> {
        let controls = self.surface.controls();
        window::run_window(self.event_loop, self.config, self.surface, controls)
    }
}
