//! Render Surface: the per-frame protocol.
//!
//! The surface is constructed before any graphics context exists and builds
//! nothing until the first [`RenderSurface::render_frame`] call. From then on
//! each frame runs, in order: re-initialisation if requested, hot-reload
//! check, viewport sync, control sync, composition.
//!
//! ```text
//!   Uninitialized ──first frame──▶ Degraded ──user shader builds──▶ Ready
//!         ▲                           │                               │
//!         └──────── teardown / reinit ┴───────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::imageops::flip_vertical_in_place;
use image::RgbaImage;

use crate::chain::{FrameParams, FramePath, NodeChain};
use crate::control::ControlHandle;
use crate::gl::{Gpu, VertexArrayId};
use crate::program::{self, GraphicsProgram, ProgramError, FALLBACK_FRAGMENT, PASSTHROUGH_FRAGMENT};
use crate::reload::{read_source, HotReload};
use crate::target::{TargetCache, TargetError};
use crate::types::NodeLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    /// No GPU resources exist.
    Uninitialized,
    /// A user shader is on screen.
    Ready,
    /// The built-in fallback is on screen because no user shader has built.
    Degraded,
}

#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("failed to build built-in program: {0}")]
    Builtin(#[from] ProgramError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("failed to create vertex array: {0}")]
    VertexArray(String),
    #[error("surface has not rendered a frame yet")]
    NotInitialized,
    #[error("captured pixel buffer does not match {width}x{height}")]
    Capture { width: u32, height: u32 },
}

struct Resources {
    vertex_array: VertexArrayId,
    passthrough: GraphicsProgram,
    main: GraphicsProgram,
    chain: NodeChain,
    targets: TargetCache,
}

pub struct RenderSurface {
    state: SurfaceState,
    layout: NodeLayout,
    controls: ControlHandle,
    reload: HotReload,
    requeue: Option<PathBuf>,
    size: (u32, u32),
    resources: Option<Resources>,
}

impl RenderSurface {
    pub fn new(layout: NodeLayout, size: (u32, u32)) -> Self {
        let controls = ControlHandle::from_layout(&layout);
        Self {
            state: SurfaceState::Uninitialized,
            layout,
            controls,
            reload: HotReload::new(None),
            requeue: None,
            size: (size.0.max(1), size.1.max(1)),
            resources: None,
        }
    }

    /// Queues `path` as the main shader for the first frame.
    pub fn with_main_shader(self, path: impl Into<PathBuf>) -> Self {
        self.controls.set_main_shader_path(path.into());
        self
    }

    pub fn with_reload_poll(mut self, poll: Option<Duration>) -> Self {
        self.reload = HotReload::new(poll);
        self
    }

    pub fn controls(&self) -> ControlHandle {
        self.controls.clone()
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Records the viewport size in device pixels; applied on the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.size = (width.max(1), height.max(1));
    }

    pub fn render_frame<G: Gpu>(&mut self, gpu: &G, time: f32) -> Result<FramePath, SurfaceError> {
        if self.controls.take_reinit() && self.resources.is_some() {
            tracing::info!("re-initialising render surface");
            self.teardown(gpu);
        }
        if self.resources.is_none() {
            self.initialize(gpu)?;
        }
        self.check_reload(gpu);

        let (width, height) = self.size;
        let Some(resources) = self.resources.as_mut() else {
            return Err(SurfaceError::NotInitialized);
        };
        resources.targets.observe_viewport(gpu, width, height);
        resources.chain.sync(&self.controls);

        gpu.bind_vertex_array(Some(resources.vertex_array));
        let path = resources.chain.render(
            gpu,
            &mut resources.targets,
            &resources.main,
            &resources.passthrough,
            FrameParams {
                time,
                width,
                height,
            },
        );
        gpu.bind_vertex_array(None);
        gpu.use_program(None);
        Ok(path?)
    }

    fn initialize<G: Gpu>(&mut self, gpu: &G) -> Result<(), SurfaceError> {
        let vertex_array = gpu.create_vertex_array().map_err(SurfaceError::VertexArray)?;
        let passthrough = match program::build_fragment(gpu, PASSTHROUGH_FRAGMENT) {
            Ok(program) => program,
            Err(err) => {
                gpu.delete_vertex_array(vertex_array);
                return Err(err.into());
            }
        };
        let main = match program::build_fragment(gpu, FALLBACK_FRAGMENT) {
            Ok(program) => program,
            Err(err) => {
                passthrough.destroy(gpu);
                gpu.delete_vertex_array(vertex_array);
                return Err(err.into());
            }
        };
        let chain = NodeChain::load(gpu, &self.layout);
        chain.publish(&self.controls);

        self.resources = Some(Resources {
            vertex_array,
            passthrough,
            main,
            chain,
            targets: TargetCache::new(),
        });
        self.state = SurfaceState::Degraded;
        tracing::debug!(
            width = self.size.0,
            height = self.size.1,
            "render surface initialised"
        );
        Ok(())
    }

    fn check_reload<G: Gpu>(&mut self, gpu: &G) {
        let mut requested = false;
        if let Some(pending) = self.controls.take_pending_main() {
            requested = true;
            if let Some(path) = self.accept_request(&pending) {
                if self.load_main(gpu, path) {
                    self.requeue = None;
                }
            }
        }
        // The shader that was on screen before a reinit, unless a newer
        // request already replaced it.
        if let Some(previous) = self.requeue.take() {
            requested = true;
            if let Some(path) = self.accept_request(&previous) {
                self.load_main(gpu, path);
            }
        }
        if !requested {
            if let Some(path) = self.reload.poll_modified(Instant::now()) {
                self.load_main(gpu, path);
            }
        }
    }

    fn accept_request(&self, pending: &Path) -> Option<PathBuf> {
        match self.reload.check_pending(pending) {
            Ok(Some(path)) => Some(path),
            Ok(None) => {
                tracing::debug!(path = %pending.display(), "main shader already loaded");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "main shader request ignored; keeping current program");
                None
            }
        }
    }

    fn load_main<G: Gpu>(&mut self, gpu: &G, path: PathBuf) -> bool {
        let Some(resources) = self.resources.as_mut() else {
            return false;
        };
        let source = match read_source(&path) {
            Ok(source) => source,
            Err(err) => {
                tracing::warn!(error = %err, "main shader unreadable; keeping current program");
                return false;
            }
        };
        match program::build_fragment(gpu, &source) {
            Ok(program) => {
                let previous = std::mem::replace(&mut resources.main, program);
                previous.destroy(gpu);
                tracing::info!(path = %path.display(), "main shader loaded");
                self.controls.publish_main(Some(path.clone()));
                self.reload.mark_loaded(path);
                self.state = SurfaceState::Ready;
                true
            }
            Err(err) => {
                tracing::error!(
                    path = %path.display(),
                    error = %err,
                    "main shader failed to build; keeping current program"
                );
                if let Some(source) = err.transformed_source() {
                    tracing::debug!("transformed source:\n{source}");
                }
                self.reload.mark_attempted(&path);
                false
            }
        }
    }

    /// Reads the screen back after a frame, rows ordered top-down.
    pub fn capture<G: Gpu>(&self, gpu: &G) -> Result<RgbaImage, SurfaceError> {
        if self.resources.is_none() {
            return Err(SurfaceError::NotInitialized);
        }
        let (width, height) = self.size;
        let mut pixels = vec![0u8; width as usize * height as usize * 4];
        gpu.bind_framebuffer(None);
        gpu.read_pixels_rgba(width as i32, height as i32, &mut pixels);
        let mut image = RgbaImage::from_raw(width, height, pixels)
            .ok_or(SurfaceError::Capture { width, height })?;
        flip_vertical_in_place(&mut image);
        Ok(image)
    }

    /// Destroys every GPU resource. The next frame starts from scratch and
    /// reloads the main shader that was on screen.
    pub fn teardown<G: Gpu>(&mut self, gpu: &G) {
        let Some(mut resources) = self.resources.take() else {
            return;
        };
        resources.chain.destroy(gpu);
        resources.chain.publish(&self.controls);
        resources.main.destroy(gpu);
        resources.passthrough.destroy(gpu);
        let released = resources.targets.destroy_all(gpu);
        gpu.delete_vertex_array(resources.vertex_array);
        self.requeue = self.reload.forget();
        self.controls.publish_main(None);
        self.state = SurfaceState::Uninitialized;
        tracing::debug!(targets = released, "render surface torn down");
    }

    #[cfg(test)]
    fn targets(&self) -> Option<&TargetCache> {
        self.resources.as_ref().map(|resources| &resources.targets)
    }
}
