//! Desktop host: one winit window with a GLES 3.0 context created through
//! glutin. The event loop owns the GL context and drives whichever surface is
//! active; everything else talks to it through [`ControlHandle`] or a
//! [`RendererProxy`].

use std::ffi::{c_void, CString};
use std::num::NonZeroU32;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use glutin::config::{Config, ConfigTemplateBuilder};
use glutin::context::{
    ContextApi, ContextAttributesBuilder, NotCurrentContext, PossiblyCurrentContext, Version,
};
use glutin::display::{Display, DisplayApiPreference};
use glutin::prelude::*;
use glutin::surface::{Surface, SurfaceAttributesBuilder, SwapInterval, WindowSurface};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawWindowHandle};
use tracing::{error, info, warn};
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop, EventLoopProxy};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowBuilder};

use crate::control::ControlHandle;
use crate::gl::{self, GlowGpu};
use crate::runtime::{time_source_for_policy, BoxedTimeSource, FrameScheduler, RenderPolicy, TimeSample};
use crate::surface::RenderSurface;
use crate::types::{RendererConfig, NODE_COUNT};
use crate::video::{DecodeSession, VideoSurface};

/// Messages other threads can post into the window's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WindowCommand {
    /// Control state changed; render again even if the policy is idle.
    Redraw,
    Shutdown,
}

/// Cloneable handle for waking or stopping a running renderer.
#[derive(Debug, Clone)]
pub struct RendererProxy {
    proxy: EventLoopProxy<WindowCommand>,
}

impl RendererProxy {
    pub(crate) fn new(proxy: EventLoopProxy<WindowCommand>) -> Self {
        Self { proxy }
    }

    /// Returns false once the event loop has exited.
    pub fn request_redraw(&self) -> bool {
        self.proxy.send_event(WindowCommand::Redraw).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.proxy.send_event(WindowCommand::Shutdown).is_ok()
    }
}

pub(crate) struct RenderPolicyDriver {
    scheduler: FrameScheduler,
    time_source: BoxedTimeSource,
}

impl RenderPolicyDriver {
    pub(crate) fn new(policy: RenderPolicy) -> Self {
        Self {
            time_source: time_source_for_policy(&policy),
            scheduler: FrameScheduler::new(policy),
        }
    }

    pub(crate) fn sample(&mut self) -> TimeSample {
        self.time_source.sample()
    }

    pub(crate) fn mark_rendered(&mut self) {
        self.scheduler.mark_rendered();
    }

    pub(crate) fn ready_for_frame(&mut self, now: Instant) -> bool {
        self.scheduler.ready_for_frame(now)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    /// Lets a still frame render once more after a control change. Animation
    /// keeps its clock so a toggle does not restart the shader.
    pub(crate) fn invalidate(&mut self) {
        if matches!(self.scheduler.policy(), RenderPolicy::Still { .. }) {
            self.time_source.reset();
            self.scheduler.reset();
        }
    }
}

/// What a key press asks the host to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyAction {
    ToggleSlot(usize),
    Reinit,
    Quit,
}

pub(crate) fn key_action(key: &Key) -> Option<KeyAction> {
    match key {
        Key::Named(NamedKey::Escape) => Some(KeyAction::Quit),
        Key::Character(value) => {
            let value = value.as_str();
            if value.eq_ignore_ascii_case("r") {
                return Some(KeyAction::Reinit);
            }
            value
                .parse::<usize>()
                .ok()
                .filter(|digit| (1..=NODE_COUNT).contains(digit))
                .map(|digit| KeyAction::ToggleSlot(digit - 1))
        }
        _ => None,
    }
}

enum ActiveSurface {
    Shader(RenderSurface),
    Video(VideoSurface),
}

impl ActiveSurface {
    fn resize(&mut self, width: u32, height: u32) {
        match self {
            Self::Shader(surface) => surface.resize(width, height),
            Self::Video(surface) => surface.resize(width, height),
        }
    }

    fn render(&mut self, gpu: &GlowGpu, time: f32) -> Result<()> {
        match self {
            Self::Shader(surface) => {
                surface.render_frame(gpu, time)?;
            }
            Self::Video(surface) => surface.render_frame(gpu)?,
        }
        Ok(())
    }

    fn teardown(&mut self, gpu: &GlowGpu) {
        match self {
            Self::Shader(surface) => surface.teardown(gpu),
            Self::Video(surface) => {
                surface.stop();
                surface.teardown(gpu);
            }
        }
    }
}

struct GlWindow {
    window: Window,
    surface: Surface<WindowSurface>,
    context: PossiblyCurrentContext,
    gpu: GlowGpu,
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

/// Prefers the config with the most MSAA samples.
fn pick_config(configs: impl Iterator<Item = Config>) -> Option<Config> {
    configs.reduce(|best, candidate| {
        if candidate.num_samples() > best.num_samples() {
            candidate
        } else {
            best
        }
    })
}

#[cfg(target_os = "windows")]
fn display_preference(window: RawWindowHandle) -> DisplayApiPreference {
    DisplayApiPreference::WglThenEgl(Some(window))
}

#[cfg(target_os = "macos")]
fn display_preference(_window: RawWindowHandle) -> DisplayApiPreference {
    DisplayApiPreference::Cgl
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn display_preference(_window: RawWindowHandle) -> DisplayApiPreference {
    DisplayApiPreference::Egl
}

impl GlWindow {
    fn create(event_loop: &EventLoop<WindowCommand>, config: &RendererConfig) -> Result<Self> {
        let (width, height) = config.surface_size;
        let window_builder = WindowBuilder::new()
            .with_title(config.title.as_str())
            .with_inner_size(PhysicalSize::new(width.max(1), height.max(1)))
            .with_visible(!config.policy.is_export());
        let window = window_builder
            .build(event_loop)
            .context("failed to create window")?;

        let raw_window_handle = window.raw_window_handle();
        let display = unsafe {
            Display::new(
                window.raw_display_handle(),
                display_preference(raw_window_handle),
            )
        }
        .context("failed to open GL display")?;
        let template = ConfigTemplateBuilder::new()
            .with_alpha_size(8)
            .compatible_with_native_window(raw_window_handle)
            .build();
        let configs = unsafe { display.find_configs(template) }
            .context("failed to query GL configs")?;
        let gl_config =
            pick_config(configs).ok_or_else(|| anyhow!("no GL config matches the window"))?;

        let gles = ContextAttributesBuilder::new()
            .with_context_api(ContextApi::Gles(Some(Version::new(3, 0))))
            .build(Some(raw_window_handle));
        let fallback = ContextAttributesBuilder::new().build(Some(raw_window_handle));
        let not_current: NotCurrentContext = unsafe {
            display
                .create_context(&gl_config, &gles)
                .or_else(|err| {
                    warn!(error = %err, "GLES 3.0 context unavailable; trying the default API");
                    display.create_context(&gl_config, &fallback)
                })
                .context("failed to create GL context")?
        };

        let size = window.inner_size();
        let attributes = SurfaceAttributesBuilder::<WindowSurface>::new().build(
            raw_window_handle,
            non_zero(size.width),
            non_zero(size.height),
        );
        let surface = unsafe {
            display
                .create_window_surface(&gl_config, &attributes)
                .context("failed to create window surface")?
        };
        let context = not_current
            .make_current(&surface)
            .context("failed to make GL context current")?;
        if let Err(err) = surface.set_swap_interval(&context, SwapInterval::Wait(NonZeroU32::MIN)) {
            warn!(error = %err, "vsync unavailable");
        }

        let gpu = unsafe {
            gl::resolve(|symbol| match CString::new(symbol) {
                Ok(symbol) => display.get_proc_address(&symbol) as *const c_void,
                Err(_) => std::ptr::null(),
            })
        }?;

        Ok(Self {
            window,
            surface,
            context,
            gpu,
        })
    }

    fn resize(&self, width: u32, height: u32) {
        self.surface
            .resize(&self.context, non_zero(width), non_zero(height));
    }

    fn present(&self) -> Result<()> {
        self.surface
            .swap_buffers(&self.context)
            .context("failed to swap buffers")
    }
}

fn start_video(
    config: &RendererConfig,
    shader: RenderSurface,
    size: (u32, u32),
) -> ActiveSurface {
    let Some(video) = config.video.as_ref() else {
        return ActiveSurface::Shader(shader);
    };
    match DecodeSession::start(&video.path, video.looping) {
        Ok(session) => ActiveSurface::Video(VideoSurface::new(session, size, shader.controls())),
        Err(err) => {
            error!(path = %video.path.display(), error = %err, "video unavailable; showing shader chain");
            ActiveSurface::Shader(shader)
        }
    }
}

fn export_frame(surface: &ActiveSurface, gpu: &GlowGpu, path: &Path) -> Result<()> {
    let ActiveSurface::Shader(surface) = surface else {
        return Err(anyhow!("export is only supported for shader output"));
    };
    let image = surface.capture(gpu)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Renders one frame. Returns `Some` when the loop should exit, carrying the
/// error that ended it, if any. Render errors outside export are logged once
/// per distinct message and the loop keeps running.
fn draw_frame(
    active: &mut ActiveSurface,
    gl_window: &GlWindow,
    driver: &mut RenderPolicyDriver,
    export_path: Option<&Path>,
    last_error: &mut Option<String>,
) -> Option<Result<()>> {
    let sample = driver.sample();
    if let Err(err) = active.render(&gl_window.gpu, sample.seconds) {
        if export_path.is_some() {
            return Some(Err(err));
        }
        let message = format!("{err:#}");
        if last_error.as_deref() != Some(message.as_str()) {
            error!(error = %message, "render failed");
            *last_error = Some(message);
        }
        driver.mark_rendered();
        return None;
    }
    *last_error = None;
    if let Some(path) = export_path {
        let exported = export_frame(active, &gl_window.gpu, path);
        if exported.is_ok() {
            info!(path = %path.display(), "still frame exported");
        }
        driver.mark_rendered();
        return Some(exported);
    }
    if let Err(err) = gl_window.present() {
        warn!(error = %err, "present failed; retrying next frame");
    }
    driver.mark_rendered();
    None
}

/// Runs the event loop on the calling thread until the window closes.
pub(crate) fn run_window(
    event_loop: EventLoop<WindowCommand>,
    config: RendererConfig,
    shader: RenderSurface,
    controls: ControlHandle,
) -> Result<()> {
    let gl_window = GlWindow::create(&event_loop, &config)?;
    let size = gl_window.window.inner_size();
    let mut shader = shader;
    shader.resize(size.width, size.height);
    let mut active = start_video(&config, shader, (size.width, size.height));
    let export_path = match &config.policy {
        RenderPolicy::Export { path, .. } => Some(path.clone()),
        _ => None,
    };
    let mut driver = RenderPolicyDriver::new(config.policy.clone());
    let mut failure: Option<anyhow::Error> = None;
    let mut last_error: Option<String> = None;
    info!(
        width = size.width,
        height = size.height,
        video = config.video.is_some(),
        "window ready"
    );

    let run_result = event_loop.run(|event, elwt| match event {
        Event::UserEvent(WindowCommand::Redraw) => {
            driver.invalidate();
            gl_window.window.request_redraw();
        }
        Event::UserEvent(WindowCommand::Shutdown) => elwt.exit(),
        Event::WindowEvent { window_id, event } if window_id == gl_window.window.id() => {
            match event {
                WindowEvent::CloseRequested | WindowEvent::Destroyed => elwt.exit(),
                WindowEvent::Resized(new_size) => {
                    if export_path.is_none() {
                        gl_window.resize(new_size.width, new_size.height);
                        active.resize(new_size.width, new_size.height);
                        driver.invalidate();
                        gl_window.window.request_redraw();
                    }
                }
                WindowEvent::KeyboardInput { event, .. } => {
                    if event.state != ElementState::Pressed || event.repeat {
                        return;
                    }
                    match key_action(&event.logical_key) {
                        Some(KeyAction::Quit) => elwt.exit(),
                        Some(KeyAction::ToggleSlot(slot)) => {
                            let active_now = controls.toggle_slot(slot);
                            info!(slot, active = active_now, "toggled processing node");
                        }
                        Some(KeyAction::Reinit) => {
                            info!("reinitialising surface");
                            controls.request_reinit();
                        }
                        None => return,
                    }
                    driver.invalidate();
                    gl_window.window.request_redraw();
                }
                WindowEvent::RedrawRequested => {
                    let outcome = draw_frame(
                        &mut active,
                        &gl_window,
                        &mut driver,
                        export_path.as_deref(),
                        &mut last_error,
                    );
                    if let Some(outcome) = outcome {
                        if let Err(err) = outcome {
                            failure = Some(err);
                        }
                        elwt.exit();
                    }
                }
                _ => {}
            }
        }
        Event::AboutToWait => {
            let now = Instant::now();
            if export_path.is_some() && driver.ready_for_frame(now) {
                // Hidden windows may never receive a redraw request.
                let outcome = draw_frame(
                    &mut active,
                    &gl_window,
                    &mut driver,
                    export_path.as_deref(),
                    &mut last_error,
                );
                if let Some(Err(err)) = outcome {
                    failure = Some(err);
                }
                elwt.exit();
            } else if driver.ready_for_frame(now) {
                gl_window.window.request_redraw();
                elwt.set_control_flow(ControlFlow::Wait);
            } else if let Some(deadline) = driver.next_deadline() {
                elwt.set_control_flow(ControlFlow::WaitUntil(deadline));
            } else {
                elwt.set_control_flow(ControlFlow::Wait);
            }
        }
        Event::LoopExiting => {
            active.teardown(&gl_window.gpu);
        }
        _ => {}
    });

    if let Some(err) = failure {
        return Err(err);
    }
    run_result.map_err(|err| anyhow!("window event loop error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use winit::keyboard::SmolStr;

    fn character(value: &str) -> Key {
        Key::Character(SmolStr::new(value))
    }

    #[test]
    fn no_configs_means_no_pick() {
        assert!(pick_config(std::iter::empty::<Config>()).is_none());
    }

    #[test]
    fn digit_keys_toggle_slots() {
        assert_eq!(key_action(&character("1")), Some(KeyAction::ToggleSlot(0)));
        assert_eq!(key_action(&character("6")), Some(KeyAction::ToggleSlot(5)));
        assert_eq!(key_action(&character("0")), None);
        assert_eq!(key_action(&character("7")), None);
    }

    #[test]
    fn named_and_letter_keys() {
        assert_eq!(
            key_action(&Key::Named(NamedKey::Escape)),
            Some(KeyAction::Quit)
        );
        assert_eq!(key_action(&character("r")), Some(KeyAction::Reinit));
        assert_eq!(key_action(&character("R")), Some(KeyAction::Reinit));
        assert_eq!(key_action(&character("x")), None);
        assert_eq!(key_action(&Key::Named(NamedKey::Space)), None);
    }

    #[test]
    fn invalidate_rearms_still_policy_only() {
        let mut still = RenderPolicyDriver::new(RenderPolicy::Still { time: Some(1.0) });
        let now = Instant::now();
        assert!(still.ready_for_frame(now));
        still.mark_rendered();
        assert!(!still.ready_for_frame(now));
        still.invalidate();
        assert!(still.ready_for_frame(now));
        assert_eq!(still.sample().seconds, 1.0);

        let mut animate = RenderPolicyDriver::new(RenderPolicy::Animate {
            target_fps: Some(1.0),
        });
        animate.mark_rendered();
        animate.invalidate();
        assert!(animate.next_deadline().is_some());
    }
}
