//! Buffer Lifecycle Manager.
//!
//! Render targets are texture + framebuffer pairs sized in device pixels.
//! [`TargetCache`] owns every target the pipeline uses and destroys them all
//! as soon as the observed viewport changes size; [`TargetCache::ensure`]
//! recreates them lazily right before use.

use crate::gl::{
    FramebufferId, Gpu, TextureId, CLAMP_TO_EDGE, FRAMEBUFFER_COMPLETE, LINEAR,
    TEXTURE_MAG_FILTER, TEXTURE_MIN_FILTER, TEXTURE_WRAP_S, TEXTURE_WRAP_T,
};
use crate::types::NODE_COUNT;

/// Colour every non-feedback target is cleared to before drawing.
pub const BACKGROUND: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("failed to create render target {object}: {reason}")]
    CreateObject { object: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub framebuffer: FramebufferId,
    pub texture: TextureId,
    pub width: u32,
    pub height: u32,
}

impl RenderTarget {
    /// Binds the framebuffer and sets the viewport to cover it.
    pub fn bind<G: Gpu>(&self, gpu: &G) {
        gpu.bind_framebuffer(Some(self.framebuffer));
        gpu.viewport(0, 0, self.width as i32, self.height as i32);
    }
}

/// Allocates an RGBA8 target with linear filtering and no mipmaps.
///
/// An incomplete framebuffer is logged and still returned; drawing into it
/// yields undefined pixels rather than an error.
pub fn create_target<G: Gpu>(gpu: &G, width: u32, height: u32) -> Result<RenderTarget, TargetError> {
    let width = width.max(1);
    let height = height.max(1);

    let texture = gpu
        .create_texture()
        .map_err(|reason| TargetError::CreateObject {
            object: "texture",
            reason,
        })?;
    gpu.active_texture(0);
    gpu.bind_texture(Some(texture));
    gpu.tex_parameter(TEXTURE_MIN_FILTER, LINEAR as i32);
    gpu.tex_parameter(TEXTURE_MAG_FILTER, LINEAR as i32);
    gpu.tex_parameter(TEXTURE_WRAP_S, CLAMP_TO_EDGE as i32);
    gpu.tex_parameter(TEXTURE_WRAP_T, CLAMP_TO_EDGE as i32);
    gpu.tex_image_rgba(width as i32, height as i32, None);
    gpu.bind_texture(None);

    let framebuffer = match gpu.create_framebuffer() {
        Ok(framebuffer) => framebuffer,
        Err(reason) => {
            gpu.delete_texture(texture);
            return Err(TargetError::CreateObject {
                object: "framebuffer",
                reason,
            });
        }
    };
    gpu.bind_framebuffer(Some(framebuffer));
    gpu.framebuffer_texture(Some(texture));
    let status = gpu.check_framebuffer_status();
    if status != FRAMEBUFFER_COMPLETE {
        tracing::warn!(
            status = %format!("{status:#x}"),
            width,
            height,
            "render target framebuffer is incomplete; output will be undefined"
        );
    }
    gpu.viewport(0, 0, width as i32, height as i32);
    gpu.clear(BACKGROUND);
    gpu.bind_framebuffer(None);

    Ok(RenderTarget {
        framebuffer,
        texture,
        width,
        height,
    })
}

pub fn destroy_target<G: Gpu>(gpu: &G, target: RenderTarget) {
    gpu.delete_framebuffer(target.framebuffer);
    gpu.delete_texture(target.texture);
}

/// Identity of a target within the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKey {
    /// First pass of the chained path.
    Main,
    Node(usize),
    /// Previous-frame output of the delay node.
    Feedback,
}

#[derive(Debug, Default)]
pub struct TargetCache {
    size: Option<(u32, u32)>,
    main: Option<RenderTarget>,
    nodes: [Option<RenderTarget>; NODE_COUNT],
    feedback: Option<RenderTarget>,
}

impl TargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last observed viewport size.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    /// Records the viewport size; any change destroys every target.
    /// Returns `true` when targets were invalidated.
    pub fn observe_viewport<G: Gpu>(&mut self, gpu: &G, width: u32, height: u32) -> bool {
        let next = (width.max(1), height.max(1));
        if self.size == Some(next) {
            return false;
        }
        let previous = self.size.replace(next);
        let destroyed = self.destroy_all(gpu);
        if previous.is_some() {
            tracing::debug!(
                width = next.0,
                height = next.1,
                destroyed,
                "viewport changed; render targets invalidated"
            );
        }
        true
    }

    fn slot_mut(&mut self, key: TargetKey) -> Option<&mut Option<RenderTarget>> {
        match key {
            TargetKey::Main => Some(&mut self.main),
            TargetKey::Node(index) => self.nodes.get_mut(index),
            TargetKey::Feedback => Some(&mut self.feedback),
        }
    }

    pub fn get(&self, key: TargetKey) -> Option<RenderTarget> {
        match key {
            TargetKey::Main => self.main,
            TargetKey::Node(index) => self.nodes.get(index).copied().flatten(),
            TargetKey::Feedback => self.feedback,
        }
    }

    /// Returns the target for `key`, creating it at the observed size first
    /// if needed.
    pub fn ensure<G: Gpu>(&mut self, gpu: &G, key: TargetKey) -> Result<RenderTarget, TargetError> {
        let (width, height) = self.size.unwrap_or((1, 1));
        let Some(slot) = self.slot_mut(key) else {
            return Err(TargetError::CreateObject {
                object: "slot",
                reason: format!("no target slot for {key:?}"),
            });
        };
        if let Some(target) = *slot {
            return Ok(target);
        }
        let target = create_target(gpu, width, height)?;
        *slot = Some(target);
        Ok(target)
    }

    /// Destroys the target for `key`, if any. The next [`ensure`] creates a
    /// freshly cleared one.
    ///
    /// [`ensure`]: TargetCache::ensure
    pub fn release<G: Gpu>(&mut self, gpu: &G, key: TargetKey) -> bool {
        match self.slot_mut(key).and_then(Option::take) {
            Some(target) => {
                destroy_target(gpu, target);
                true
            }
            None => false,
        }
    }

    /// Every live target, in no particular order.
    pub fn live(&self) -> impl Iterator<Item = RenderTarget> + '_ {
        std::iter::once(self.main)
            .chain(self.nodes.iter().copied())
            .chain(std::iter::once(self.feedback))
            .flatten()
    }

    /// Destroys every target and returns how many were released.
    pub fn destroy_all<G: Gpu>(&mut self, gpu: &G) -> usize {
        let mut destroyed = 0;
        for target in std::iter::once(self.main.take())
            .chain(self.nodes.iter_mut().map(Option::take))
            .chain(std::iter::once(self.feedback.take()))
            .flatten()
        {
            destroy_target(gpu, target);
            destroyed += 1;
        }
        destroyed
    }
}
