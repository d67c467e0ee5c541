use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use crate::runtime::RenderPolicy;

/// Number of post-processing slots in the node chain.
pub const NODE_COUNT: usize = 6;

/// Index of a node slot, guaranteed to lie in `0..NODE_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub fn new(index: usize) -> Option<Self> {
        (index < NODE_COUNT).then_some(Self(index))
    }

    pub fn get(self) -> usize {
        self.0
    }

    /// Iterates every slot in composition order.
    pub fn all() -> impl Iterator<Item = SlotIndex> {
        (0..NODE_COUNT).map(SlotIndex)
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Semantic role of a node; decides which scalar uniform carries its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Saturation,
    Distortion,
    /// Temporal echo. The only role that reads the feedback buffer and keeps
    /// its target uncleared between frames.
    Delay,
    Pixelate,
    Vignette,
    Custom,
}

impl NodeRole {
    pub fn default_uniform(self) -> Option<&'static str> {
        match self {
            NodeRole::Saturation => Some("u_saturation"),
            NodeRole::Distortion => Some("u_distortion"),
            NodeRole::Delay => Some("u_feedback_amount"),
            NodeRole::Pixelate => Some("u_pixelate"),
            NodeRole::Vignette => Some("u_darkness"),
            NodeRole::Custom => None,
        }
    }

    pub fn is_feedback(self) -> bool {
        matches!(self, NodeRole::Delay)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Saturation => "saturation",
            NodeRole::Distortion => "distortion",
            NodeRole::Delay => "delay",
            NodeRole::Pixelate => "pixelate",
            NodeRole::Vignette => "vignette",
            NodeRole::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Everything the compositor needs to know about one configured slot.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    /// Shader file name, resolved against [`NodeLayout::post_dir`].
    pub file: String,
    pub role: NodeRole,
    /// Uniform receiving the slot value.
    pub uniform: String,
    pub value: f32,
    pub active: bool,
}

impl NodeSpec {
    /// Builds a spec using the role's default uniform name.
    pub fn new(file: impl Into<String>, role: NodeRole) -> Self {
        Self {
            file: file.into(),
            role,
            uniform: role.default_uniform().unwrap_or_default().to_string(),
            value: 1.0,
            active: false,
        }
    }

    pub fn with_uniform(mut self, uniform: impl Into<String>) -> Self {
        self.uniform = uniform.into();
        self
    }

    pub fn with_value(mut self, value: f32) -> Self {
        self.value = value.clamp(0.0, 1.0);
        self
    }

    pub fn activated(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Fixed slot-to-file mapping for the node chain.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLayout {
    post_dir: PathBuf,
    slots: [Option<NodeSpec>; NODE_COUNT],
}

impl NodeLayout {
    pub fn new(post_dir: impl Into<PathBuf>) -> Self {
        Self {
            post_dir: post_dir.into(),
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Assigns `spec` to `slot`. At most one slot may carry the delay role.
    pub fn set_slot(&mut self, slot: usize, spec: NodeSpec) -> Result<()> {
        if slot >= NODE_COUNT {
            anyhow::bail!(
                "slot {} exceeds supported node count ({})",
                slot,
                NODE_COUNT
            );
        }
        if spec.uniform.is_empty() {
            anyhow::bail!("slot {slot} ({}) has no uniform to drive", spec.file);
        }
        if spec.role.is_feedback() {
            if let Some(existing) = self.feedback_slot().filter(|index| index.get() != slot) {
                anyhow::bail!("slot {existing} already carries the delay role");
            }
        }
        self.slots[slot] = Some(spec);
        Ok(())
    }

    pub fn post_dir(&self) -> &Path {
        &self.post_dir
    }

    pub fn slot(&self, slot: SlotIndex) -> Option<&NodeSpec> {
        self.slots[slot.get()].as_ref()
    }

    pub fn slots(&self) -> &[Option<NodeSpec>; NODE_COUNT] {
        &self.slots
    }

    pub fn feedback_slot(&self) -> Option<SlotIndex> {
        SlotIndex::all().find(|index| {
            self.slot(*index)
                .map(|spec| spec.role.is_feedback())
                .unwrap_or(false)
        })
    }

    /// Absolute path of the shader backing `slot`, if the slot is used.
    pub fn shader_path(&self, slot: SlotIndex) -> Option<PathBuf> {
        self.slot(slot).map(|spec| self.post_dir.join(&spec.file))
    }
}

impl Default for NodeLayout {
    fn default() -> Self {
        Self::new(PathBuf::new())
    }
}

/// Media file played on the secondary video surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSource {
    pub path: PathBuf,
    pub looping: bool,
}

/// Immutable configuration passed to the renderer at start-up.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Initial window size in physical pixels.
    pub surface_size: (u32, u32),
    /// Main fragment shader; `None` keeps the built-in fallback on screen.
    pub shader_source: Option<PathBuf>,
    pub nodes: NodeLayout,
    /// Interval at which the loaded main shader is checked for edits.
    pub reload_poll: Option<Duration>,
    /// When set, the window shows this video instead of the shader chain.
    pub video: Option<VideoSource>,
    pub policy: RenderPolicy,
    pub title: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            surface_size: (1280, 720),
            shader_source: None,
            nodes: NodeLayout::default(),
            reload_poll: None,
            video: None,
            policy: RenderPolicy::default(),
            title: "shadechain".to_string(),
        }
    }
}
