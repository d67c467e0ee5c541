//! Node Chain Compositor.
//!
//! Six ordered slots, each with its own program, activation flag, scalar value
//! and render target. A frame either renders the main program straight to the
//! screen (no live node) or runs the chained path:
//!
//! ```text
//!   main ─▶ [Main target] ─▶ node 0 ─▶ node 1 ─▶ … ─▶ node 5 ─▶ screen
//!                                 ▲ (delay node only)   │
//!                                 └── [Feedback] ◀──────┘ copied after the loop
//! ```
//!
//! A node is live when it is active *and* its program built. Dead nodes are
//! skipped without disturbing the order of the others.

use std::fs;
use std::path::PathBuf;

use crate::control::ControlHandle;
use crate::gl::Gpu;
use crate::program::{self, GraphicsProgram};
use crate::target::{RenderTarget, TargetCache, TargetError, TargetKey, BACKGROUND};
use crate::types::{NodeLayout, NodeSpec, SlotIndex, NODE_COUNT};

/// Texture unit of the primary input sampler.
const INPUT_UNIT: u32 = 0;
/// Texture unit of the delay node's previous-frame sampler.
const FEEDBACK_UNIT: u32 = 1;

#[derive(Debug, Default)]
pub struct ProcessingNode {
    spec: Option<NodeSpec>,
    program: Option<GraphicsProgram>,
    active: bool,
    value: f32,
}

impl ProcessingNode {
    pub fn spec(&self) -> Option<&NodeSpec> {
        self.spec.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.program.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    fn is_feedback(&self) -> bool {
        self.spec
            .as_ref()
            .map(|spec| spec.role.is_feedback())
            .unwrap_or(false)
    }

    fn live_program(&self) -> Option<&GraphicsProgram> {
        if self.active {
            self.program.as_ref()
        } else {
            None
        }
    }
}

/// Per-frame inputs shared by every pass.
#[derive(Debug, Clone, Copy)]
pub struct FrameParams {
    pub time: f32,
    pub width: u32,
    pub height: u32,
}

/// Which path a frame took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePath {
    Direct,
    Chained { nodes_drawn: usize },
}

#[derive(Debug, Default)]
pub struct NodeChain {
    nodes: [ProcessingNode; NODE_COUNT],
}

impl NodeChain {
    /// Reads and builds every configured slot. Missing files and build
    /// failures are logged and leave the slot unloaded.
    pub fn load<G: Gpu>(gpu: &G, layout: &NodeLayout) -> Self {
        let mut chain = Self::default();
        for index in SlotIndex::all() {
            let Some(spec) = layout.slot(index) else {
                continue;
            };
            let node = &mut chain.nodes[index.get()];
            node.active = spec.active;
            node.value = spec.value.clamp(0.0, 1.0);
            node.spec = Some(spec.clone());

            let path: PathBuf = layout.post_dir().join(&spec.file);
            let source = match fs::read_to_string(&path) {
                Ok(source) => source,
                Err(err) => {
                    tracing::warn!(
                        slot = index.get(),
                        path = %path.display(),
                        error = %err,
                        "node shader unavailable; slot stays unloaded"
                    );
                    continue;
                }
            };
            match program::build_fragment(gpu, &source) {
                Ok(program) => {
                    tracing::debug!(slot = index.get(), role = %spec.role, path = %path.display(), "node shader loaded");
                    node.program = Some(program);
                }
                Err(err) => {
                    tracing::warn!(
                        slot = index.get(),
                        path = %path.display(),
                        error = %err,
                        "node shader failed to build; slot stays unloaded"
                    );
                    if let Some(source) = err.transformed_source() {
                        tracing::debug!(slot = index.get(), "transformed source:\n{source}");
                    }
                }
            }
        }
        chain
    }

    pub fn node(&self, slot: SlotIndex) -> &ProcessingNode {
        &self.nodes[slot.get()]
    }

    /// Pushes slot names and load status to the control surface.
    pub fn publish(&self, controls: &ControlHandle) {
        for index in SlotIndex::all() {
            let node = self.node(index);
            controls.publish_slot(
                index,
                node.spec.as_ref().map(|spec| spec.file.clone()),
                node.is_loaded(),
            );
        }
    }

    /// Copies activation flags and values from the control surface.
    pub fn sync(&mut self, controls: &ControlHandle) {
        for (node, (active, value)) in self.nodes.iter_mut().zip(controls.slot_states()) {
            node.active = active && node.spec.is_some();
            node.value = value;
        }
    }

    pub fn set_active(&mut self, slot: SlotIndex, active: bool) {
        let node = &mut self.nodes[slot.get()];
        node.active = active && node.spec.is_some();
    }

    pub fn set_value(&mut self, slot: SlotIndex, value: f32) {
        if !value.is_nan() {
            self.nodes[slot.get()].value = value.clamp(0.0, 1.0);
        }
    }

    /// True when at least one node is active with a built program.
    pub fn needs_chain(&self) -> bool {
        self.nodes.iter().any(|node| node.live_program().is_some())
    }

    /// Renders one frame. The vertex array must already be bound.
    pub fn render<G: Gpu>(
        &self,
        gpu: &G,
        targets: &mut TargetCache,
        main: &GraphicsProgram,
        passthrough: &GraphicsProgram,
        frame: FrameParams,
    ) -> Result<FramePath, TargetError> {
        self.release_idle_history(gpu, targets);
        if !self.needs_chain() {
            bind_screen(gpu, frame);
            gpu.clear(BACKGROUND);
            main.bind(gpu);
            main.set_frame_uniforms(gpu, frame.time, frame.width, frame.height);
            gpu.draw_triangles(3);
            return Ok(FramePath::Direct);
        }

        let main_target = targets.ensure(gpu, TargetKey::Main)?;
        main_target.bind(gpu);
        gpu.clear(BACKGROUND);
        main.bind(gpu);
        main.set_frame_uniforms(gpu, frame.time, frame.width, frame.height);
        gpu.draw_triangles(3);

        let mut current = main_target;
        let mut nodes_drawn = 0;
        let mut feedback_output = None;
        for (index, node) in self.nodes.iter().enumerate() {
            let Some(program) = node.live_program() else {
                continue;
            };
            let Some(spec) = node.spec.as_ref() else {
                continue;
            };
            // Targets are created before any input is bound: creation
            // rebinds texture unit 0 and the default framebuffer.
            let target = targets.ensure(gpu, TargetKey::Node(index))?;
            let feedback = if node.is_feedback() {
                Some(targets.ensure(gpu, TargetKey::Feedback)?)
            } else {
                None
            };
            target.bind(gpu);
            if feedback.is_none() {
                gpu.clear(BACKGROUND);
            }

            program.bind(gpu);
            program.set_frame_uniforms(gpu, frame.time, frame.width, frame.height);
            bind_input(gpu, INPUT_UNIT, &current);
            program.set_sampler(gpu, "u_texture", INPUT_UNIT);
            if let Some(feedback) = feedback {
                bind_input(gpu, FEEDBACK_UNIT, &feedback);
                program.set_sampler(gpu, "u_feedback", FEEDBACK_UNIT);
                feedback_output = Some(target);
            }
            program.set_f32(gpu, &spec.uniform, node.value);
            gpu.draw_triangles(3);

            current = target;
            nodes_drawn += 1;
        }

        if let Some(output) = feedback_output {
            unbind_input(gpu, FEEDBACK_UNIT);
            let feedback = targets.ensure(gpu, TargetKey::Feedback)?;
            feedback.bind(gpu);
            blit(gpu, passthrough, &output, false);
        }

        bind_screen(gpu, frame);
        gpu.clear(BACKGROUND);
        blit(gpu, passthrough, &current, false);
        unbind_input(gpu, INPUT_UNIT);
        Ok(FramePath::Chained { nodes_drawn })
    }

    /// Drops the history of a delay node that is not live this frame, so a
    /// reactivated node never blends output older than the previous frame.
    fn release_idle_history<G: Gpu>(&self, gpu: &G, targets: &mut TargetCache) {
        for (index, node) in self.nodes.iter().enumerate() {
            if !node.is_feedback() || node.live_program().is_some() {
                continue;
            }
            let released = targets.release(gpu, TargetKey::Node(index));
            if targets.release(gpu, TargetKey::Feedback) || released {
                tracing::debug!(slot = index, "delay node idle; history released");
            }
        }
    }

    pub fn destroy<G: Gpu>(&mut self, gpu: &G) {
        for node in self.nodes.iter_mut() {
            if let Some(program) = node.program.take() {
                program.destroy(gpu);
            }
        }
    }
}

fn bind_screen<G: Gpu>(gpu: &G, frame: FrameParams) {
    gpu.bind_framebuffer(None);
    gpu.viewport(0, 0, frame.width as i32, frame.height as i32);
}

fn bind_input<G: Gpu>(gpu: &G, unit: u32, source: &RenderTarget) {
    gpu.active_texture(unit);
    gpu.bind_texture(Some(source.texture));
}

fn unbind_input<G: Gpu>(gpu: &G, unit: u32) {
    gpu.active_texture(unit);
    gpu.bind_texture(None);
    gpu.active_texture(INPUT_UNIT);
}

/// Draws `source` into the bound framebuffer with the passthrough program.
pub(crate) fn blit<G: Gpu>(
    gpu: &G,
    passthrough: &GraphicsProgram,
    source: &RenderTarget,
    flip_y: bool,
) {
    passthrough.bind(gpu);
    bind_input(gpu, INPUT_UNIT, source);
    passthrough.set_sampler(gpu, "u_texture", INPUT_UNIT);
    passthrough.set_f32(gpu, "u_flip_y", if flip_y { 1.0 } else { 0.0 });
    gpu.draw_triangles(3);
}
