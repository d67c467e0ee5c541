//! Thread-safe control surface consumed by UI and API layers.
//!
//! A [`ControlHandle`] is cheap to clone and can be driven from any thread.
//! The render thread reads it once per frame; nothing written here touches the
//! GPU directly. Slot indices outside `0..NODE_COUNT` are ignored by setters
//! and read back as inactive, zero-valued, unnamed and unloaded.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::{NodeLayout, SlotIndex, NODE_COUNT};

#[derive(Debug, Clone, Default, PartialEq)]
struct SlotControl {
    active: bool,
    value: f32,
    shader_name: Option<String>,
    loaded: bool,
}

#[derive(Debug, Default)]
struct ControlState {
    slots: [SlotControl; NODE_COUNT],
    pending_main: Option<PathBuf>,
    loaded_main: Option<PathBuf>,
    reinit_requested: bool,
    dropped_video_frames: u64,
}

/// Point-in-time copy of one slot's control state.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotStatus {
    pub index: usize,
    pub active: bool,
    pub value: f32,
    pub shader_name: Option<String>,
    pub loaded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlSnapshot {
    pub slots: Vec<SlotStatus>,
    pub main_shader: Option<PathBuf>,
    pub pending_main: Option<PathBuf>,
    pub dropped_video_frames: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ControlHandle {
    inner: Arc<Mutex<ControlState>>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds names, initial activation and values from a layout.
    pub fn from_layout(layout: &NodeLayout) -> Self {
        let handle = Self::new();
        {
            let mut state = handle.lock();
            for index in SlotIndex::all() {
                if let Some(spec) = layout.slot(index) {
                    let slot = &mut state.slots[index.get()];
                    slot.active = spec.active;
                    slot.value = spec.value.clamp(0.0, 1.0);
                    slot.shader_name = Some(spec.file.clone());
                }
            }
        }
        handle
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn slot_active(&self, slot: usize) -> bool {
        SlotIndex::new(slot)
            .map(|index| self.lock().slots[index.get()].active)
            .unwrap_or(false)
    }

    pub fn set_slot_active(&self, slot: usize, active: bool) {
        if let Some(index) = SlotIndex::new(slot) {
            self.lock().slots[index.get()].active = active;
        }
    }

    /// Flips the activation flag and returns the new state.
    pub fn toggle_slot(&self, slot: usize) -> bool {
        match SlotIndex::new(slot) {
            Some(index) => {
                let mut state = self.lock();
                let entry = &mut state.slots[index.get()];
                entry.active = !entry.active;
                entry.active
            }
            None => false,
        }
    }

    pub fn slot_value(&self, slot: usize) -> f32 {
        SlotIndex::new(slot)
            .map(|index| self.lock().slots[index.get()].value)
            .unwrap_or(0.0)
    }

    /// Stores `value` clamped into `[0, 1]`. NaN is ignored.
    pub fn set_slot_value(&self, slot: usize, value: f32) {
        if value.is_nan() {
            return;
        }
        if let Some(index) = SlotIndex::new(slot) {
            self.lock().slots[index.get()].value = value.clamp(0.0, 1.0);
        }
    }

    pub fn slot_shader_name(&self, slot: usize) -> Option<String> {
        SlotIndex::new(slot).and_then(|index| self.lock().slots[index.get()].shader_name.clone())
    }

    pub fn is_slot_shader_loaded(&self, slot: usize) -> bool {
        SlotIndex::new(slot)
            .map(|index| self.lock().slots[index.get()].loaded)
            .unwrap_or(false)
    }

    /// Records the main shader to load on the next frame.
    ///
    /// Only intent is stored here; the file is read, and any error reported,
    /// by the render thread.
    pub fn set_main_shader_path(&self, path: impl AsRef<Path>) -> String {
        let path = path.as_ref().to_path_buf();
        let message = format!("loading {}", path.display());
        self.lock().pending_main = Some(path);
        message
    }

    /// Asks the render thread to tear down and rebuild the whole surface,
    /// node programs included.
    pub fn request_reinit(&self) {
        self.lock().reinit_requested = true;
    }

    pub fn dropped_video_frames(&self) -> u64 {
        self.lock().dropped_video_frames
    }

    pub fn main_shader(&self) -> Option<PathBuf> {
        self.lock().loaded_main.clone()
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        let state = self.lock();
        ControlSnapshot {
            slots: state
                .slots
                .iter()
                .enumerate()
                .map(|(index, slot)| SlotStatus {
                    index,
                    active: slot.active,
                    value: slot.value,
                    shader_name: slot.shader_name.clone(),
                    loaded: slot.loaded,
                })
                .collect(),
            main_shader: state.loaded_main.clone(),
            pending_main: state.pending_main.clone(),
            dropped_video_frames: state.dropped_video_frames,
        }
    }

    pub(crate) fn take_pending_main(&self) -> Option<PathBuf> {
        self.lock().pending_main.take()
    }

    pub(crate) fn take_reinit(&self) -> bool {
        std::mem::take(&mut self.lock().reinit_requested)
    }

    /// Activation flag and value of every slot, read under one lock.
    pub(crate) fn slot_states(&self) -> [(bool, f32); NODE_COUNT] {
        let state = self.lock();
        std::array::from_fn(|index| (state.slots[index].active, state.slots[index].value))
    }

    pub(crate) fn publish_slot(&self, slot: SlotIndex, shader_name: Option<String>, loaded: bool) {
        let mut state = self.lock();
        let entry = &mut state.slots[slot.get()];
        entry.shader_name = shader_name;
        entry.loaded = loaded;
    }

    pub(crate) fn publish_main(&self, path: Option<PathBuf>) {
        self.lock().loaded_main = path;
    }

    pub(crate) fn publish_dropped_video_frames(&self, dropped: u64) {
        self.lock().dropped_video_frames = dropped;
    }
}
