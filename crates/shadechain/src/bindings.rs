use std::path::PathBuf;

use anyhow::{Context, Result};
use chainconfig::{ChainConfig, SlotRole};
use renderer::{NodeLayout, NodeRole, NodeSpec};

pub fn map_role(role: SlotRole) -> NodeRole {
    match role {
        SlotRole::Saturation => NodeRole::Saturation,
        SlotRole::Distortion => NodeRole::Distortion,
        SlotRole::Delay => NodeRole::Delay,
        SlotRole::Pixelate => NodeRole::Pixelate,
        SlotRole::Vignette => NodeRole::Vignette,
        SlotRole::Custom => NodeRole::Custom,
    }
}

/// Builds the renderer's node layout from a validated chain mapping.
pub fn node_layout_from_config(config: &ChainConfig, post_dir: PathBuf) -> Result<NodeLayout> {
    let mut layout = NodeLayout::new(post_dir);
    for (index, entry) in config.slots.iter().enumerate() {
        if entry.is_unused() {
            continue;
        }
        let mut spec = NodeSpec::new(entry.file.clone(), map_role(entry.role()))
            .with_value(entry.initial_value())
            .activated(entry.active);
        if let Some(uniform) = entry.uniform_name() {
            spec = spec.with_uniform(uniform);
        }
        layout
            .set_slot(index, spec)
            .with_context(|| format!("invalid slot {index} ({})", entry.file))?;
    }
    Ok(layout)
}
