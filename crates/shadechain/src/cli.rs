use std::path::PathBuf;

use clap::{Parser, Subcommand};
use renderer::NODE_COUNT;

#[derive(Parser, Debug)]
#[command(
    name = "shadechain",
    author,
    version,
    about = "Live GLSL shader host with a post-processing chain",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Main fragment shader (path, or file name under the data `shaders/` directory).
    #[arg(value_name = "SHADER")]
    pub shader: Option<PathBuf>,

    /// Chain mapping TOML file (defaults to `chain.toml` in the config directory).
    #[arg(long, value_name = "FILE")]
    pub chain: Option<PathBuf>,

    /// Directory holding the post-processing shaders named by the chain.
    #[arg(long, value_name = "DIR")]
    pub post_dir: Option<PathBuf>,

    /// Initial window size (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_surface_size)]
    pub size: Option<(u32, u32)>,

    /// Optional FPS cap (0=uncapped).
    #[arg(long, value_name = "FPS")]
    pub fps: Option<f32>,

    /// Comma-separated slot indices (0-5) to activate at start-up.
    #[arg(long, value_name = "SLOTS", value_parser = parse_slot_list)]
    pub activate: Option<SlotList>,

    /// Play this media file instead of the shader chain.
    #[arg(long, value_name = "FILE")]
    pub video: Option<PathBuf>,

    /// Restart the video when it reaches the end.
    #[arg(long, requires = "video")]
    pub loop_video: bool,

    /// Render a single still frame instead of animating continuously.
    #[arg(long)]
    pub still: bool,

    /// Timestamp in seconds to evaluate for still/export modes.
    #[arg(long, value_name = "SECONDS")]
    pub still_time: Option<f32>,

    /// Export a still frame to the provided PNG path then exit.
    #[arg(long, value_name = "PATH", conflicts_with = "video")]
    pub still_export: Option<PathBuf>,

    /// Read control commands (`on 0`, `value 1 0.5`, `load FILE`, ...) from stdin.
    #[arg(long)]
    pub stdin_control: bool,
}

/// Validated slot indices from `--activate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotList(pub Vec<usize>);

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect chain configuration files.
    Config(ConfigCommand),
}

#[derive(Parser, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Parse and validate a chain file.
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Print the effective chain mapping and resolved directories.
    Show,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_surface_size(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{value}'"))?;
    let width = width
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid width in '{value}'"))?;
    let height = height
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid height in '{value}'"))?;
    if width == 0 || height == 0 {
        return Err(format!("surface size must be non-zero, got '{value}'"));
    }
    Ok((width, height))
}

pub fn parse_slot_list(value: &str) -> Result<SlotList, String> {
    let mut slots = Vec::new();
    for part in value.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        let slot = part
            .parse::<usize>()
            .map_err(|_| format!("invalid slot '{part}'"))?;
        if slot >= NODE_COUNT {
            return Err(format!("slot {slot} out of range (0-{})", NODE_COUNT - 1));
        }
        if !slots.contains(&slot) {
            slots.push(slot);
        }
    }
    Ok(SlotList(slots))
}
