use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chainconfig::ChainConfig;
use renderer::{NodeLayout, RenderPolicy, Renderer, RendererConfig, VideoSource};
use tracing_subscriber::EnvFilter;

use crate::bindings::node_layout_from_config;
use crate::cli::RunArgs;
use crate::commands::spawn_stdin_reader;
use crate::paths::AppPaths;

const DEFAULT_SURFACE: (u32, u32) = (1280, 720);

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// A chain mapping together with the directory its relative paths hang off.
#[derive(Debug, Clone)]
pub struct LoadedChain {
    pub config: ChainConfig,
    pub source: Option<PathBuf>,
    pub base_dir: PathBuf,
}

/// Loads the chain named on the command line, else the user's `chain.toml`,
/// else the built-in mapping.
pub fn load_chain(explicit: Option<&Path>, paths: &AppPaths) -> Result<LoadedChain> {
    let candidate = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => Some(paths.chain_file()).filter(|path| path.exists()),
    };
    match candidate {
        Some(path) => {
            let config = ChainConfig::load(&path)
                .with_context(|| format!("failed to load chain mapping {}", path.display()))?;
            let base_dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            Ok(LoadedChain {
                config,
                source: Some(path),
                base_dir,
            })
        }
        None => Ok(LoadedChain {
            config: ChainConfig::builtin(),
            source: None,
            base_dir: paths.config_dir().to_path_buf(),
        }),
    }
}

/// `--post-dir` first, then the chain file's `post_dir`, then the data
/// directory.
pub fn resolve_post_dir(args_post_dir: Option<&Path>, chain: &LoadedChain, paths: &AppPaths) -> PathBuf {
    args_post_dir
        .map(Path::to_path_buf)
        .or_else(|| chain.config.post_dir_from(&chain.base_dir))
        .unwrap_or_else(|| paths.post_dir())
}

pub fn render_policy(args: &RunArgs) -> RenderPolicy {
    if let Some(path) = &args.still_export {
        return RenderPolicy::Export {
            time: args.still_time,
            path: path.clone(),
        };
    }
    if args.still {
        return RenderPolicy::Still {
            time: args.still_time,
        };
    }
    RenderPolicy::Animate {
        target_fps: args.fps.filter(|fps| *fps > 0.0),
    }
}

pub fn build_renderer_config(args: &RunArgs, paths: &AppPaths) -> Result<RendererConfig> {
    let chain = load_chain(args.chain.as_deref(), paths)?;
    let post_dir = resolve_post_dir(args.post_dir.as_deref(), &chain, paths);
    let mut nodes: NodeLayout = node_layout_from_config(&chain.config, post_dir)?;
    if let Some(activate) = &args.activate {
        activate_slots(&mut nodes, &activate.0)?;
    }
    tracing::debug!(
        chain = ?chain.source,
        post_dir = %nodes.post_dir().display(),
        "resolved node chain"
    );

    Ok(RendererConfig {
        surface_size: args.size.unwrap_or(DEFAULT_SURFACE),
        shader_source: args
            .shader
            .as_deref()
            .map(|shader| paths.resolve_shader(shader)),
        nodes,
        reload_poll: chain.config.reload_poll,
        video: args.video.as_ref().map(|path| VideoSource {
            path: path.clone(),
            looping: args.loop_video,
        }),
        policy: render_policy(args),
        ..RendererConfig::default()
    })
}

fn activate_slots(nodes: &mut NodeLayout, slots: &[usize]) -> Result<()> {
    for &slot in slots {
        let index = renderer::SlotIndex::new(slot)
            .with_context(|| format!("slot {slot} out of range"))?;
        let Some(spec) = nodes.slot(index).cloned() else {
            tracing::warn!(slot, "--activate names an unused slot; ignoring");
            continue;
        };
        nodes.set_slot(slot, spec.activated(true))?;
    }
    Ok(())
}

pub fn run(args: RunArgs) -> Result<()> {
    let paths = AppPaths::discover()?;
    tracing::debug!(
        config = %paths.config_dir().display(),
        data = %paths.data_dir().display(),
        "resolved shadechain paths"
    );
    let config = build_renderer_config(&args, &paths)?;
    if config.shader_source.is_none() && config.video.is_none() {
        tracing::info!("no main shader given; starting with the built-in fallback");
    }

    let renderer = Renderer::new(config)?;
    if args.stdin_control {
        spawn_stdin_reader(renderer.controls(), renderer.proxy())?;
        tracing::info!("reading control commands from stdin");
    }
    renderer.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::SlotList;
    use clap::Parser;
    use renderer::SlotIndex;
    use std::fs;
    use tempfile::TempDir;

    fn args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["shadechain"];
        argv.extend_from_slice(extra);
        crate::cli::Cli::try_parse_from(argv).unwrap().run
    }

    fn temp_paths(root: &TempDir) -> AppPaths {
        AppPaths::from_raw(root.path().join("config"), root.path().join("data"))
    }

    #[test]
    fn builtin_chain_when_no_file_exists() {
        let root = TempDir::new().unwrap();
        let paths = temp_paths(&root);
        let chain = load_chain(None, &paths).unwrap();
        assert!(chain.source.is_none());
        assert_eq!(chain.config, ChainConfig::builtin());
        assert_eq!(resolve_post_dir(None, &chain, &paths), paths.post_dir());
    }

    #[test]
    fn chain_file_post_dir_is_relative_to_file() {
        let root = TempDir::new().unwrap();
        let paths = temp_paths(&root);
        fs::create_dir_all(paths.config_dir()).unwrap();
        fs::write(
            paths.chain_file(),
            "version = 1\npost_dir = \"fx\"\nreload_poll = \"250ms\"\n",
        )
        .unwrap();

        let chain = load_chain(None, &paths).unwrap();
        assert_eq!(chain.source.as_deref(), Some(paths.chain_file().as_path()));
        assert_eq!(
            resolve_post_dir(None, &chain, &paths),
            paths.config_dir().join("fx")
        );
        assert_eq!(
            resolve_post_dir(Some(Path::new("/elsewhere")), &chain, &paths),
            PathBuf::from("/elsewhere")
        );
    }

    #[test]
    fn explicit_missing_chain_is_an_error() {
        let root = TempDir::new().unwrap();
        let paths = temp_paths(&root);
        assert!(load_chain(Some(&root.path().join("nope.toml")), &paths).is_err());
    }

    #[test]
    fn policy_selection() {
        assert_eq!(
            render_policy(&args(&["--fps", "0"])),
            RenderPolicy::Animate { target_fps: None }
        );
        assert_eq!(
            render_policy(&args(&["--still", "--still-time", "3"])),
            RenderPolicy::Still { time: Some(3.0) }
        );
        assert_eq!(
            render_policy(&args(&["--still-export", "out.png"])),
            RenderPolicy::Export {
                time: None,
                path: PathBuf::from("out.png")
            }
        );
    }

    #[test]
    fn activate_flag_turns_on_configured_slots() {
        let root = TempDir::new().unwrap();
        let paths = temp_paths(&root);
        let mut run_args = args(&["--size", "640x360"]);
        run_args.activate = Some(SlotList(vec![0, 2, 5]));
        let config = build_renderer_config(&run_args, &paths).unwrap();

        assert_eq!(config.surface_size, (640, 360));
        let active: Vec<usize> = SlotIndex::all()
            .filter(|index| config.nodes.slot(*index).map(|spec| spec.active).unwrap_or(false))
            .map(SlotIndex::get)
            .collect();
        // Slot 5 is unused in the built-in mapping.
        assert_eq!(active, vec![0, 2]);
        assert!(config.video.is_none());
    }
}
