mod bindings;
mod cli;
mod commands;
mod paths;
mod run;

use std::path::Path;

use anyhow::{Context, Result};
use chainconfig::ChainConfig;
use cli::{Command, ConfigAction};
use paths::AppPaths;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Some(Command::Config(config_cmd)) => handle_config_command(config_cmd.action, &cli.run),
        None => run::run(cli.run),
    }
}

fn handle_config_command(action: ConfigAction, args: &cli::RunArgs) -> Result<()> {
    match action {
        ConfigAction::Check { file } => run_config_check(&file),
        ConfigAction::Show => run_config_show(args),
    }
}

fn run_config_check(file: &Path) -> Result<()> {
    let config = ChainConfig::load(file)
        .with_context(|| format!("{} is not a valid chain mapping", file.display()))?;
    let used = config.slots.iter().filter(|slot| !slot.is_unused()).count();
    println!("{}: ok ({used} slot(s) in use)", file.display());
    if let Some(slot) = config.feedback_slot() {
        println!("  feedback node: slot {slot}");
    }
    Ok(())
}

fn run_config_show(args: &cli::RunArgs) -> Result<()> {
    let paths = AppPaths::discover()?;
    let chain = run::load_chain(args.chain.as_deref(), &paths)?;
    let post_dir = run::resolve_post_dir(args.post_dir.as_deref(), &chain, &paths);

    println!("Directories:");
    println!("  config:  {}", paths.config_dir().display());
    println!("  data:    {}", paths.data_dir().display());
    println!("  shaders: {}", paths.shader_dir().display());
    println!("  post:    {}", post_dir.display());
    match &chain.source {
        Some(source) => println!("Chain mapping: {}", source.display()),
        None => println!("Chain mapping: built-in"),
    }
    for (index, slot) in chain.config.slots.iter().enumerate() {
        if slot.is_unused() {
            println!("  slot {index}: (unused)");
            continue;
        }
        let exists = post_dir.join(&slot.file).exists();
        println!(
            "  slot {index}: {:<20} role={:<10} uniform={:<18} value={:.2} active={} {}",
            slot.file,
            slot.role().to_string(),
            slot.uniform_name().unwrap_or("-"),
            slot.initial_value(),
            slot.active,
            if exists { "" } else { "(missing)" }
        );
    }
    println!();
    let text = chain
        .config
        .to_toml_string()
        .context("failed to render the effective chain mapping")?;
    print!("{text}");
    Ok(())
}
