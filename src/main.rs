use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use client::{ComfyClient, GenerationServer};
use config::{ExploreConfig, ExpressionConfig};
use log::{debug, error, info, LevelFilter};
use state::StateTracker;

mod axis;
mod client;
mod config;
mod error;
mod expander;
mod explore;
mod expressions;
mod prompt;
mod state;
mod utils;
mod workflow;

#[derive(Parser, Debug)]
#[command(version, about = "Batch orchestration for a running ComfyUI server")]
struct CommandLineFlags {
    /// Config file (.yaml, .yml, .json or .toml).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,
    /// -v for debug output, -vv for trace. RUST_LOG overrides this.
    #[arg(long, short, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Write the log to this file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
    /// Don't talk to ComfyUI at all; only write the metadata that would be produced.
    #[arg(long, global = true)]
    pub dry_run: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render every choice of one prompt axis that hasn't been explored yet.
    Explore {
        /// Explore this axis instead of a random unexplored one.
        #[arg(long)]
        axis: Option<String>,
        /// Print exploration progress and exit.
        #[arg(long)]
        progress: bool,
        /// Forget every explored axis and exit.
        #[arg(long, conflicts_with = "forget")]
        reset: bool,
        /// Mark one axis as unexplored again and exit.
        #[arg(long, value_name = "AXIS")]
        forget: Option<String>,
    },
    /// Run each image in a folder through an ExpressionPreset workflow.
    Expressions {
        #[arg(long, short)]
        images_dir: PathBuf,
        /// Also look in subdirectories.
        #[arg(long)]
        recursive: bool,
        /// Process only the first N images (0 = all).
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_default_env();
    if let Some(path) = log_file {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

async fn connect(url: &str, retry: config::RetryPolicy, dry_run: bool) -> Result<ComfyClient> {
    let client = ComfyClient::new(url, retry).context("failed to create ComfyUI client")?;
    if !dry_run && !client.is_alive().await {
        bail!("ComfyUI is not reachable at {}", client.base_url());
    }
    Ok(client)
}

async fn run_explore(
    flags: &CommandLineFlags,
    axis: Option<&str>,
    progress: bool,
    reset: bool,
    forget: Option<&str>,
) -> Result<()> {
    let path = flags.config.clone().unwrap_or_else(|| PathBuf::from("config/explore.yaml"));
    let mut config = ExploreConfig::load(&path).context("failed to initialize config")?;
    if let Some(url) = config::comfy_url_override() {
        info!("Using COMFY_URL={}", url);
        config.execution.comfy_url = url;
    }
    debug!("Loaded config: {:?}", config);

    if reset || forget.is_some() || progress {
        let mut state =
            StateTracker::open(&config.execution.state_file).context("failed to open state file")?;
        if reset {
            state.reset().context("failed to reset state")?;
            println!("Exploration state reset ({})", state.path().display());
        }
        if let Some(axis) = forget {
            if state.forget(axis).context("failed to update state")? {
                println!("Axis '{}' is unexplored again", axis);
            } else {
                println!("Axis '{}' was not explored", axis);
            }
        }
        if progress {
            let progress = state.progress(&config.axis_names());
            println!("{}", explore::format_progress(&progress));
            if let Some(when) = state.last_updated() {
                println!("  last updated: {}", when.to_rfc3339());
            }
            for axis in &progress.remaining {
                let runs = expander::count_runs(
                    &config.prompt_template,
                    &config.sampler_choices,
                    config.lora_choices.as_ref(),
                    axis,
                )?;
                println!("  {:<24} {} runs x {} repeats", axis, runs, config.execution.repeats);
            }
        }
        return Ok(());
    }

    let retry = config.execution.retry.clone();
    let client = connect(&config.execution.comfy_url, retry, flags.dry_run).await?;
    let summary = explore::explore(&config, &client, axis, flags.dry_run, &mut rand::thread_rng())
        .await
        .context("exploration failed")?;
    match summary {
        None => println!("All axes have been explored. Use --reset or --forget to start over."),
        Some(s) if s.aborted => bail!("batch for axis '{}' aborted after a failed run", s.axis),
        Some(s) => println!(
            "Axis '{}': {} runs, {} images, {} completed, {} failed, {} timed out{}",
            s.axis,
            s.runs,
            s.images,
            s.completed,
            s.failed,
            s.timed_out,
            if s.marked_used { "; marked as explored" } else { "" }
        ),
    }
    Ok(())
}

async fn run_expressions(
    flags: &CommandLineFlags,
    images_dir: &Path,
    recursive: bool,
    limit: usize,
) -> Result<()> {
    let path = flags.config.clone().unwrap_or_else(|| PathBuf::from("config/expressions.yaml"));
    let mut config = ExpressionConfig::load(&path).context("failed to initialize config")?;
    if let Some(url) = config::comfy_url_override() {
        info!("Using COMFY_URL={}", url);
        config.comfy_url = url;
    }
    debug!("Loaded config: {:?}", config);

    let client = connect(&config.comfy_url, config.run.retry.clone(), flags.dry_run).await?;
    let options = expressions::BatchOptions {
        images_dir: images_dir.to_owned(),
        recursive,
        limit,
        dry_run: flags.dry_run,
    };
    let s = expressions::run_expressions(&config, &client, &options)
        .await
        .context("expression batch failed")?;
    println!(
        "{} images ({} skipped), {} runs: {} completed, {} failed, {} timed out",
        s.images, s.skipped_images, s.runs, s.completed, s.failed, s.timed_out
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = CommandLineFlags::parse();
    init_logging(args.verbose, args.log_file.as_deref())?;

    // Immediately crash on panic.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    let result = match &args.command {
        Command::Explore {
            axis,
            progress,
            reset,
            forget,
        } => run_explore(&args, axis.as_deref(), *progress, *reset, forget.as_deref()).await,
        Command::Expressions {
            images_dir,
            recursive,
            limit,
        } => run_expressions(&args, images_dir, *recursive, *limit).await,
    };
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = CommandLineFlags::try_parse_from([
            "comfy-explorer",
            "-vv",
            "--dry-run",
            "explore",
            "--axis",
            "hair_color",
            "-c",
            "cfg.yaml",
        ])
        .unwrap();
        assert_eq!(flags.verbose, 2);
        assert!(flags.dry_run);
        assert_eq!(flags.config, Some(PathBuf::from("cfg.yaml")));
        assert!(matches!(
            flags.command,
            Command::Explore { axis: Some(ref a), .. } if a == "hair_color"
        ));

        let flags = CommandLineFlags::try_parse_from([
            "comfy-explorer",
            "expressions",
            "-i",
            "imgs",
            "--limit",
            "3",
        ])
        .unwrap();
        assert!(matches!(flags.command, Command::Expressions { limit: 3, recursive: false, .. }));

        let conflicting = ["comfy-explorer", "explore", "--reset", "--forget", "x"];
        assert!(CommandLineFlags::try_parse_from(conflicting).is_err());
        assert!(CommandLineFlags::try_parse_from(["comfy-explorer", "expressions"]).is_err());
    }
}
