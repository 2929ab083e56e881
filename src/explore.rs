// The `explore` command: pick one axis that hasn't been explored yet, render every choice of it
// (crossed with the sampler/LoRA lists), and remember the axis once the whole batch succeeded.

use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::{seq::SliceRandom, Rng};
use serde::Serialize;

use crate::{
    client::{GenerationServer, OutputImage, PollOutcome},
    config::{ExploreConfig, FailurePolicy},
    error::{Error, Result},
    expander::{self, AxisValues, LoraSettings, RunPlan, SamplerSettings},
    state::{Progress, StateTracker},
    utils,
    workflow::WorkflowGraph,
};

pub const TOOL_NAME: &str = "prompt_explorer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    TimedOut,
    DryRun,
}

/// What happened to one repeat of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepeatRecord {
    pub repeat: u32,
    pub seed: u64,
    pub status: RunStatus,
    pub server_run_id: Option<String>,
    /// Files saved into the run directory.
    pub outputs: Vec<String>,
    pub error: Option<String>,
}

/// Contents of `meta.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub tool: &'static str,
    pub axis: String,
    pub run_id: String,
    pub index: usize,
    pub positive: String,
    pub negative: String,
    pub sampler: SamplerSettings,
    pub lora: Option<LoraSettings>,
    pub axis_values: AxisValues,
    pub filename_prefix: String,
    pub repeats: Vec<RepeatRecord>,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
}

impl RunMetadata {
    fn new(plan: &RunPlan, run_id: &str, filename_prefix: &str, dry_run: bool) -> Self {
        Self {
            tool: TOOL_NAME,
            axis: plan.target_axis.clone(),
            run_id: run_id.to_owned(),
            index: plan.index,
            positive: plan.positive.clone(),
            negative: plan.negative.clone(),
            sampler: plan.sampler.clone(),
            lora: plan.lora.clone(),
            axis_values: plan.axis_values.clone(),
            filename_prefix: filename_prefix.to_owned(),
            repeats: Vec::new(),
            dry_run,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub axis: String,
    pub runs: usize,
    pub images: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub aborted: bool,
    pub marked_used: bool,
    pub run_dirs: Vec<PathBuf>,
}

impl BatchSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.timed_out == 0 && !self.aborted
    }
}

/// Picks the axis to explore: `requested` if given, otherwise a random unused one.
/// `None` means every axis has been explored.
pub fn select_axis<R: Rng + ?Sized>(
    config: &ExploreConfig,
    state: &StateTracker,
    requested: Option<&str>,
    rng: &mut R,
) -> Result<Option<String>> {
    let names = config.axis_names();
    if let Some(name) = requested {
        let axis = expander::find_axis(&config.prompt_template.axes, name)?;
        if state.is_used(&axis.name) {
            warn!("Axis '{}' was already explored; running it again", axis.name);
        }
        return Ok(Some(axis.name.clone()));
    }
    if state.is_all_used(&names) {
        return Ok(None);
    }
    Ok(state.unused_axes(&names).choose(rng).cloned())
}

pub fn format_progress(progress: &Progress) -> String {
    let mut out = format!(
        "Explored {}/{} axes ({:.1}%)",
        progress.used, progress.total, progress.percentage
    );
    if !progress.used_axes.is_empty() {
        out += &format!("\n  used:      {}", progress.used_axes.join(", "));
    }
    if !progress.remaining.is_empty() {
        out += &format!("\n  remaining: {}", progress.remaining.join(", "));
    }
    out
}

fn save_outputs(run_dir: &Path, repeat: u32, images: &[OutputImage]) -> Result<Vec<String>> {
    let mut saved = Vec::with_capacity(images.len());
    for image in images {
        let name = utils::safe_filename(&format!("r{}_{}", repeat, image.filename), 120);
        let path = run_dir.join(&name);
        std::fs::write(&path, &image.bytes)
            .map_err(|e| Error::io(format!("failed to write {}", path.display()), e))?;
        saved.push(name);
    }
    Ok(saved)
}

/// Submits one patched graph and waits for it.
/// Only connection-level and rejected-workflow errors escape. Timeouts, execution
/// failures and outputs that can't be downloaded or saved end up in the record.
async fn execute<S: GenerationServer>(
    server: &S,
    config: &ExploreConfig,
    graph: &WorkflowGraph,
    run_dir: &Path,
    repeat: u32,
    seed: u64,
) -> Result<RepeatRecord> {
    let run_id = server.submit(graph).await?;
    let mut record = RepeatRecord {
        repeat,
        seed,
        status: RunStatus::Completed,
        server_run_id: Some(run_id.clone()),
        outputs: Vec::new(),
        error: None,
    };
    match server.poll(&run_id, config.poll_interval(), config.timeout()).await? {
        PollOutcome::Completed => {
            if config.workflow.download_outputs {
                let saved = server.fetch_outputs(&run_id).await;
                match saved.and_then(|images| save_outputs(run_dir, repeat, &images)) {
                    Ok(outputs) => record.outputs = outputs,
                    Err(e) if e.is_item_error() => {
                        record.status = RunStatus::Failed;
                        record.error = Some(format!("failed to save outputs: {}", e));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        PollOutcome::Failed(message) => {
            record.status = RunStatus::Failed;
            record.error = Some(message);
        }
        PollOutcome::TimedOut => {
            record.status = RunStatus::TimedOut;
            record.error = Some(format!("no result within {}s", config.execution.timeout));
        }
    }
    Ok(record)
}

/// Runs every combination of `axis`, `repeats` times each.
///
/// In dry-run mode nothing is sent to the server: each run directory gets a `meta.json` and the
/// exact `workflow.json` that would have been submitted, and the axis is left unmarked.
pub async fn run_batch<S: GenerationServer, R: Rng + ?Sized>(
    config: &ExploreConfig,
    state: &mut StateTracker,
    server: &S,
    axis: &str,
    dry_run: bool,
    rng: &mut R,
) -> Result<BatchSummary> {
    let workflow = WorkflowGraph::load(&config.workflow.json_path)?;
    let mapping = &config.workflow.node_mapping;
    mapping.validate(&workflow)?;

    let plans = expander::plan_runs(
        &config.prompt_template,
        &config.sampler_choices,
        config.lora_choices.as_ref(),
        axis,
        config.execution.randomize_non_target,
        rng,
    )?;
    let repeats = config.execution.repeats;
    let total = plans.len() * repeats as usize;
    info!(
        "Exploring axis '{}': {} combinations x {} repeats = {} images{}",
        axis,
        plans.len(),
        repeats,
        total,
        if dry_run { " (dry run)" } else { "" }
    );

    let mut summary = BatchSummary {
        axis: axis.to_owned(),
        runs: plans.len(),
        images: total,
        ..Default::default()
    };
    let started = Instant::now();
    let mut done = 0;

    'plans: for plan in &plans {
        let run_id = utils::generate_run_id(plan.index);
        let run_dir = config.workflow.output_root.join(&run_id);
        std::fs::create_dir_all(&run_dir)
            .map_err(|e| Error::io(format!("failed to create {}", run_dir.display()), e))?;
        let prefix = format!("{}/img", run_id);
        let mut meta = RunMetadata::new(plan, &run_id, &prefix, dry_run);
        debug!(
            "Run {}: {} = '{}'",
            run_id,
            axis,
            plan.axis_values.get(axis).unwrap_or_default()
        );

        for repeat in 0..repeats {
            let seed = rng.gen_range(0..utils::SEED_LIMIT);
            let graph = workflow.patch(&mapping.explore_patches(plan, seed, &prefix))?;

            if dry_run {
                if repeat == 0 {
                    graph.save(&run_dir.join("workflow.json"))?;
                }
                info!("[dry-run] {} #{}: {} (seed {})", run_id, repeat, plan.positive, seed);
                meta.repeats.push(RepeatRecord {
                    repeat,
                    seed,
                    status: RunStatus::DryRun,
                    server_run_id: None,
                    outputs: Vec::new(),
                    error: None,
                });
                continue;
            }

            let record = match execute(server, config, &graph, &run_dir, repeat, seed).await {
                Ok(record) => record,
                Err(e) => {
                    // Keep what the earlier repeats of this run produced.
                    if !meta.repeats.is_empty() {
                        utils::write_json(&run_dir.join("meta.json"), &meta)?;
                    }
                    return Err(e);
                }
            };
            done += 1;
            match record.status {
                RunStatus::Completed => summary.completed += 1,
                RunStatus::Failed => summary.failed += 1,
                RunStatus::TimedOut => summary.timed_out += 1,
                RunStatus::DryRun => {}
            }
            let eta = utils::estimate_remaining(done, total, started.elapsed())
                .map(utils::format_duration)
                .unwrap_or_else(|| "unknown".to_owned());
            info!("[{}/{}] {} #{}: {:?}, ETA {}", done, total, run_id, repeat, record.status, eta);

            let failed = record.status != RunStatus::Completed;
            if failed {
                error!(
                    "{} #{} {:?}: {}",
                    run_id,
                    repeat,
                    record.status,
                    record.error.as_deref().unwrap_or("")
                );
            }
            meta.repeats.push(record);
            if failed && config.execution.on_failure == FailurePolicy::Abort {
                summary.aborted = true;
                utils::write_json(&run_dir.join("meta.json"), &meta)?;
                summary.run_dirs.push(run_dir);
                error!("Aborting batch after failed run (on_failure: abort)");
                break 'plans;
            }
        }

        utils::write_json(&run_dir.join("meta.json"), &meta)?;
        info!("done {}", run_id);
        summary.run_dirs.push(run_dir);
    }

    if dry_run {
        info!("Dry run finished; axis '{}' left unmarked", axis);
    } else if summary.is_clean() {
        state.mark_used(axis)?;
        summary.marked_used = true;
    } else {
        warn!(
            "Axis '{}' had {} failed and {} timed-out runs; leaving it unmarked",
            axis, summary.failed, summary.timed_out
        );
    }
    info!(
        "Batch finished in {}: {} completed, {} failed, {} timed out",
        utils::format_duration(started.elapsed()),
        summary.completed,
        summary.failed,
        summary.timed_out
    );
    Ok(summary)
}

/// Entry point for the `explore` command.
/// Returns `None` when there is nothing left to explore.
pub async fn explore<S: GenerationServer, R: Rng + ?Sized>(
    config: &ExploreConfig,
    server: &S,
    requested_axis: Option<&str>,
    dry_run: bool,
    rng: &mut R,
) -> Result<Option<BatchSummary>> {
    let mut state = StateTracker::open(&config.execution.state_file)?;
    let Some(axis) = select_axis(config, &state, requested_axis, rng)? else {
        info!("All axes have been explored; use --reset or --forget to start over");
        return Ok(None);
    };
    info!("Axis for this batch: {}", axis);
    run_batch(config, &mut state, server, &axis, dry_run, rng).await.map(Some)
}
