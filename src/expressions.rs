// The `expressions` command: run every image in a folder through an ExpressionPreset workflow,
// once per expression, sampler sweep point and repeat.
//
// A bad image (unreadable, rejected by the upload) is logged and skipped; the batch goes on.
// A server that can't be reached, or a workflow that doesn't match the config, stops everything.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::{
    client::{GenerationServer, PollOutcome, UploadOptions},
    config::ExpressionConfig,
    error::{Error, Result},
    explore::RunStatus,
    utils,
    workflow::{Patch, WorkflowGraph},
};

pub const TOOL_NAME: &str = "expression_preset_batch";

pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Longest sanitized path component in prefixes and output directories.
const NAME_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedStrategy {
    /// A fresh random seed for every run.
    #[default]
    Time,
    /// `seed_base + n`, counting runs across the whole batch.
    Increment,
    /// Always `seed_base`.
    Fixed,
}

pub fn compute_seed(strategy: SeedStrategy, base: u64, counter: u64) -> u64 {
    match strategy {
        SeedStrategy::Time => utils::generate_seed(),
        SeedStrategy::Increment => base.wrapping_add(counter),
        SeedStrategy::Fixed => base,
    }
}

/// Sampler values to sweep; every combination is run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerSweep {
    pub steps: Vec<u32>,
    pub cfg: Vec<f64>,
    pub denoise: Vec<f64>,
    pub sampler: Vec<String>,
    pub scheduler: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPoint {
    pub steps: u32,
    pub cfg: f64,
    pub denoise: f64,
    pub sampler_name: String,
    pub scheduler: String,
}

impl SamplerSweep {
    pub fn validate(&self) -> Result<()> {
        if self.len() == 0 {
            return Err(Error::config(
                "sampler_sweep: steps, cfg, denoise, sampler and scheduler need a value each",
            ));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
            * self.cfg.len()
            * self.denoise.len()
            * self.sampler.len()
            * self.scheduler.len()
    }

    pub fn points(&self) -> Vec<SweepPoint> {
        let mut out = Vec::with_capacity(self.len());
        for &steps in &self.steps {
            for &cfg in &self.cfg {
                for &denoise in &self.denoise {
                    for sampler_name in &self.sampler {
                        for scheduler in &self.scheduler {
                            out.push(SweepPoint {
                                steps,
                                cfg,
                                denoise,
                                sampler_name: sampler_name.clone(),
                                scheduler: scheduler.clone(),
                            });
                        }
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    /// `{{` or `}}`.
    Brace(char),
    Field(&'a str),
}

fn parse_template(template: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = template;
    while !rest.is_empty() {
        let Some(pos) = rest.find(|c: char| c == '{' || c == '}') else {
            segments.push(Segment::Text(rest));
            break;
        };
        if pos > 0 {
            segments.push(Segment::Text(&rest[..pos]));
        }
        let tail = &rest[pos..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            segments.push(Segment::Brace(tail.as_bytes()[0] as char));
            rest = &tail[2..];
        } else if tail.starts_with('}') {
            return Err(Error::config(format!(
                "filename prefix template '{}' has a stray '}}'",
                template
            )));
        } else {
            let end = tail.find('}').ok_or_else(|| {
                Error::config(format!(
                    "filename prefix template '{}' has an unclosed '{{'",
                    template
                ))
            })?;
            segments.push(Segment::Field(&tail[1..end]));
            rest = &tail[end + 1..];
        }
    }
    Ok(segments)
}

const BASE_FIELDS: [&str; 4] = ["image", "expr", "run", "seed"];
const SWEEP_FIELDS: [&str; 5] = ["steps", "cfg", "denoise", "sampler", "scheduler"];

fn placeholder_error(name: &str) -> Error {
    if SWEEP_FIELDS.contains(&name) {
        Error::config(format!("filename prefix placeholder {{{}}} needs sampler_sweep", name))
    } else {
        Error::config(format!(
            "unknown filename prefix placeholder {{{}}} (known: {}, {})",
            name,
            BASE_FIELDS.join(", "),
            SWEEP_FIELDS.join(", ")
        ))
    }
}

/// Checks every placeholder in a prefix template is one we can fill.
/// The sampler placeholders need a sweep.
pub fn validate_prefix_template(template: &str, has_sweep: bool) -> Result<()> {
    for segment in parse_template(template)? {
        if let Segment::Field(name) = segment {
            let known = BASE_FIELDS.contains(&name) || (has_sweep && SWEEP_FIELDS.contains(&name));
            if !known {
                return Err(placeholder_error(name));
            }
        }
    }
    Ok(())
}

/// Values available to a filename prefix template.
pub struct PrefixValues<'a> {
    pub image: &'a str,
    pub expr: &'a str,
    pub run: &'a str,
    pub seed: u64,
    pub sweep: Option<&'a SweepPoint>,
}

/// Fills `{image} {expr} {run} {seed}` and, with a sweep,
/// `{steps} {cfg} {denoise} {sampler} {scheduler}`.
/// Text values are made path-safe; the template's own `/` still separates directories.
pub fn render_prefix(template: &str, values: &PrefixValues) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 32);
    for segment in parse_template(template)? {
        match segment {
            Segment::Text(t) => out.push_str(t),
            Segment::Brace(c) => out.push(c),
            Segment::Field(name) => {
                let value = match (name, values.sweep) {
                    ("image", _) => utils::safe_filename(values.image, NAME_LIMIT),
                    ("expr", _) => utils::safe_filename(values.expr, NAME_LIMIT),
                    ("run", _) => utils::safe_filename(values.run, NAME_LIMIT),
                    ("seed", _) => values.seed.to_string(),
                    ("steps", Some(p)) => p.steps.to_string(),
                    ("cfg", Some(p)) => utils::fmt_float(p.cfg, 3),
                    ("denoise", Some(p)) => utils::fmt_float(p.denoise, 3),
                    ("sampler", Some(p)) => utils::safe_filename(&p.sampler_name, NAME_LIMIT),
                    ("scheduler", Some(p)) => utils::safe_filename(&p.scheduler, NAME_LIMIT),
                    (name, _) => return Err(placeholder_error(name)),
                };
                out.push_str(&value);
            }
        }
    }
    Ok(out)
}

/// Image files in `dir`, sorted by path. `limit == 0` means all.
pub fn scan_images(dir: &Path, recursive: bool, limit: usize) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::config(format!("images dir {} is not a directory", dir.display())));
    }
    let mut files = Vec::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let is_image = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if is_image {
            files.push(entry.into_path());
        }
    }
    if limit > 0 {
        files.truncate(limit);
    }
    Ok(files)
}

/// Patches for one expression run.
pub fn expression_patches(
    config: &ExpressionConfig,
    image_name: &str,
    expression: &str,
    seed: u64,
    filename_prefix: &str,
    sweep: Option<&SweepPoint>,
) -> Vec<Patch> {
    let mut patches = vec![
        Patch::new(&config.input_image.node_id, &config.input_image.input_name, image_name),
        Patch::new(
            &config.expression_preset.node_id,
            &config.expression_preset.expression_input_name,
            expression,
        ),
        Patch::new(&config.save_image.node_id, &config.save_image.input_name, filename_prefix),
    ];
    if let Some(node) = &config.seed_node {
        patches.push(Patch::new(&node.node_id, &node.input_name, seed));
    }
    if let (Some(node), Some(p)) = (&config.sampler_node, sweep) {
        patches.push(Patch::new(&node.node_id, &node.steps_input, p.steps));
        patches.push(Patch::new(&node.node_id, &node.cfg_input, p.cfg));
        patches.push(Patch::new(&node.node_id, &node.denoise_input, p.denoise));
        patches.push(Patch::new(&node.node_id, &node.sampler_name_input, p.sampler_name.as_str()));
        patches.push(Patch::new(&node.node_id, &node.scheduler_input, p.scheduler.as_str()));
    }
    patches
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputRecord {
    pub local_path: PathBuf,
    pub uploaded_name: String,
}

/// Contents of `meta.json` for one expression run.
#[derive(Debug, Clone, Serialize)]
pub struct ExpressionRunMetadata {
    pub tool: &'static str,
    pub input: InputRecord,
    pub expression: String,
    pub repeat_index: u32,
    pub run_id: String,
    pub seed: u64,
    pub filename_prefix: String,
    pub workflow_json: PathBuf,
    pub sampler: Option<SweepPoint>,
    pub status: RunStatus,
    pub server_run_id: Option<String>,
    pub outputs: Vec<String>,
    pub error: Option<String>,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
}

pub struct BatchOptions {
    pub images_dir: PathBuf,
    pub recursive: bool,
    pub limit: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionSummary {
    pub images: usize,
    pub skipped_images: usize,
    pub runs: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub meta_files: Vec<PathBuf>,
}

struct Batch<'a, S> {
    config: &'a ExpressionConfig,
    server: &'a S,
    workflow: WorkflowGraph,
    points: Vec<Option<SweepPoint>>,
    dry_run: bool,
    seed_counter: u64,
    summary: ExpressionSummary,
}

impl<'a, S: GenerationServer> Batch<'a, S> {
    async fn upload(&self, path: &Path) -> Result<String> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                let context = format!("{} has no file name", path.display());
                Error::io(context, std::io::ErrorKind::InvalidInput.into())
            })?
            .to_owned();
        let input = &self.config.input_image;
        if !input.upload {
            // Already in ComfyUI's input folder.
            return Ok(file_name);
        }
        if self.dry_run {
            info!("[dry-run] would upload {}", path.display());
            return Ok(file_name);
        }
        // Fail here, before anything goes over the wire, if the file vanished.
        std::fs::metadata(path)
            .map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;
        let options = UploadOptions {
            image_type: input.upload_type.clone(),
            subfolder: input.upload_subfolder.clone(),
            overwrite: input.overwrite,
        };
        self.server.upload_image(path, &options).await
    }

    async fn process_image(&mut self, path: &Path) -> Result<()> {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("image").to_owned();
        info!("=== Image: {} ===", path.display());
        let uploaded = self.upload(path).await?;
        debug!("{} is {} on the server", path.display(), uploaded);

        let config = self.config;
        let points = self.points.clone();
        for expression in &config.expression_preset.expressions {
            for point in &points {
                for repeat in 0..config.run.repeats {
                    self.run_one(path, &stem, &uploaded, expression, point.as_ref(), repeat)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn save_outputs(&self, server_run_id: &str, dir: &Path) -> Result<Vec<String>> {
        let images = self.server.fetch_outputs(server_run_id).await?;
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::io(format!("failed to create {}", dir.display()), e))?;
        let mut saved = Vec::with_capacity(images.len());
        for image in images {
            let name = utils::safe_filename(&image.filename, 120);
            let out = dir.join(&name);
            std::fs::write(&out, &image.bytes)
                .map_err(|e| Error::io(format!("failed to write {}", out.display()), e))?;
            saved.push(name);
        }
        Ok(saved)
    }

    async fn run_one(
        &mut self,
        path: &Path,
        stem: &str,
        uploaded: &str,
        expression: &str,
        point: Option<&SweepPoint>,
        repeat: u32,
    ) -> Result<()> {
        let config = self.config;
        let run = &config.run;
        let run_id = utils::generate_run_id(0);
        let seed = compute_seed(run.seed_strategy, run.seed_base, self.seed_counter);
        self.seed_counter += 1;
        let prefix = render_prefix(
            &self.config.save_image.filename_prefix_template,
            &PrefixValues {
                image: stem,
                expr: expression,
                run: &run_id,
                seed,
                sweep: point,
            },
        )?;
        let graph = self
            .workflow
            .patch(&expression_patches(self.config, uploaded, expression, seed, &prefix, point))?;

        let meta_dir = self
            .config
            .output_root
            .join(utils::safe_filename(stem, NAME_LIMIT))
            .join(utils::safe_filename(expression, NAME_LIMIT))
            .join(utils::safe_filename(&run_id, NAME_LIMIT));
        let meta_path = meta_dir.join("meta.json");
        let mut meta = ExpressionRunMetadata {
            tool: TOOL_NAME,
            input: InputRecord {
                local_path: path.to_owned(),
                uploaded_name: uploaded.to_owned(),
            },
            expression: expression.to_owned(),
            repeat_index: repeat,
            run_id: run_id.clone(),
            seed,
            filename_prefix: prefix.clone(),
            workflow_json: self.config.workflow_json.clone(),
            sampler: point.cloned(),
            status: RunStatus::DryRun,
            server_run_id: None,
            outputs: Vec::new(),
            error: None,
            dry_run: self.dry_run,
            created_at: Utc::now(),
        };
        self.summary.runs += 1;

        if self.dry_run {
            info!("[dry-run] would run: expr={} seed={} prefix={}", expression, seed, prefix);
            graph.save(&meta_dir.join("workflow.json"))?;
            utils::write_json(&meta_path, &meta)?;
            self.summary.meta_files.push(meta_path);
            return Ok(());
        }

        let server_run_id = self.server.submit(&graph).await?;
        meta.server_run_id = Some(server_run_id.clone());
        match self
            .server
            .poll(&server_run_id, self.config.poll_interval(), self.config.timeout())
            .await?
        {
            PollOutcome::Completed => match self.save_outputs(&server_run_id, &meta_dir).await {
                Ok(outputs) => {
                    meta.status = RunStatus::Completed;
                    meta.outputs = outputs;
                    self.summary.completed += 1;
                    info!("done: expr={} seed={}", expression, seed);
                }
                Err(e) => {
                    error!("failed to save outputs: expr={} seed={} err={}", expression, seed, e);
                    meta.status = RunStatus::Failed;
                    meta.error = Some(format!("failed to save outputs: {}", e));
                    self.summary.failed += 1;
                    utils::write_json(&meta_path, &meta)?;
                    self.summary.meta_files.push(meta_path);
                    return Err(e);
                }
            },
            PollOutcome::Failed(message) => {
                error!("failed: expr={} seed={} err={}", expression, seed, message);
                meta.status = RunStatus::Failed;
                meta.error = Some(message);
                self.summary.failed += 1;
            }
            PollOutcome::TimedOut => {
                error!("timed out: expr={} seed={}", expression, seed);
                meta.status = RunStatus::TimedOut;
                meta.error = Some(format!("no result within {}s", run.timeout_sec));
                self.summary.timed_out += 1;
            }
        }
        utils::write_json(&meta_path, &meta)?;
        self.summary.meta_files.push(meta_path);
        Ok(())
    }
}

/// Entry point for the `expressions` command.
pub async fn run_expressions<S: GenerationServer>(
    config: &ExpressionConfig,
    server: &S,
    options: &BatchOptions,
) -> Result<ExpressionSummary> {
    let workflow = WorkflowGraph::load(&config.workflow_json)?;
    let points: Vec<Option<SweepPoint>> = match &config.sampler_sweep {
        Some(sweep) => sweep.points().into_iter().map(Some).collect(),
        None => vec![None],
    };
    // Every mapped node and field must exist before the first upload.
    let check = expression_patches(config, "check.png", "check", 0, "check", points[0].as_ref());
    workflow.patch(&check)?;

    let files = scan_images(&options.images_dir, options.recursive, options.limit)?;
    if files.is_empty() {
        warn!("No image files found in {}", options.images_dir.display());
        return Ok(ExpressionSummary::default());
    }
    info!(
        "Found {} images. expressions={} sampler_combos={} repeats={}{}",
        files.len(),
        config.expression_preset.expressions.len(),
        points.len(),
        config.run.repeats,
        if options.dry_run { " (dry run)" } else { "" }
    );

    let mut batch = Batch {
        config,
        server,
        workflow,
        points,
        dry_run: options.dry_run,
        seed_counter: 0,
        summary: ExpressionSummary::default(),
    };
    for path in &files {
        batch.summary.images += 1;
        match batch.process_image(path).await {
            Ok(()) => {}
            Err(e) if e.is_item_error() => {
                error!("Skipping {}: {}", path.display(), e);
                batch.summary.skipped_images += 1;
            }
            Err(e) => return Err(e),
        }
    }
    let s = &batch.summary;
    info!(
        "Expression batch finished: {} images ({} skipped), {} runs, \
         {} completed, {} failed, {} timed out",
        s.images, s.skipped_images, s.runs, s.completed, s.failed, s.timed_out
    );
    Ok(batch.summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::FakeServer;
    use serde_json::{json, Value};

    fn config(dir: &Path) -> ExpressionConfig {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/expressions.yaml");
        let mut config = ExpressionConfig::load(&path).unwrap();
        config.output_root = dir.join("outputs");
        config
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    fn images(dir: &Path) -> PathBuf {
        let images = dir.join("images");
        std::fs::create_dir_all(images.join("nested")).unwrap();
        for name in ["alice.png", "bob.JPG", "notes.txt", "nested/carol.webp"] {
            std::fs::write(images.join(name), b"fake image").unwrap();
        }
        images
    }

    fn point() -> SweepPoint {
        SweepPoint {
            steps: 25,
            cfg: 7.5,
            denoise: 0.3,
            sampler_name: "dpmpp_2m".into(),
            scheduler: "karras".into(),
        }
    }

    #[test]
    fn test_render_prefix() {
        let p = point();
        let values = PrefixValues {
            image: "alice",
            expr: "smile/happy",
            run: "abcd1234",
            seed: 42,
            sweep: Some(&p),
        };
        assert_eq!(
            render_prefix("{image}/{expr}/{run}/img", &values).unwrap(),
            "alice/smile_happy/abcd1234/img"
        );
        assert_eq!(
            render_prefix("{steps}_{cfg}_{denoise}_{sampler}_{scheduler}_{seed}", &values).unwrap(),
            "25_7.5_0.3_dpmpp_2m_karras_42"
        );
        assert_eq!(render_prefix("{{literal}}", &values).unwrap(), "{literal}");
        assert!(matches!(render_prefix("{mood}", &values), Err(Error::Configuration(_))));
        assert!(render_prefix("{image", &values).is_err());
        assert!(render_prefix("image}", &values).is_err());

        let no_sweep = PrefixValues { sweep: None, ..values };
        let err = render_prefix("{cfg}", &no_sweep).unwrap_err();
        assert!(err.to_string().contains("sampler_sweep"));
    }

    #[test]
    fn test_validate_prefix_template() {
        assert!(validate_prefix_template("{image}/{expr}/{run}/img", false).is_ok());
        assert!(validate_prefix_template("{image}/s{steps}", false).is_err());
        assert!(validate_prefix_template("{image}/s{steps}", true).is_ok());
        assert!(validate_prefix_template("{face}", true).unwrap_err().to_string().contains("face"));
    }

    #[test]
    fn test_seed_strategies() {
        assert_eq!(compute_seed(SeedStrategy::Fixed, 7, 3), 7);
        assert_eq!(compute_seed(SeedStrategy::Increment, 1000, 3), 1003);
        assert!(compute_seed(SeedStrategy::Time, 0, 0) < utils::SEED_LIMIT);
    }

    #[test]
    fn test_sweep_points() {
        let sweep = SamplerSweep {
            steps: vec![20, 30],
            cfg: vec![7.0, 8.0],
            denoise: vec![0.3],
            sampler: vec!["euler".into()],
            scheduler: vec!["normal".into(), "karras".into()],
        };
        let points = sweep.points();
        assert_eq!(points.len(), 8);
        assert_eq!(sweep.len(), 8);
        assert_eq!(points[1].scheduler, "karras");
        assert_eq!(points[7].steps, 30);
        let empty = SamplerSweep { denoise: vec![], ..sweep };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_scan_images() {
        let dir = tempfile::tempdir().unwrap();
        let images = images(dir.path());
        let names = |files: Vec<PathBuf>| -> Vec<String> {
            files.iter().map(|f| f.file_name().unwrap().to_string_lossy().into_owned()).collect()
        };
        assert_eq!(names(scan_images(&images, false, 0).unwrap()), vec!["alice.png", "bob.JPG"]);
        assert_eq!(
            names(scan_images(&images, true, 0).unwrap()),
            vec!["alice.png", "bob.JPG", "carol.webp"]
        );
        assert_eq!(scan_images(&images, true, 1).unwrap().len(), 1);
        assert!(scan_images(&dir.path().join("missing"), false, 0).is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_dry_run_makes_no_calls() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let server = FakeServer::default();
        let options = BatchOptions {
            images_dir: images(dir.path()),
            recursive: false,
            limit: 0,
            dry_run: true,
        };
        let summary = run_expressions(&config, &server, &options).await.unwrap();
        assert_eq!(server.calls.get(), 0);
        assert_eq!(summary.images, 2);
        // 2 images x 3 expressions x 2 sweep points x 1 repeat.
        assert_eq!(summary.runs, 12);
        assert_eq!(summary.meta_files.len(), 12);

        let meta = read_json(&summary.meta_files[0]);
        assert_eq!(meta["tool"], "expression_preset_batch");
        assert_eq!(meta["dry_run"], true);
        assert_eq!(meta["status"], "dry_run");
        assert_eq!(meta["expression"], "neutral");
        assert_eq!(meta["input"]["uploaded_name"], "alice.png");
        assert_eq!(meta["seed"], 1000);
        assert_eq!(meta["sampler"]["cfg"], 7.0);
        let run_id = meta["run_id"].as_str().unwrap();
        assert_eq!(meta["filename_prefix"], format!("alice/neutral/s25_cfg7/{}/img", run_id));
        assert!(summary.meta_files[0].starts_with(dir.path().join("outputs/alice/neutral")));

        let second = read_json(&summary.meta_files[1]);
        assert_eq!(second["seed"], 1001);
        assert_eq!(second["sampler"]["cfg"], 8.0);
    }

    #[test_log::test(tokio::test)]
    async fn test_rejected_upload_skips_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.sampler_sweep = None;
        config.save_image.filename_prefix_template = "{image}/{expr}/{run}/img".into();
        let server = FakeServer {
            reject_upload: Some("alice.png".into()),
            ..Default::default()
        };
        let options = BatchOptions {
            images_dir: images(dir.path()),
            recursive: true,
            limit: 0,
            dry_run: false,
        };
        let summary = run_expressions(&config, &server, &options).await.unwrap();
        assert_eq!(summary.images, 3);
        assert_eq!(summary.skipped_images, 1);
        assert_eq!(summary.runs, 6);
        assert_eq!(summary.completed, 6);
        // 3 uploads, then submit + poll + fetch for each run.
        assert_eq!(server.calls.get(), 3 + 6 * 3);
        assert_eq!(server.uploads.borrow().len(), 2);

        let submitted = server.submitted.borrow();
        let first = &submitted[0];
        assert_eq!(first.get("10", "image"), Some(&json!("bob.JPG")));
        assert_eq!(first.get("12", "expression"), Some(&json!("neutral")));
        assert_eq!(first.get("15", "seed"), Some(&json!(1000)));
        // No sweep: the workflow's own sampler settings stay.
        assert_eq!(first.get("15", "denoise"), Some(&json!(0.35)));
        let prefix = first.get("20", "filename_prefix").unwrap().as_str().unwrap();
        assert!(prefix.starts_with("bob/neutral/"));
        assert_eq!(submitted[5].get("10", "image"), Some(&json!("carol.webp")));
        assert_eq!(submitted[5].get("12", "expression"), Some(&json!("angry")));

        let meta = read_json(&summary.meta_files[0]);
        assert_eq!(meta["status"], "completed");
        assert_eq!(meta["dry_run"], false);
        assert_eq!(meta["outputs"].as_array().unwrap().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_timeout_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.sampler_sweep = None;
        config.save_image.filename_prefix_template = "{image}/{expr}/{run}/img".into();
        config.expression_preset.expressions = vec!["smile".into()];
        let server = FakeServer::with_outcomes([PollOutcome::TimedOut]);
        let options = BatchOptions {
            images_dir: images(dir.path()),
            recursive: false,
            limit: 0,
            dry_run: false,
        };
        let summary = run_expressions(&config, &server, &options).await.unwrap();
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.completed, 1);
        let meta = read_json(&summary.meta_files[0]);
        assert_eq!(meta["status"], "timed_out");
        assert!(meta["outputs"].as_array().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_download_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.sampler_sweep = None;
        config.save_image.filename_prefix_template = "{image}/{expr}/{run}/img".into();
        config.expression_preset.expressions = vec!["smile".into()];
        let server = FakeServer {
            failing_fetches: vec!["prompt-1".into()],
            ..Default::default()
        };
        let options = BatchOptions {
            images_dir: images(dir.path()),
            recursive: false,
            limit: 0,
            dry_run: false,
        };
        let summary = run_expressions(&config, &server, &options).await.unwrap();
        assert_eq!(summary.images, 2);
        assert_eq!(summary.skipped_images, 1);
        assert_eq!(summary.runs, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.meta_files.len(), 2);

        let meta = read_json(&summary.meta_files[0]);
        assert_eq!(meta["input"]["uploaded_name"], "alice.png");
        assert_eq!(meta["status"], "failed");
        assert_eq!(meta["server_run_id"], "prompt-1");
        assert!(meta["error"].as_str().unwrap().contains("404"));
        assert!(meta["filename_prefix"].as_str().unwrap().starts_with("alice/smile/"));
    }

    #[test_log::test(tokio::test)]
    async fn test_mismatched_workflow_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.input_image.input_name = "picture".into();
        let server = FakeServer::default();
        let options = BatchOptions {
            images_dir: images(dir.path()),
            recursive: false,
            limit: 0,
            dry_run: false,
        };
        let err = run_expressions(&config, &server, &options).await.unwrap_err();
        assert!(matches!(err, Error::FieldNotFound { ref field, .. } if field == "picture"));
        assert_eq!(server.calls.get(), 0);
    }
}
