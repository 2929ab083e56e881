// This module handles the exploration and expression-batch config files.
// The format is picked from the file suffix: YAML, JSON, or TOML.
// Relative paths inside a config are resolved against the config file's directory.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use tokio_retry::strategy::ExponentialBackoff;

use crate::{
    error::{Error, Result},
    expander::{LoraChoices, SamplerChoices},
    expressions::{validate_prefix_template, SamplerSweep, SeedStrategy},
    prompt::PromptTemplate,
};

pub const DEFAULT_COMFY_URL: &str = "http://127.0.0.1:8188";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "json" => Ok(ConfigFormat::Json),
            "toml" => Ok(ConfigFormat::Toml),
            _ => Err(Error::config(format!(
                "{}: unsupported config format (expected .yaml, .yml, .json or .toml)",
                path.display()
            ))),
        }
    }

    pub fn parse<T: DeserializeOwned>(self, text: &str) -> std::result::Result<T, String> {
        match self {
            ConfigFormat::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
            ConfigFormat::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::from_str(text).map_err(|e| e.to_string()),
        }
    }
}

fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let format = ConfigFormat::from_path(path)?;
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::config(format!("config file {} not found", path.display()))
        }
        _ => Error::io(format!("failed to read {}", path.display()), e),
    })?;
    debug!("Parsing {} as {:?}", path.display(), format);
    format
        .parse(&text)
        .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))
}

fn base_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_owned(),
        _ => PathBuf::from("."),
    }
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

/// `COMFY_URL` from the environment (or `.env`), when set.
pub fn comfy_url_override() -> Option<String> {
    std::env::var("COMFY_URL").ok().map(|u| u.trim().to_owned()).filter(|u| !u.is_empty())
}

// Node ids are strings in ComfyUI exports, but people write `node_id: 10` in YAML.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawNodeId {
    Text(String),
    Number(u64),
}

impl From<RawNodeId> for String {
    fn from(raw: RawNodeId) -> Self {
        match raw {
            RawNodeId::Text(s) => s,
            RawNodeId::Number(n) => n.to_string(),
        }
    }
}

fn node_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    RawNodeId::deserialize(d).map(String::from)
}

fn opt_node_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(Option::<RawNodeId>::deserialize(d)?.map(String::from))
}

fn require_node_id(key: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::config(format!("{} must not be empty", key)));
    }
    Ok(())
}

/// Longest poll interval or timeout accepted, in seconds (one week).
const MAX_WAIT_SECS: f64 = 7.0 * 24.0 * 3600.0;

fn require_positive(key: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(Error::config(format!("{} must be a positive number, got {}", key, value)));
    }
    if value > MAX_WAIT_SECS {
        return Err(Error::config(format!(
            "{} must be at most {} seconds, got {}",
            key, MAX_WAIT_SECS, value
        )));
    }
    Ok(())
}

fn require_url(key: &str, url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::config(format!("{} must be an http(s) URL, got '{}'", key, url)));
    }
    Ok(())
}

fn default_comfy_url() -> String {
    DEFAULT_COMFY_URL.to_owned()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> f64 {
    1.0
}

fn default_timeout() -> f64 {
    600.0
}

/// How often a failed submission is retried.
/// Only connection failures and 5xx answers are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total tries, the first one included.
    pub attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// Delays between tries: base, 2 x base, 4 x base... capped at `max_delay_ms`.
    pub fn strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.base_delay_ms / 2)
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .take(self.attempts.saturating_sub(1))
    }

    pub fn validate(&self, key: &str) -> Result<()> {
        if self.attempts == 0 {
            return Err(Error::config(format!("{}.attempts must be at least 1", key)));
        }
        Ok(())
    }
}

/// What to do with the rest of an exploration batch after a run times out or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Continue,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_repeats")]
    pub repeats: u32,
    #[serde(default = "default_true")]
    pub randomize_non_target: bool,
    #[serde(default = "default_comfy_url")]
    pub comfy_url: String,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Seconds. Hard deadline for a single run.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_repeats() -> u32 {
    2
}

fn default_state_file() -> PathBuf {
    PathBuf::from("axis_state.json")
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            repeats: default_repeats(),
            randomize_non_target: true,
            comfy_url: default_comfy_url(),
            state_file: default_state_file(),
            poll_interval: default_poll_interval(),
            timeout: default_timeout(),
            on_failure: FailurePolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Which node ids in the exploration workflow receive which values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMapping {
    #[serde(deserialize_with = "node_id")]
    pub positive_prompt: String,
    #[serde(deserialize_with = "node_id")]
    pub negative_prompt: String,
    #[serde(deserialize_with = "node_id")]
    pub ksampler: String,
    #[serde(default, deserialize_with = "opt_node_id")]
    pub save_image: Option<String>,
    #[serde(default, deserialize_with = "opt_node_id")]
    pub lora: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub json_path: PathBuf,
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    #[serde(default = "default_true")]
    pub download_outputs: bool,
    pub node_mapping: NodeMapping,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("output")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExploreConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    pub workflow: WorkflowConfig,
    pub prompt_template: PromptTemplate,
    pub sampler_choices: SamplerChoices,
    #[serde(default)]
    pub lora_choices: Option<LoraChoices>,
}

impl ExploreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = read_config(path)?;
        let base = base_dir(path);
        resolve(&base, &mut config.execution.state_file);
        resolve(&base, &mut config.workflow.json_path);
        resolve(&base, &mut config.workflow.output_root);
        config.validate()?;
        info!(
            "Loaded exploration config {} ({} axes)",
            path.display(),
            config.prompt_template.axes.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let exec = &self.execution;
        if exec.repeats == 0 {
            return Err(Error::config("execution.repeats must be at least 1"));
        }
        require_url("execution.comfy_url", &exec.comfy_url)?;
        require_positive("execution.poll_interval", exec.poll_interval)?;
        require_positive("execution.timeout", exec.timeout)?;
        exec.retry.validate("execution.retry")?;

        let mapping = &self.workflow.node_mapping;
        require_node_id("workflow.node_mapping.positive_prompt", &mapping.positive_prompt)?;
        require_node_id("workflow.node_mapping.negative_prompt", &mapping.negative_prompt)?;
        require_node_id("workflow.node_mapping.ksampler", &mapping.ksampler)?;
        if let Some(id) = &mapping.save_image {
            require_node_id("workflow.node_mapping.save_image", id)?;
        }
        match (&mapping.lora, &self.lora_choices) {
            (Some(id), _) => require_node_id("workflow.node_mapping.lora", id)?,
            (None, Some(_)) => {
                return Err(Error::config(
                    "lora_choices is set, but workflow.node_mapping.lora is missing",
                ))
            }
            (None, None) => {}
        }

        self.prompt_template.validate()?;
        self.sampler_choices.validate()?;
        if let Some(lora) = &self.lora_choices {
            lora.validate()?;
        }
        Ok(())
    }

    pub fn axis_names(&self) -> Vec<String> {
        self.prompt_template.axis_names()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.execution.poll_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.execution.timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionPresetConfig {
    #[serde(deserialize_with = "node_id")]
    pub node_id: String,
    #[serde(default = "default_expression_input")]
    pub expression_input_name: String,
    pub expressions: Vec<String>,
}

fn default_expression_input() -> String {
    "expression".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputImageConfig {
    #[serde(deserialize_with = "node_id")]
    pub node_id: String,
    #[serde(default = "default_image_input")]
    pub input_name: String,
    /// When false, the images are assumed to already be in ComfyUI's input folder.
    #[serde(default = "default_true")]
    pub upload: bool,
    #[serde(default = "default_upload_type")]
    pub upload_type: String,
    #[serde(default)]
    pub upload_subfolder: String,
    #[serde(default)]
    pub overwrite: bool,
}

fn default_image_input() -> String {
    "image".to_owned()
}

fn default_upload_type() -> String {
    "input".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveImageConfig {
    #[serde(deserialize_with = "node_id")]
    pub node_id: String,
    #[serde(default = "default_prefix_input")]
    pub input_name: String,
    #[serde(default = "default_prefix_template")]
    pub filename_prefix_template: String,
}

fn default_prefix_input() -> String {
    "filename_prefix".to_owned()
}

pub fn default_prefix_template() -> String {
    "{image}/{expr}/{run}/img".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedNodeConfig {
    #[serde(deserialize_with = "node_id")]
    pub node_id: String,
    #[serde(default = "default_seed_input")]
    pub input_name: String,
}

fn default_seed_input() -> String {
    "seed".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerNodeConfig {
    #[serde(deserialize_with = "node_id")]
    pub node_id: String,
    #[serde(default = "default_steps_input")]
    pub steps_input: String,
    #[serde(default = "default_cfg_input")]
    pub cfg_input: String,
    #[serde(default = "default_denoise_input")]
    pub denoise_input: String,
    #[serde(default = "default_sampler_name_input")]
    pub sampler_name_input: String,
    #[serde(default = "default_scheduler_input")]
    pub scheduler_input: String,
}

fn default_steps_input() -> String {
    "steps".to_owned()
}

fn default_cfg_input() -> String {
    "cfg".to_owned()
}

fn default_denoise_input() -> String {
    "denoise".to_owned()
}

fn default_sampler_name_input() -> String {
    "sampler_name".to_owned()
}

fn default_scheduler_input() -> String {
    "scheduler".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_run_repeats")]
    pub repeats: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default = "default_timeout")]
    pub timeout_sec: f64,
    #[serde(default)]
    pub seed_strategy: SeedStrategy,
    #[serde(default)]
    pub seed_base: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_run_repeats() -> u32 {
    1
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            repeats: default_run_repeats(),
            poll_interval: default_poll_interval(),
            timeout_sec: default_timeout(),
            seed_strategy: SeedStrategy::default(),
            seed_base: 0,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionConfig {
    #[serde(default = "default_comfy_url")]
    pub comfy_url: String,
    pub workflow_json: PathBuf,
    #[serde(default = "default_expression_output_root")]
    pub output_root: PathBuf,
    pub expression_preset: ExpressionPresetConfig,
    pub input_image: InputImageConfig,
    pub save_image: SaveImageConfig,
    #[serde(default)]
    pub seed_node: Option<SeedNodeConfig>,
    #[serde(default)]
    pub sampler_node: Option<SamplerNodeConfig>,
    #[serde(default)]
    pub sampler_sweep: Option<SamplerSweep>,
    #[serde(default)]
    pub run: RunConfig,
}

fn default_expression_output_root() -> PathBuf {
    PathBuf::from("outputs")
}

impl ExpressionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = read_config(path)?;
        let base = base_dir(path);
        resolve(&base, &mut config.workflow_json);
        resolve(&base, &mut config.output_root);
        config.normalize();
        config.validate()?;
        info!(
            "Loaded expression config {} ({} expressions)",
            path.display(),
            config.expression_preset.expressions.len()
        );
        Ok(config)
    }

    /// Trims expressions and drops the blank ones.
    pub fn normalize(&mut self) {
        let expressions = std::mem::take(&mut self.expression_preset.expressions);
        self.expression_preset.expressions = expressions
            .into_iter()
            .map(|e| e.trim().to_owned())
            .filter(|e| !e.is_empty())
            .collect();
    }

    pub fn validate(&self) -> Result<()> {
        require_url("comfy_url", &self.comfy_url)?;
        require_node_id("expression_preset.node_id", &self.expression_preset.node_id)?;
        if self.expression_preset.expressions.is_empty() {
            return Err(Error::config(
                "expression_preset.expressions must list at least one expression",
            ));
        }
        require_node_id("input_image.node_id", &self.input_image.node_id)?;
        require_node_id("save_image.node_id", &self.save_image.node_id)?;
        validate_prefix_template(
            &self.save_image.filename_prefix_template,
            self.sampler_sweep.is_some(),
        )?;
        if let Some(seed) = &self.seed_node {
            require_node_id("seed_node.node_id", &seed.node_id)?;
        }
        if let Some(sampler) = &self.sampler_node {
            require_node_id("sampler_node.node_id", &sampler.node_id)?;
        }
        if let Some(sweep) = &self.sampler_sweep {
            if self.sampler_node.is_none() {
                return Err(Error::config("sampler_sweep is set, but sampler_node is missing"));
            }
            sweep.validate()?;
        }
        if self.run.repeats == 0 {
            return Err(Error::config("run.repeats must be at least 1"));
        }
        require_positive("run.poll_interval", self.run.poll_interval)?;
        require_positive("run.timeout_sec", self.run.timeout_sec)?;
        self.run.retry.validate("run.retry")?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.run.poll_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.run.timeout_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testdata(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
    }

    #[test]
    fn test_format_from_suffix() {
        assert_eq!(ConfigFormat::from_path(Path::new("a/b.YAML")).unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("b.yml")).unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("b.json")).unwrap(), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("b.toml")).unwrap(), ConfigFormat::Toml);
        assert!(matches!(
            ConfigFormat::from_path(Path::new("b.ini")),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_load_explore_yaml() {
        let path = testdata("explore.yaml");
        let config = ExploreConfig::load(&path).unwrap();
        assert_eq!(config.execution.repeats, 2);
        assert!(config.execution.randomize_non_target);
        assert_eq!(config.execution.on_failure, FailurePolicy::Continue);
        assert_eq!(config.execution.retry, RetryPolicy::default());
        assert_eq!(config.axis_names(), vec!["hair_color", "expression", "accessory"]);
        assert_eq!(config.workflow.node_mapping.positive_prompt, "2");
        // Written as a bare number in the file.
        assert_eq!(config.workflow.node_mapping.lora.as_deref(), Some("18"));
        assert_eq!(config.workflow.json_path, testdata("workflow.json"));
        assert_eq!(config.execution.state_file, testdata("axis_state.json"));
        let accessory = &config.prompt_template.axes[2];
        assert_eq!(accessory.name, "accessory");
        assert_eq!(accessory.choices[0].text, "");
        assert_eq!(accessory.choices[0].weight, 3.0);
        assert_eq!(config.timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_toml_matches_yaml() {
        let yaml = ExploreConfig::load(&testdata("explore.yaml")).unwrap();
        let toml = ExploreConfig::load(&testdata("explore.toml")).unwrap();
        assert_eq!(yaml, toml);
    }

    #[test]
    fn test_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = ExploreConfig::load(&testdata("explore.yaml")).unwrap();
        let path = dir.path().join("explore.json");
        std::fs::write(&path, serde_json::to_string(&yaml).unwrap()).unwrap();
        // Absolute paths survive resolution unchanged.
        assert_eq!(ExploreConfig::load(&path).unwrap(), yaml);
    }

    #[test]
    fn test_explore_validation() {
        let good = ExploreConfig::load(&testdata("explore.yaml")).unwrap();

        let mut c = good.clone();
        c.execution.repeats = 0;
        assert!(matches!(c.validate(), Err(Error::Configuration(_))));

        let mut c = good.clone();
        c.execution.timeout = 0.0;
        assert!(c.validate().is_err());

        // Would overflow a Duration or the poll deadline.
        for huge in [1e20, 1.8e19, MAX_WAIT_SECS + 1.0] {
            let mut c = good.clone();
            c.execution.timeout = huge;
            assert!(matches!(c.validate(), Err(Error::Configuration(_))), "{}", huge);
        }
        let mut c = good.clone();
        c.execution.timeout = MAX_WAIT_SECS;
        c.validate().unwrap();
        assert_eq!(c.timeout(), Duration::from_secs(7 * 24 * 3600));

        let mut c = good.clone();
        c.execution.comfy_url = "127.0.0.1:8188".into();
        assert!(c.validate().is_err());

        let mut c = good.clone();
        c.workflow.node_mapping.lora = None;
        assert!(c.validate().unwrap_err().to_string().contains("node_mapping.lora"));

        let mut c = good;
        c.sampler_choices.cfg.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = ExploreConfig::load(&testdata("does_not_exist.yaml")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "execution: [1, 2\n").unwrap();
        assert!(matches!(ExploreConfig::load(&path), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_load_expressions() {
        let config = ExpressionConfig::load(&testdata("expressions.yaml")).unwrap();
        // Blank entries are dropped, the rest trimmed.
        assert_eq!(config.expression_preset.expressions, vec!["neutral", "smile", "angry"]);
        assert_eq!(config.input_image.node_id, "10");
        assert_eq!(config.input_image.upload_type, "input");
        assert_eq!(config.save_image.input_name, "filename_prefix");
        assert_eq!(config.seed_node.as_ref().unwrap().input_name, "seed");
        assert_eq!(config.sampler_node.as_ref().unwrap().denoise_input, "denoise");
        assert_eq!(config.run.seed_strategy, SeedStrategy::Increment);
        assert_eq!(config.run.seed_base, 1000);
        assert_eq!(config.workflow_json, testdata("expression_workflow.json"));
        assert_eq!(config.sampler_sweep.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_expression_validation() {
        let good = ExpressionConfig::load(&testdata("expressions.yaml")).unwrap();

        let mut c = good.clone();
        c.sampler_node = None;
        assert!(c.validate().unwrap_err().to_string().contains("sampler_node"));

        let mut c = good.clone();
        c.expression_preset.expressions = vec!["  ".into(), "".into()];
        c.normalize();
        assert!(c.validate().is_err());

        let mut c = good.clone();
        c.run.timeout_sec = 1e20;
        assert!(matches!(c.validate(), Err(Error::Configuration(_))));

        let mut c = good;
        c.save_image.filename_prefix_template = "{image}/{mood}".into();
        assert!(c.validate().unwrap_err().to_string().contains("mood"));
    }

    #[test]
    fn test_retry_strategy() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 3000,
        };
        let delays: Vec<_> = policy.strategy().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(3000),
            ]
        );
        assert_eq!(RetryPolicy { attempts: 1, ..policy }.strategy().count(), 0);
    }
}
