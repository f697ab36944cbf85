use std::{
    fs,
    path::{Path, PathBuf},
};

use launcher::{DeviceKind, WorkerContext};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, WorkflowError};

/// The name the effective configuration is dumped under inside the output directory.
pub const CONFIG_DUMP: &str = "config.json";

/// Model related settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Where initial weights come from, empty to start from scratch.
    pub weights: String,
    pub device: DeviceKind,
    /// Send gradients as half precision floats.
    pub ddp_fp16_grad_compress: bool,
    /// Let parameters without a gradient take part in the reduction as zeros.
    pub ddp_find_unused_parameters: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            weights: String::new(),
            device: DeviceKind::Cpu,
            ddp_fp16_grad_compress: false,
            ddp_find_unused_parameters: false,
        }
    }
}

/// The configuration of a train or evaluation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub model: ModelConfig,
    pub output_dir: PathBuf,
    pub seed: Option<u64>,
    /// Settings only the selected runner understands.
    pub runner: Value,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            output_dir: PathBuf::from("./output"),
            seed: None,
            runner: Value::Object(Map::new()),
        }
    }
}

impl TrainConfig {
    /// Reads a configuration from a json file, missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            WorkflowError::Config(format!("can't read {}: {e}", path.display()))
        })?;

        serde_json::from_str(&raw)
            .map_err(|e| WorkflowError::Config(format!("can't parse {}: {e}", path.display())))
    }

    /// Applies `KEY=VALUE` overrides where `KEY` is a dotted path into the configuration.
    ///
    /// Values are parsed as json, anything that isn't valid json is taken as a string.
    pub fn merge_overrides<S: AsRef<str>>(&mut self, opts: &[S]) -> Result<()> {
        if opts.is_empty() {
            return Ok(());
        }

        let mut root = serde_json::to_value(&*self)?;
        for opt in opts {
            let opt = opt.as_ref();
            let (key, raw) = opt.split_once('=').ok_or_else(|| {
                WorkflowError::Config(format!("override {opt:?} is not of the form KEY=VALUE"))
            })?;

            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            set_dotted(&mut root, key.trim(), value)?;
        }

        *self = serde_json::from_value(root)
            .map_err(|e| WorkflowError::Config(format!("overrides produce an invalid config: {e}")))?;
        Ok(())
    }

    /// The seed used by the given rank, distinct per rank and stable across runs.
    pub fn seed_for(&self, rank: usize) -> u64 {
        self.seed.unwrap_or_default().wrapping_add(rank as u64)
    }
}

fn set_dotted(root: &mut Value, key: &str, value: Value) -> Result<()> {
    let mut node = root;
    let mut parts = key.split('.').peekable();

    while let Some(part) = parts.next() {
        if part.is_empty() {
            return Err(WorkflowError::Config(format!("invalid override key {key:?}")));
        }

        let map = node.as_object_mut().ok_or_else(|| {
            WorkflowError::Config(format!("override key {key:?} goes through a non object value"))
        })?;

        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return Ok(());
        }

        node = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    Err(WorkflowError::Config("empty override key".into()))
}

/// Per worker setup once the process group exists: creates the output directory and,
/// on the leader, dumps the effective configuration into it.
pub fn setup_after_launch(cfg: &TrainConfig, ctx: &WorkerContext) -> Result<()> {
    fs::create_dir_all(&cfg.output_dir)?;

    if ctx.is_leader() {
        let path = cfg.output_dir.join(CONFIG_DUMP);
        let tmp = cfg.output_dir.join(format!(".{CONFIG_DUMP}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(cfg)?)?;
        fs::rename(&tmp, &path)?;
        info!(rank = ctx.global_rank(); "wrote effective config to {}", path.display());
    }

    Ok(())
}
