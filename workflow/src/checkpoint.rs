use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Result, WorkflowError},
    model::{Model, ModelState},
};

/// The file inside a save directory naming its latest checkpoint.
pub const LAST_CHECKPOINT: &str = "last_checkpoint";

/// Extra state stored next to the weights, e.g. an exponential moving average.
pub type AuxiliaryState = BTreeMap<String, Value>;

/// What a load produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointRecord {
    /// Where the weights came from, empty when the model started from scratch.
    pub weights_reference: String,
    /// The last completed iteration, `None` for fresh loads.
    pub iteration: Option<u64>,
    pub auxiliary_state: AuxiliaryState,
}

/// The on disk format of weights and checkpoints.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    iteration: Option<u64>,
    state: ModelState,
    #[serde(default)]
    auxiliary_state: AuxiliaryState,
}

/// Persists and restores model state.
pub trait Checkpointer: Send + Sync {
    /// Whether the save directory holds a checkpoint to resume from.
    fn has_checkpoint(&self) -> bool;

    /// Loads the latest checkpoint of the save directory, with its iteration and
    /// auxiliary state.
    fn load_latest(&self, model: &mut dyn Model) -> Result<CheckpointRecord>;

    /// Loads weights from `weights` only, an empty reference keeps the model as built.
    fn load(&self, model: &mut dyn Model, weights: &str) -> Result<CheckpointRecord>;

    /// Resumes from the latest checkpoint when asked to and one exists, otherwise loads
    /// `weights`.
    fn resume_or_load(
        &self,
        model: &mut dyn Model,
        weights: &str,
        resume: bool,
    ) -> Result<CheckpointRecord> {
        if resume && self.has_checkpoint() {
            self.load_latest(model)
        } else {
            self.load(model, weights)
        }
    }

    /// Where a checkpoint called `name` lives, whether it has been written or not.
    fn checkpoint_path(&self, name: &str) -> PathBuf;

    /// Writes a checkpoint called `name` and makes it the latest one.
    ///
    /// # Returns
    /// The path written, or `None` on processes that don't write checkpoints.
    fn save(
        &self,
        name: &str,
        model: &dyn Model,
        iteration: Option<u64>,
        auxiliary_state: AuxiliaryState,
    ) -> Result<Option<PathBuf>>;
}

/// Stores checkpoints as json files inside a directory, only the leader writes.
#[derive(Debug, Clone)]
pub struct FileCheckpointer {
    save_dir: PathBuf,
    is_leader: bool,
}

impl FileCheckpointer {
    pub fn new(save_dir: impl Into<PathBuf>, is_leader: bool) -> Self {
        Self {
            save_dir: save_dir.into(),
            is_leader,
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    fn read(path: &Path) -> Result<CheckpointFile> {
        let load_err = |reason: String| WorkflowError::CheckpointLoad {
            path: path.to_path_buf(),
            reason,
        };

        let raw = fs::read(path).map_err(|e| load_err(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| load_err(e.to_string()))
    }

    fn apply(path: &Path, model: &mut dyn Model, file: &CheckpointFile) -> Result<()> {
        model
            .load_state(&file.state)
            .map_err(|e| WorkflowError::CheckpointLoad {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

/// Writes `contents` next to `path` and renames it into place.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl Checkpointer for FileCheckpointer {
    fn has_checkpoint(&self) -> bool {
        self.save_dir.join(LAST_CHECKPOINT).is_file()
    }

    fn load_latest(&self, model: &mut dyn Model) -> Result<CheckpointRecord> {
        let pointer = self.save_dir.join(LAST_CHECKPOINT);
        let name = fs::read_to_string(&pointer).map_err(|e| WorkflowError::CheckpointLoad {
            path: pointer.clone(),
            reason: e.to_string(),
        })?;

        let path = self.save_dir.join(name.trim());
        let file = Self::read(&path)?;
        Self::apply(&path, model, &file)?;

        info!("resumed from {} at iteration {:?}", path.display(), file.iteration);
        Ok(CheckpointRecord {
            weights_reference: path.display().to_string(),
            iteration: file.iteration,
            auxiliary_state: file.auxiliary_state,
        })
    }

    fn load(&self, model: &mut dyn Model, weights: &str) -> Result<CheckpointRecord> {
        if weights.is_empty() {
            debug!("no weights given, keeping the initialized model");
            return Ok(CheckpointRecord::default());
        }

        let path = Path::new(weights);
        let file = Self::read(path)?;
        Self::apply(path, model, &file)?;

        info!("loaded weights from {weights}");
        Ok(CheckpointRecord {
            weights_reference: weights.to_string(),
            iteration: None,
            auxiliary_state: AuxiliaryState::new(),
        })
    }

    fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.save_dir.join(format!("{name}.json"))
    }

    fn save(
        &self,
        name: &str,
        model: &dyn Model,
        iteration: Option<u64>,
        auxiliary_state: AuxiliaryState,
    ) -> Result<Option<PathBuf>> {
        if !self.is_leader {
            return Ok(None);
        }

        fs::create_dir_all(&self.save_dir)?;

        let file = CheckpointFile {
            iteration,
            state: model.state(),
            auxiliary_state,
        };

        let path = self.checkpoint_path(name);
        write_atomic(&path, &serde_json::to_vec(&file)?)?;

        let file_name = format!("{name}.json");
        write_atomic(&self.save_dir.join(LAST_CHECKPOINT), file_name.as_bytes())?;

        info!("saved checkpoint to {}", path.display());
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use serde_json::json;

    use super::*;
    use crate::model::Parameter;

    struct Weights(Vec<Parameter>);

    impl fmt::Display for Weights {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Weights")
        }
    }

    impl Model for Weights {
        fn parameters(&self) -> &[Parameter] {
            &self.0
        }

        fn parameters_mut(&mut self) -> &mut [Parameter] {
            &mut self.0
        }

        fn set_training(&mut self, _: bool) {}

        fn is_training(&self) -> bool {
            true
        }
    }

    fn weights(value: f32) -> Weights {
        Weights(vec![Parameter::new("w", vec![value; 3])])
    }

    fn ema() -> AuxiliaryState {
        AuxiliaryState::from([("ema".to_string(), json!([0.5, 0.5, 0.5]))])
    }

    #[test]
    fn fresh_load_without_weights_starts_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = FileCheckpointer::new(dir.path(), true);

        let mut model = weights(1.0);
        let record = ckpt.resume_or_load(&mut model, "", true).unwrap();

        assert_eq!(record, CheckpointRecord::default());
        assert_eq!(model.0[0].value, vec![1.0; 3]);
    }

    #[test]
    fn resume_restores_iteration_and_auxiliary_state() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = FileCheckpointer::new(dir.path(), true);

        ckpt.save("model_0000009", &weights(2.0), Some(9), ema()).unwrap();
        assert!(ckpt.has_checkpoint());

        let mut model = weights(0.0);
        let first = ckpt.resume_or_load(&mut model, "ignored.json", true).unwrap();
        assert_eq!(first.iteration, Some(9));
        assert_eq!(first.auxiliary_state, ema());
        assert_eq!(model.0[0].value, vec![2.0; 3]);

        let second = ckpt.resume_or_load(&mut model, "ignored.json", true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn no_resume_never_restores_auxiliary_state() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = FileCheckpointer::new(dir.path(), true);

        let saved = ckpt.save("model_final", &weights(3.0), Some(19), ema()).unwrap().unwrap();

        let mut model = weights(0.0);
        let record = ckpt
            .resume_or_load(&mut model, &saved.display().to_string(), false)
            .unwrap();

        assert_eq!(record.iteration, None);
        assert!(record.auxiliary_state.is_empty());
        assert_eq!(model.0[0].value, vec![3.0; 3]);
    }

    #[test]
    fn later_saves_become_the_latest() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = FileCheckpointer::new(dir.path(), true);

        ckpt.save("model_0000004", &weights(1.0), Some(4), AuxiliaryState::new()).unwrap();
        ckpt.save("model_0000009", &weights(2.0), Some(9), AuxiliaryState::new()).unwrap();

        let mut model = weights(0.0);
        assert_eq!(ckpt.load_latest(&mut model).unwrap().iteration, Some(9));
        assert_eq!(model.0[0].value, vec![2.0; 3]);
    }

    #[test]
    fn followers_never_write() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = FileCheckpointer::new(dir.path().join("out"), false);

        let saved = ckpt.save("model_final", &weights(1.0), Some(0), ema()).unwrap();

        assert!(saved.is_none());
        assert!(!ckpt.has_checkpoint());
        assert!(!ckpt.save_dir().exists());
    }

    #[test]
    fn unreadable_weights_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = FileCheckpointer::new(dir.path(), true);
        let mut model = weights(0.0);

        let missing = dir.path().join("missing.json");
        let err = ckpt.load(&mut model, &missing.display().to_string()).unwrap_err();
        assert!(matches!(err, WorkflowError::CheckpointLoad { .. }));

        let garbage = dir.path().join("garbage.json");
        fs::write(&garbage, "not json").unwrap();
        let err = ckpt.load(&mut model, &garbage.display().to_string()).unwrap_err();
        assert!(matches!(err, WorkflowError::CheckpointLoad { .. }));

        let other = FileCheckpointer::new(dir.path().join("other"), true);
        let shape = Weights(vec![Parameter::new("w", vec![1.0])]);
        let saved = other.save("small", &shape, None, AuxiliaryState::new()).unwrap().unwrap();
        let err = ckpt.load(&mut model, &saved.display().to_string()).unwrap_err();
        assert!(matches!(err, WorkflowError::CheckpointLoad { .. }));
    }
}
