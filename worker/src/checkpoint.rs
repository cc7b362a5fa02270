use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::info;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{Result, WorkerErr, state::TrainingState};

const MODEL_PARAMETERS: &str = "model_parameters";
const OPTIMIZER_PARAMETERS: &str = "optimizer_parameters";
const EPOCH_KEY: &str = "epoch";
const NUM_WORKERS_KEY: &str = "num_workers";
const BASE_LR_KEY: &str = "base_lr";

/// The settings a run can only be resumed with, the learning rate schedule and the step counts
/// depend on them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunShape {
    pub num_workers: usize,
    pub base_lr: f64,
}

/// A training state read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub epoch: usize,
    pub shape: RunShape,
    pub model_parameters: Vec<f32>,
    pub optimizer_parameters: Vec<f32>,
}

/// Writes and discovers the checkpoints of a run.
///
/// A checkpoint is named after the amount of epochs it completed, zero padded to two digits,
/// so the latest one can be found by probing names without any manifest. Only the coordinator
/// should ever write to the checkpoint directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Creates a manager for `<logging_dir>/checkpoints`, the directory isn't created.
    pub fn new(logging_dir: &Path) -> Self {
        Self {
            dir: logging_dir.join("checkpoints"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the checkpoint directory if missing.
    pub fn create_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| checkpoint_err(&self.dir, e))
    }

    /// Returns the path of the checkpoint written after `epoch` epochs.
    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir
            .join(format!("checkpoint-epoch-{epoch:02}.safetensors"))
    }

    /// Finds the checkpoint with the most completed epochs, probing backwards from
    /// `max_epoch` down to 1.
    ///
    /// # Returns
    /// The epoch and path of the latest checkpoint, `None` if there's none.
    pub fn discover_latest(&self, max_epoch: usize) -> Option<(usize, PathBuf)> {
        (1..=max_epoch)
            .rev()
            .map(|epoch| (epoch, self.path_for(epoch)))
            .find(|(_, path)| path.is_file())
    }

    /// Reads a checkpoint.
    ///
    /// # Returns
    /// The stored state, or an error if the file can't be read or is malformed.
    pub fn load(&self, path: &Path) -> Result<Snapshot> {
        let bytes = fs::read(path).map_err(|e| checkpoint_err(path, e))?;

        let (_, metadata) =
            SafeTensors::read_metadata(&bytes).map_err(|e| checkpoint_err(path, e))?;
        let metadata = metadata.metadata().as_ref();
        let shape = RunShape {
            num_workers: read_meta(metadata, NUM_WORKERS_KEY, path)?,
            base_lr: read_meta(metadata, BASE_LR_KEY, path)?,
        };

        let tensors = SafeTensors::deserialize(&bytes).map_err(|e| checkpoint_err(path, e))?;

        Ok(Snapshot {
            epoch: read_meta(metadata, EPOCH_KEY, path)?,
            shape,
            model_parameters: read_f32(&tensors, MODEL_PARAMETERS, path)?,
            optimizer_parameters: read_f32(&tensors, OPTIMIZER_PARAMETERS, path)?,
        })
    }

    /// Writes `state` as the checkpoint of `epoch` completed epochs of a run shaped as `shape`.
    ///
    /// The file is written under a temporary name and then renamed, so a crash mid write never
    /// leaves a discoverable broken checkpoint.
    ///
    /// # Returns
    /// The path of the checkpoint, or an error if it couldn't be written.
    pub fn save(&self, state: &TrainingState, epoch: usize, shape: RunShape) -> Result<PathBuf> {
        let path = self.path_for(epoch);
        let tmp = path.with_extension("safetensors.tmp");

        let model = le_bytes(&state.model_parameters);
        let optimizer = le_bytes(state.optimizer_parameters());

        let views = [
            (MODEL_PARAMETERS, tensor_view(&model, &path)?),
            (OPTIMIZER_PARAMETERS, tensor_view(&optimizer, &path)?),
        ];
        let metadata = Some(HashMap::from([
            (EPOCH_KEY.to_string(), epoch.to_string()),
            (NUM_WORKERS_KEY.to_string(), shape.num_workers.to_string()),
            (BASE_LR_KEY.to_string(), shape.base_lr.to_string()),
        ]));

        let serialized =
            safetensors::tensor::serialize(views, &metadata).map_err(|e| checkpoint_err(&path, e))?;

        fs::write(&tmp, serialized).map_err(|e| checkpoint_err(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| checkpoint_err(&path, e))?;

        info!(epoch = epoch; "checkpoint written to {}", path.display());
        Ok(path)
    }
}

impl Snapshot {
    /// Checks that this snapshot can be resumed by a run shaped as `shape`.
    ///
    /// # Returns
    /// An error naming both shapes if they differ.
    pub fn ensure_shape(&self, shape: RunShape, path: &Path) -> Result<()> {
        if self.shape == shape {
            return Ok(());
        }

        Err(checkpoint_err(
            path,
            format!(
                "written by {} workers with base lr {}, can't resume with {} workers and base lr {}",
                self.shape.num_workers, self.shape.base_lr, shape.num_workers, shape.base_lr
            ),
        ))
    }
}

fn read_meta<T: FromStr>(
    metadata: Option<&HashMap<String, String>>,
    key: &str,
    path: &Path,
) -> Result<T> {
    metadata
        .and_then(|m| m.get(key))
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| checkpoint_err(path, format!("missing or invalid {key} metadata")))
}

fn le_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn tensor_view<'a>(bytes: &'a [u8], path: &Path) -> Result<TensorView<'a>> {
    let shape = vec![bytes.len() / size_of::<f32>()];
    TensorView::new(Dtype::F32, shape, bytes).map_err(|e| checkpoint_err(path, e))
}

fn read_f32(tensors: &SafeTensors<'_>, name: &str, path: &Path) -> Result<Vec<f32>> {
    let view = tensors
        .tensor(name)
        .map_err(|e| checkpoint_err(path, format!("{name}: {e}")))?;

    if view.dtype() != Dtype::F32 {
        return Err(checkpoint_err(
            path,
            format!("{name} is {:?}, expected F32", view.dtype()),
        ));
    }

    Ok(view
        .data()
        .chunks_exact(size_of::<f32>())
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn checkpoint_err(path: &Path, detail: impl ToString) -> WorkerErr {
    WorkerErr::Checkpoint {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use machine_learning::{
        arch::{Classifier, Model},
        optimization::Sgd,
    };

    use super::*;

    const SHAPE: RunShape = RunShape {
        num_workers: 4,
        base_lr: 0.0125,
    };

    fn state() -> TrainingState {
        let model = Classifier::new(3, 2);
        let sgd = Sgd::new(model.size(), 0.1, 0.9, 0.0);
        let mut state = TrainingState::fresh(&model, sgd, 7).unwrap();
        state.optimizer.state_mut()[1] = -0.25;
        state
    }

    #[test]
    fn names_are_zero_padded() {
        let manager = CheckpointManager::new(Path::new("/logs"));

        assert_eq!(
            manager.path_for(7),
            PathBuf::from("/logs/checkpoints/checkpoint-epoch-07.safetensors")
        );
        assert_eq!(
            manager.path_for(120),
            PathBuf::from("/logs/checkpoints/checkpoint-epoch-120.safetensors")
        );
    }

    #[test]
    fn latest_checkpoint_wins() {
        let logs = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(logs.path());
        manager.create_dir().unwrap();

        assert_eq!(manager.discover_latest(90), None);

        for epoch in [5, 12, 20] {
            fs::write(manager.path_for(epoch), b"").unwrap();
        }

        assert_eq!(manager.discover_latest(90), Some((20, manager.path_for(20))));
        assert_eq!(manager.discover_latest(15), Some((12, manager.path_for(12))));
        assert_eq!(manager.discover_latest(4), None);
    }

    #[test]
    fn saved_state_is_discovered_and_restored() {
        let logs = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(logs.path());
        manager.create_dir().unwrap();

        let state = state();
        manager.save(&state, 7, SHAPE).unwrap();

        let (epoch, path) = manager.discover_latest(90).unwrap();
        assert_eq!(epoch, 7);

        let snapshot = manager.load(&path).unwrap();
        assert_eq!(snapshot.epoch, 7);
        assert_eq!(snapshot.shape, SHAPE);
        assert_eq!(snapshot.model_parameters, state.model_parameters);
        assert_eq!(snapshot.optimizer_parameters, state.optimizer_parameters());

        let leftovers: Vec<_> = fs::read_dir(manager.dir()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn corrupt_checkpoints_are_fatal() {
        let logs = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(logs.path());
        manager.create_dir().unwrap();

        let path = manager.path_for(3);
        fs::write(&path, b"garbage").unwrap();

        assert!(matches!(
            manager.load(&path),
            Err(WorkerErr::Checkpoint { .. })
        ));
    }

    #[test]
    fn writing_without_a_directory_fails() {
        let logs = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(&logs.path().join("missing"));

        assert!(matches!(
            manager.save(&state(), 1, SHAPE),
            Err(WorkerErr::Checkpoint { .. })
        ));
    }

    #[test]
    fn resuming_with_another_fleet_is_rejected() {
        let logs = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(logs.path());
        manager.create_dir().unwrap();

        let path = manager.save(&state(), 2, SHAPE).unwrap();
        let snapshot = manager.load(&path).unwrap();
        snapshot.ensure_shape(SHAPE, &path).unwrap();

        let bigger = RunShape {
            num_workers: 8,
            ..SHAPE
        };
        let faster = RunShape {
            base_lr: 0.1,
            ..SHAPE
        };

        for shape in [bigger, faster] {
            assert!(matches!(
                snapshot.ensure_shape(shape, &path),
                Err(WorkerErr::Checkpoint { .. })
            ));
        }
    }
}
