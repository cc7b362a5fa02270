#![allow(dead_code)]

use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

use comms::collective::{Collective, MemoryCollective};
use machine_learning::arch::Classifier;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use worker::{
    Driver, Phase, Result, Steps, TrainConfig, TrainingReport, WorkerContext, WorkerErr,
    data::{Catalog, ExampleLoader, Prefetcher, TrainStream, ValidationStream},
};

pub const FEATURES: usize = 4;
pub const CLASSES: usize = 3;

/// Files are named `<class>-<index>`, the class is encoded one-hot in the first features and
/// the index in the last one.
#[derive(Clone, Copy)]
pub struct ClassLoader;

impl ExampleLoader for ClassLoader {
    fn example_len(&self) -> usize {
        FEATURES
    }

    fn load_into(&self, path: &Path, out: &mut [f32]) -> Result<()> {
        let corrupt = || WorkerErr::Decode {
            path: path.to_path_buf(),
            detail: "unexpected file name".into(),
        };

        let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(corrupt)?;
        let (class, index) = name.split_once('-').ok_or_else(corrupt)?;
        let class: usize = class.parse().map_err(|_| corrupt())?;
        let index: f32 = index.parse().map_err(|_| corrupt())?;

        out.fill(0.0);
        out[class] = 1.0;
        out[FEATURES - 1] = index * 0.01;
        Ok(())
    }
}

/// A `ClassLoader` that remembers every path it loaded.
#[derive(Clone, Default)]
pub struct RecordingLoader {
    loaded: Arc<Mutex<Vec<PathBuf>>>,
}

impl RecordingLoader {
    /// Returns the sorted paths loaded from below `dir`, repetitions included.
    pub fn loaded_from(&self, dir: &Path) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self
            .loaded
            .lock()
            .iter()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

impl ExampleLoader for RecordingLoader {
    fn example_len(&self) -> usize {
        ClassLoader.example_len()
    }

    fn load_into(&self, path: &Path, out: &mut [f32]) -> Result<()> {
        self.loaded.lock().push(path.to_path_buf());
        ClassLoader.load_into(path, out)
    }
}

pub struct Workspace {
    pub data: TempDir,
    pub logs: TempDir,
}

impl Workspace {
    pub fn new(train_per_class: usize, val_per_class: usize) -> Self {
        let data = tempfile::tempdir().unwrap();

        for (split, per_class) in [("train", train_per_class), ("val", val_per_class)] {
            for class in 0..CLASSES {
                let dir = data.path().join(split).join(format!("class{class}"));
                fs::create_dir_all(&dir).unwrap();

                for i in 0..per_class {
                    fs::write(dir.join(format!("{class}-{i}")), b"").unwrap();
                }
            }
        }

        Self {
            data,
            logs: tempfile::tempdir().unwrap(),
        }
    }

    pub fn config(&self, epochs: usize) -> TrainConfig {
        let mut cfg = TrainConfig::new(self.data.path(), self.logs.path());
        cfg.epochs = epochs;
        cfg.batch_size = nz(4);
        cfg.val_batch_size = nz(4);
        cfg.shuffle_buffer_size = nz(8);
        cfg.prefetch_buffer_size = nz(2);
        cfg.warmup_epochs = 1.0;
        cfg.base_lr = 0.05;
        cfg.decay_epochs = vec![2.0];
        cfg.decay_multipliers = vec![1.0, 0.5];
        cfg
    }

    pub fn checkpoint(&self, epoch: usize) -> PathBuf {
        self.logs
            .path()
            .join(format!("checkpoints/checkpoint-epoch-{epoch:02}.safetensors"))
    }

    pub fn events(&self) -> Vec<serde_json::Value> {
        let content = fs::read_to_string(self.logs.path().join("tensorboard/events.jsonl")).unwrap();
        content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }
}

pub fn nz(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

/// Derives the step counts the way the binary does.
pub fn derived_steps(cfg: &TrainConfig, size: usize) -> Steps {
    let train = Catalog::scan(&cfg.train_dir()).unwrap();
    let val = Catalog::scan(&cfg.validation_dir()).unwrap();

    Steps {
        per_epoch: cfg.steps_per_epoch(train.len(), size),
        validation: cfg.validation_steps(val.len(), size),
    }
}

/// Spawns one worker of the fleet over `collective`.
pub fn spawn_worker<C>(
    cfg: TrainConfig,
    steps: Steps,
    collective: C,
) -> JoinHandle<Result<(TrainingReport, Phase)>>
where
    C: Collective + 'static,
{
    spawn_worker_with(cfg, steps, collective, ClassLoader)
}

/// Spawns one worker of the fleet over `collective`, loading examples with `loader`.
pub fn spawn_worker_with<C, L>(
    cfg: TrainConfig,
    steps: Steps,
    collective: C,
    loader: L,
) -> JoinHandle<Result<(TrainingReport, Phase)>>
where
    C: Collective + 'static,
    L: ExampleLoader + Clone + 'static,
{
    tokio::spawn(async move {
        let rank = collective.rank();
        let size = collective.size();
        let ctx = WorkerContext::new(rank, size, rank)?;

        let train = Catalog::scan(&cfg.train_dir())?;
        let val = Catalog::scan_with_classes(&cfg.validation_dir(), train.classes().to_vec())?;
        let model = Classifier::new(FEATURES, train.classes().len());

        let stream = TrainStream::new(
            train,
            loader.clone(),
            rank as u64,
            cfg.shuffle_buffer_size,
            cfg.batch_size,
        );
        let mut prefetcher = Prefetcher::spawn(stream, cfg.prefetch_buffer_size);
        let validation = ValidationStream::new(val, loader, cfg.val_batch_size);

        let mut driver = Driver::new(ctx, cfg, steps, model, collective)?;
        let report = driver.run(&mut prefetcher, validation).await?;
        Ok((report, driver.phase()))
    })
}

/// Trains a whole in-process fleet, returning the outcome of every rank in rank order.
pub async fn run_fleet(cfg: &TrainConfig, size: usize) -> Vec<Result<(TrainingReport, Phase)>> {
    let steps = derived_steps(cfg, size);
    let handles: Vec<_> = MemoryCollective::fleet(nz(size))
        .into_iter()
        .map(|collective| spawn_worker(cfg.clone(), steps, collective))
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    outcomes
}
