use std::{
    mem,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use comms::collective::{Collective, CollectiveErr};
use log::{Level, debug, error, info, log};
use machine_learning::{
    BatchStats,
    arch::Model,
    optimization::{Optimizer, Sgd},
};
use parking_lot::Mutex;
use tokio::task;

use crate::{
    Result, WorkerErr,
    checkpoint::{CheckpointManager, RunShape},
    config::TrainConfig,
    context::WorkerContext,
    data::{ExampleLoader, Prefetcher, ValidationStream},
    events::{EpochRecord, EventLog},
    metrics::EpochMetrics,
    schedule::LrSchedule,
    state::TrainingState,
    sync::Synchronizer,
};

/// The epoch the coordinator announces when it can't provide the initial state.
const ABORTED_EPOCH: u32 = u32::MAX;

/// The states of a training run, in the order they're entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DiscoverCheckpoint,
    SynchronizeInitialState,
    RunSteps,
    AverageMetrics,
    AdaptLr,
    Checkpoint,
    Done,
}

/// How many batches make an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Steps {
    pub per_epoch: usize,
    pub validation: usize,
}

/// The fleet wide outcome of one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub lr: f64,
    pub metrics: EpochMetrics,
}

/// What a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub initial_epoch: usize,
    pub final_epoch: usize,
    pub history: Vec<EpochSummary>,
    pub model_parameters: Vec<f32>,
}

/// Drives one worker through a training run.
///
/// Every worker of the fleet runs its own `Driver`, all of them go through the exact same
/// sequence of collective operations:
///
/// 1. The epoch to resume from, found by the coordinator, is broadcast.
/// 2. The coordinator's model and optimizer state is broadcast.
/// 3. Each step averages the local gradient before applying it.
/// 4. Each epoch averages the training and validation metrics.
///
/// Every worker validates its own share of the validation split, so the averaged `val_` metrics
/// cover the whole of it.
///
/// Filesystem writes, checkpoints and metric events, only happen on the coordinator and never
/// involve a collective.
pub struct Driver<M, C> {
    ctx: WorkerContext,
    size: NonZeroUsize,
    cfg: TrainConfig,
    steps: Steps,
    model: Arc<Mutex<M>>,
    sync: Synchronizer<C>,
    schedule: LrSchedule,
    checkpoints: CheckpointManager,
    events: Option<EventLog>,
    grad: Vec<f32>,
    phase: Phase,
}

impl<M, C> Driver<M, C>
where
    M: Model + Send + 'static,
    C: Collective,
{
    /// Creates a new `Driver`, on the coordinator this also creates the logging directories.
    ///
    /// # Arguments
    /// * `ctx` - This worker's identity.
    /// * `cfg` - The run's configuration.
    /// * `steps` - The amount of training and validation steps per epoch.
    /// * `model` - The model to train.
    /// * `collective` - The transport to the rest of the fleet.
    ///
    /// # Returns
    /// The driver, or an error if the configuration is invalid, the collective doesn't match
    /// `ctx` or the logging directories can't be created.
    pub fn new(
        ctx: WorkerContext,
        cfg: TrainConfig,
        steps: Steps,
        model: M,
        collective: C,
    ) -> Result<Self> {
        cfg.validate()?;

        if collective.rank() != ctx.rank() || collective.size() != ctx.size() {
            return Err(WorkerErr::Config(format!(
                "the collective is rank {} of {}, the worker is rank {} of {}",
                collective.rank(),
                collective.size(),
                ctx.rank(),
                ctx.size()
            )));
        }

        let size = NonZeroUsize::new(ctx.size())
            .ok_or_else(|| WorkerErr::Config("the fleet can't be empty".into()))?;
        let schedule = cfg.schedule(size)?;
        let checkpoints = CheckpointManager::new(&cfg.logging_dir);

        let events = if ctx.is_coordinator() {
            checkpoints.create_dir()?;
            let events = EventLog::open(&cfg.logging_dir)?;
            info!("metric events go to {}", events.path().display());
            Some(events)
        } else {
            None
        };

        Ok(Self {
            ctx,
            size,
            steps,
            grad: vec![0.; model.size()],
            model: Arc::new(Mutex::new(model)),
            sync: Synchronizer::new(collective),
            schedule,
            checkpoints,
            events,
            cfg,
            phase: Phase::DiscoverCheckpoint,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Gives back the collective, to disconnect it once training is done.
    pub fn into_collective(self) -> C {
        self.sync.into_inner()
    }

    /// Runs the training from the latest checkpoint, or from scratch, to `cfg.epochs`.
    ///
    /// # Arguments
    /// * `train` - This worker's training batches.
    /// * `validation` - The whole validation split, only this worker's shard of it is evaluated.
    ///
    /// # Returns
    /// The run's report, or the error that aborted it. Every error is fatal.
    pub async fn run<L>(
        &mut self,
        train: &mut Prefetcher,
        validation: ValidationStream<L>,
    ) -> Result<TrainingReport>
    where
        L: ExampleLoader + 'static,
    {
        let rank = self.ctx.rank();
        self.drive(train, validation)
            .await
            .inspect_err(|e| error!(rank = rank; "training aborted: {e}"))
    }

    async fn drive<L>(
        &mut self,
        train: &mut Prefetcher,
        validation: ValidationStream<L>,
    ) -> Result<TrainingReport>
    where
        L: ExampleLoader + 'static,
    {
        let mut validation = validation.shard(self.ctx.rank(), self.size);

        self.enter(Phase::DiscoverCheckpoint);
        let (mut state, initial_epoch) = self.discover_checkpoint().await?;

        self.enter(Phase::SynchronizeInitialState);
        self.sync.broadcast_state(&mut state, 0).await?;
        state.current_epoch = initial_epoch;
        self.adapt_lr(&mut state);

        let mut history = Vec::new();

        for epoch in initial_epoch..self.cfg.epochs {
            let lr = self.on_epoch_start(epoch);
            let started = Instant::now();

            self.enter(Phase::RunSteps);
            let train_stats = self.run_steps(train, &mut state).await?;
            let (back, val_stats) = self.evaluate(&mut state, validation).await?;
            validation = back;

            self.enter(Phase::AverageMetrics);
            let local = EpochMetrics::from_stats(&train_stats, &val_stats);
            let metrics = self.sync.average_metrics(&local).await?;

            self.enter(Phase::AdaptLr);
            state.current_epoch = epoch + 1;
            self.adapt_lr(&mut state);

            self.on_epoch_end(epoch, lr, &metrics, started.elapsed(), &state)?;
            history.push(EpochSummary { epoch, lr, metrics });
        }

        self.enter(Phase::Done);

        Ok(TrainingReport {
            initial_epoch,
            final_epoch: state.current_epoch,
            history,
            model_parameters: state.model_parameters,
        })
    }

    fn enter(&mut self, phase: Phase) {
        debug!(rank = self.ctx.rank(); "entering {phase:?}");
        self.phase = phase;
    }

    /// Builds this worker's initial state and agrees with the fleet on the epoch to start at.
    ///
    /// Only the coordinator reads the filesystem, the rest start from a zeroed placeholder
    /// that the following state broadcast overwrites. A coordinator that fails to do so still
    /// takes part in the epoch broadcast, announcing `ABORTED_EPOCH`, so the whole fleet stops.
    async fn discover_checkpoint(&mut self) -> Result<(TrainingState, usize)> {
        let local = self.initial_state().and_then(|(state, epoch)| {
            let epoch = u32::try_from(epoch)
                .ok()
                .filter(|&e| e != ABORTED_EPOCH)
                .ok_or_else(|| WorkerErr::Config(format!("epoch {epoch} is out of range")))?;
            Ok((state, epoch))
        });

        let announced = local.as_ref().map_or(ABORTED_EPOCH, |(_, epoch)| *epoch);
        let initial_epoch = self.sync.broadcast_scalar(announced, 0).await?;
        let (state, _) = local?;

        if initial_epoch == ABORTED_EPOCH {
            return Err(CollectiveErr::Aborted(
                "the coordinator failed to load the initial state".into(),
            )
            .into());
        }

        debug!(rank = self.ctx.rank(), epoch = initial_epoch; "agreed on the initial epoch");
        Ok((state, initial_epoch as usize))
    }

    fn initial_state(&self) -> Result<(TrainingState, usize)> {
        let optimizer = Sgd::new(
            self.grad.len(),
            0.,
            self.cfg.momentum,
            self.cfg.weight_decay,
        );
        let model = self.model.lock();

        if !self.ctx.is_coordinator() {
            return Ok((TrainingState::zeroed(&*model, optimizer)?, 0));
        }

        let Some((epoch, path)) = self.checkpoints.discover_latest(self.cfg.epochs) else {
            info!(seed = self.cfg.seed; "no checkpoint found, starting from scratch");
            return Ok((TrainingState::fresh(&*model, optimizer, self.cfg.seed)?, 0));
        };

        let snapshot = self.checkpoints.load(&path)?;
        if snapshot.epoch != epoch {
            return Err(WorkerErr::Checkpoint {
                path,
                detail: format!("named after epoch {epoch}, holds epoch {}", snapshot.epoch),
            });
        }
        snapshot.ensure_shape(self.run_shape(), &path)?;

        let mut state = TrainingState::zeroed(&*model, optimizer)?;
        state.restore(
            epoch,
            &snapshot.model_parameters,
            &snapshot.optimizer_parameters,
        )?;

        info!(epoch = epoch; "resuming from {}", path.display());
        Ok((state, epoch))
    }

    fn run_shape(&self) -> RunShape {
        RunShape {
            num_workers: self.size.get(),
            base_lr: self.cfg.base_lr,
        }
    }

    fn on_epoch_start(&self, epoch: usize) -> f64 {
        let lr = self.schedule.effective_lr(epoch as f64);
        let level = self.report_level();
        log!(
            level,
            rank = self.ctx.rank(),
            epoch = epoch;
            "epoch {}/{} starting, lr {lr:.6}",
            epoch + 1,
            self.cfg.epochs
        );
        lr
    }

    /// Sets the rate of the epoch `state` is about to train.
    fn adapt_lr(&self, state: &mut TrainingState) {
        let lr = self.schedule.effective_lr(state.current_epoch as f64);
        state.optimizer.set_learning_rate(lr as f32);
        debug!(
            rank = self.ctx.rank(),
            epoch = state.current_epoch;
            "optimizer rate set to {}",
            state.optimizer.learning_rate()
        );
    }

    async fn run_steps(
        &mut self,
        train: &mut Prefetcher,
        state: &mut TrainingState,
    ) -> Result<BatchStats> {
        let mut stats = BatchStats::default();

        for _ in 0..self.steps.per_epoch {
            let batch = train.next().await?;

            // Move the buffers out to satisfy `'static` for spawn_blocking, without copying.
            let model = Arc::clone(&self.model);
            let params = mem::take(&mut state.model_parameters);
            let mut grad = mem::take(&mut self.grad);

            let (params, grad, step) = task::spawn_blocking(move || {
                grad.fill(0.);
                let step = model.lock().train_step(
                    &params,
                    batch.inputs.view(),
                    batch.labels.view(),
                    &mut grad,
                );
                (params, grad, step)
            })
            .await?;

            state.model_parameters = params;
            self.grad = grad;
            stats.merge(&step?);

            self.sync.average_gradients(&mut self.grad).await?;
            state
                .optimizer
                .update_params(&self.grad, &mut state.model_parameters)?;
        }

        Ok(stats)
    }

    async fn evaluate<L>(
        &mut self,
        state: &mut TrainingState,
        mut validation: ValidationStream<L>,
    ) -> Result<(ValidationStream<L>, BatchStats)>
    where
        L: ExampleLoader + 'static,
    {
        let model = Arc::clone(&self.model);
        let params = mem::take(&mut state.model_parameters);
        let steps = self.steps.validation;

        let (validation, params, stats) = task::spawn_blocking(move || {
            let stats = evaluate_batches(&mut *model.lock(), &params, &mut validation, steps);
            (validation, params, stats)
        })
        .await?;

        state.model_parameters = params;
        Ok((validation, stats?))
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        lr: f64,
        metrics: &EpochMetrics,
        elapsed: Duration,
        state: &TrainingState,
    ) -> Result<()> {
        let level = self.report_level();
        log!(
            level,
            rank = self.ctx.rank(),
            epoch = epoch;
            "loss {:.4} - accuracy {:.4} - top5 {:.4} - val_loss {:.4} - val_accuracy {:.4} - val_top5 {:.4} ({:.1}s)",
            metrics.loss,
            metrics.accuracy,
            metrics.top5_accuracy,
            metrics.val_loss,
            metrics.val_accuracy,
            metrics.val_top5_accuracy,
            elapsed.as_secs_f64(),
        );

        if !self.ctx.is_coordinator() {
            return Ok(());
        }

        self.enter(Phase::Checkpoint);
        self.checkpoints
            .save(state, state.current_epoch, self.run_shape())?;

        // An epoch is recorded only once its checkpoint exists.
        if let Some(events) = &mut self.events {
            events.record(&EpochRecord {
                epoch,
                lr,
                metrics: *metrics,
                elapsed_secs: elapsed.as_secs_f64(),
            })?;
        }

        Ok(())
    }

    /// Only the coordinator reports at info level, so the fleet doesn't interleave its output.
    fn report_level(&self) -> Level {
        if self.ctx.is_coordinator() {
            Level::Info
        } else {
            Level::Debug
        }
    }
}

fn evaluate_batches<M, L>(
    model: &mut M,
    params: &[f32],
    validation: &mut ValidationStream<L>,
    steps: usize,
) -> Result<BatchStats>
where
    M: Model,
    L: ExampleLoader,
{
    validation.reset();
    let mut stats = BatchStats::default();

    for batch in validation.by_ref().take(steps) {
        let batch = batch?;
        stats.merge(&model.evaluate(params, batch.inputs.view(), batch.labels.view())?);
    }

    Ok(stats)
}
