use std::{
    io,
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
};

use clap::Parser;
use comms::collective::{Collective, MemoryCollective, accept_peers, join_hub};
use log::info;
use machine_learning::arch::Classifier;
use tokio::{net::TcpListener, signal};
use worker::{
    Driver, Steps, TrainConfig, TrainingReport, WorkerContext, WorkerErr,
    config::{
        DEFAULT_BASE_LR, DEFAULT_BATCH_SIZE, DEFAULT_DECAY_EPOCHS, DEFAULT_DECAY_MULTIPLIERS,
        DEFAULT_EPOCHS, DEFAULT_IMAGE_SIZE, DEFAULT_MOMENTUM, DEFAULT_PREFETCH_BUFFER_SIZE,
        DEFAULT_SEED, DEFAULT_SHUFFLE_BUFFER_SIZE, DEFAULT_WARMUP_EPOCHS, DEFAULT_WEIGHT_DECAY,
    },
    data::{Catalog, ExampleLoader, ImageLoader, Prefetcher, TrainStream, ValidationStream},
};

const DEFAULT_COORDINATOR_ADDR: &str = "127.0.0.1:29500";

/// One worker of a distributed image classification training run.
#[derive(Parser, Debug)]
#[command(name = "node", version)]
struct Args {
    /// Dataset root, holding `train/<class>/*` and `val/<class>/*`
    #[arg(long, env = "DATA_DIR")]
    data_dir: PathBuf,

    /// Where checkpoints and metric events are written
    #[arg(long, env = "LOGGING_DIR")]
    logging_dir: PathBuf,

    /// This worker's rank
    #[arg(long, env = "RANK", default_value_t = 0)]
    rank: usize,

    /// Amount of workers in the fleet
    #[arg(long, env = "WORLD_SIZE", default_value_t = 1)]
    world_size: usize,

    /// This worker's rank within its host
    #[arg(long, env = "LOCAL_RANK", default_value_t = 0)]
    local_rank: usize,

    /// Address the coordinator listens at and the rest of the workers connect to
    #[arg(long, env = "COORDINATOR_ADDR", default_value = DEFAULT_COORDINATOR_ADDR)]
    coordinator_addr: SocketAddr,

    #[arg(long, env = "SHUFFLE_BUFFER_SIZE", default_value_t = DEFAULT_SHUFFLE_BUFFER_SIZE)]
    shuffle_buffer_size: usize,

    #[arg(long, env = "PREFETCH_BUFFER_SIZE", default_value_t = DEFAULT_PREFETCH_BUFFER_SIZE)]
    prefetch_buffer_size: usize,

    /// Input batch size for training
    #[arg(long, env = "BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Input batch size for validation
    #[arg(long, env = "VAL_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    val_batch_size: usize,

    /// Number of warmup epochs, fractions allowed
    #[arg(long, env = "WARMUP_EPOCHS", default_value_t = DEFAULT_WARMUP_EPOCHS)]
    warmup_epochs: f64,

    /// Number of epochs to train
    #[arg(long, env = "EPOCHS", default_value_t = DEFAULT_EPOCHS)]
    epochs: usize,

    /// Learning rate of a single worker
    #[arg(long, env = "BASE_LR", default_value_t = DEFAULT_BASE_LR)]
    base_lr: f64,

    #[arg(long, env = "MOMENTUM", default_value_t = DEFAULT_MOMENTUM)]
    momentum: f32,

    #[arg(long, env = "WEIGHT_DECAY", default_value_t = DEFAULT_WEIGHT_DECAY)]
    weight_decay: f32,

    /// Seed of the weight initialization
    #[arg(long, env = "SEED", default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// Side of the square images are resized to
    #[arg(long, env = "IMAGE_SIZE", default_value_t = DEFAULT_IMAGE_SIZE)]
    image_size: u32,

    /// Training steps per epoch, derived from the dataset size when missing
    #[arg(long, env = "STEPS_PER_EPOCH")]
    steps_per_epoch: Option<usize>,

    /// Validation steps per epoch, derived from the dataset size when missing
    #[arg(long, env = "VALIDATION_STEPS")]
    validation_steps: Option<usize>,

    /// Epochs where the learning rate drops
    #[arg(
        long,
        env = "DECAY_EPOCHS",
        value_delimiter = ',',
        default_values_t = DEFAULT_DECAY_EPOCHS,
    )]
    decay_epochs: Vec<f64>,

    /// Learning rate multiplier of every range between decay epochs
    #[arg(
        long,
        env = "DECAY_MULTIPLIERS",
        value_delimiter = ',',
        default_values_t = DEFAULT_DECAY_MULTIPLIERS,
    )]
    decay_multipliers: Vec<f64>,
}

impl Args {
    fn config(&self) -> worker::Result<TrainConfig> {
        let mut cfg = TrainConfig::new(&self.data_dir, &self.logging_dir);

        cfg.shuffle_buffer_size = non_zero("shuffle-buffer-size", self.shuffle_buffer_size)?;
        cfg.prefetch_buffer_size = non_zero("prefetch-buffer-size", self.prefetch_buffer_size)?;
        cfg.batch_size = non_zero("batch-size", self.batch_size)?;
        cfg.val_batch_size = non_zero("val-batch-size", self.val_batch_size)?;
        cfg.warmup_epochs = self.warmup_epochs;
        cfg.epochs = self.epochs;
        cfg.base_lr = self.base_lr;
        cfg.momentum = self.momentum;
        cfg.weight_decay = self.weight_decay;
        cfg.seed = self.seed;
        cfg.image_size = NonZeroU32::new(self.image_size)
            .ok_or_else(|| WorkerErr::Config("image-size must be positive".into()))?;
        cfg.steps_per_epoch = self
            .steps_per_epoch
            .map(|n| non_zero("steps-per-epoch", n))
            .transpose()?;
        cfg.validation_steps = self
            .validation_steps
            .map(|n| non_zero("validation-steps", n))
            .transpose()?;
        cfg.decay_epochs = self.decay_epochs.clone();
        cfg.decay_multipliers = self.decay_multipliers.clone();

        cfg.validate()?;
        Ok(cfg)
    }
}

fn non_zero(flag: &str, n: usize) -> worker::Result<NonZeroUsize> {
    NonZeroUsize::new(n).ok_or_else(|| WorkerErr::Config(format!("{flag} must be positive")))
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let ctx = WorkerContext::new(args.rank, args.world_size, args.local_rank)?;
    let cfg = args.config()?;

    info!(
        rank = ctx.rank(),
        size = ctx.size(),
        local_rank = ctx.local_rank();
        "starting worker"
    );

    tokio::select! {
        ret = run(ctx, cfg, args.coordinator_addr) => {
            let report = ret?;
            info!(rank = ctx.rank(); "training finished at epoch {}", report.final_epoch);
        }
        _ = signal::ctrl_c() => {
            info!("received SIGINT");
        }
    }

    Ok(())
}

async fn run(
    ctx: WorkerContext,
    cfg: TrainConfig,
    coordinator_addr: SocketAddr,
) -> worker::Result<TrainingReport> {
    let train = Catalog::scan(&cfg.train_dir())?;
    let val = Catalog::scan_with_classes(&cfg.validation_dir(), train.classes().to_vec())?;
    info!(
        rank = ctx.rank();
        "{} training and {} validation examples over {} classes",
        train.len(),
        val.len(),
        train.classes().len()
    );

    let steps = Steps {
        per_epoch: cfg.steps_per_epoch(train.len(), ctx.size()),
        validation: cfg.validation_steps(val.len(), ctx.size()),
    };

    let loader = ImageLoader::new(cfg.image_size);
    let model = Classifier::new(loader.example_len(), train.classes().len());

    let stream = TrainStream::new(
        train,
        loader,
        ctx.rank() as u64,
        cfg.shuffle_buffer_size,
        cfg.batch_size,
    );
    let mut prefetcher = Prefetcher::spawn(stream, cfg.prefetch_buffer_size);
    let validation = ValidationStream::new(val, loader, cfg.val_batch_size);

    if ctx.size() == 1 {
        let collective = MemoryCollective::fleet(NonZeroUsize::MIN)
            .pop()
            .ok_or_else(|| WorkerErr::Config("failed to create a single worker fleet".into()))?;
        let (report, _) =
            train_with(ctx, cfg, steps, model, collective, &mut prefetcher, validation).await?;
        return Ok(report);
    }

    let collective = if ctx.is_coordinator() {
        let listener = TcpListener::bind(coordinator_addr).await?;
        info!("waiting for {} workers at {coordinator_addr}", ctx.size() - 1);
        accept_peers(listener, ctx.size()).await?
    } else {
        join_hub(coordinator_addr, ctx.rank(), ctx.size()).await?
    };

    let (report, collective) =
        train_with(ctx, cfg, steps, model, collective, &mut prefetcher, validation).await?;

    info!(rank = ctx.rank(); "wrapping up, disconnecting...");
    collective.disconnect().await?;
    Ok(report)
}

async fn train_with<C, L>(
    ctx: WorkerContext,
    cfg: TrainConfig,
    steps: Steps,
    model: Classifier,
    collective: C,
    prefetcher: &mut Prefetcher,
    validation: ValidationStream<L>,
) -> worker::Result<(TrainingReport, C)>
where
    C: Collective,
    L: ExampleLoader + 'static,
{
    let mut driver = Driver::new(ctx, cfg, steps, model, collective)?;
    let report = driver.run(prefetcher, validation).await?;
    Ok((report, driver.into_collective()))
}
