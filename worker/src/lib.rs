pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod driver;
pub mod error;
pub mod events;
pub mod metrics;
pub mod schedule;
pub mod state;
pub mod sync;

pub use checkpoint::CheckpointManager;
pub use config::TrainConfig;
pub use context::WorkerContext;
pub use driver::{Driver, Phase, Steps, TrainingReport};
pub use error::{Result, WorkerErr};
pub use metrics::EpochMetrics;
pub use schedule::LrSchedule;
pub use state::TrainingState;
pub use sync::Synchronizer;
