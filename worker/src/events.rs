use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::{Result, metrics::EpochMetrics};

/// One line of the event log.
#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub lr: f64,
    #[serde(flatten)]
    pub metrics: EpochMetrics,
    pub elapsed_secs: f64,
}

/// An append only JSON lines log of the fleet wide metrics of every epoch, written to
/// `<logging_dir>/tensorboard/events.jsonl` by the coordinator.
pub struct EventLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl EventLog {
    /// Opens the event log, creating its directory if missing. Records of previous runs are
    /// kept so a resumed run continues the same log.
    pub fn open(logging_dir: &Path) -> Result<Self> {
        let dir = logging_dir.join("tensorboard");
        fs::create_dir_all(&dir)?;

        let path = dir.join("events.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `record` and flushes it to disk.
    pub fn record(&mut self, record: &EpochRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record).map_err(std::io::Error::from)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
