use crate::{Result, WorkerErr};

/// The identity of this process within the training fleet.
///
/// It's created once at startup and passed by value to every component instead of being read
/// from global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerContext {
    rank: usize,
    size: usize,
    local_rank: usize,
}

impl WorkerContext {
    /// Creates a new `WorkerContext`.
    ///
    /// # Arguments
    /// * `rank` - This worker's unique id, in `0..size`.
    /// * `size` - The amount of workers in the fleet.
    /// * `local_rank` - This worker's id among the ones running on the same host.
    ///
    /// # Returns
    /// The context, or an error if `rank` is not within the fleet.
    pub fn new(rank: usize, size: usize, local_rank: usize) -> Result<Self> {
        if rank >= size {
            return Err(WorkerErr::Config(format!(
                "rank {rank} is out of a fleet of {size} workers"
            )));
        }

        Ok(Self {
            rank,
            size,
            local_rank,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    /// Returns true iff this worker is rank 0, the only one touching the filesystem.
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_zero_is_the_coordinator() {
        assert!(WorkerContext::new(0, 4, 0).unwrap().is_coordinator());
        assert!(!WorkerContext::new(3, 4, 1).unwrap().is_coordinator());
    }

    #[test]
    fn rank_outside_the_fleet_is_rejected() {
        assert!(matches!(
            WorkerContext::new(4, 4, 0),
            Err(WorkerErr::Config(_))
        ));
        assert!(WorkerContext::new(0, 0, 0).is_err());
    }
}
