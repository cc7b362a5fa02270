//! Collective operations over a fixed fleet of participants.
//!
//! Every participant must issue the same collective calls in the same order, a call only
//! completes once the whole fleet has reached it.

mod error;
mod memory;
mod star;
mod tcp;

pub use error::{CollectiveErr, Result};
pub use memory::MemoryCollective;
pub use star::StarCollective;
pub use tcp::{TcpStarCollective, accept_peers, join_hub};

/// A blocking, barrier-like group communication primitive.
#[allow(unused)]
#[trait_variant::make(Collective: Send)]
pub trait LocalCollective {
    /// Returns the rank of this participant, in `0..size`.
    fn rank(&self) -> usize;

    /// Returns the amount of participants in the fleet.
    fn size(&self) -> usize;

    /// Replaces `buf` with the element-wise mean of every participant's `buf`.
    ///
    /// # Arguments
    /// * `buf` - This participant's contribution, overwritten with the fleet-wide mean.
    ///
    /// # Returns
    /// An error if the fleet is out of sync or the transport failed.
    async fn allreduce_mean(&mut self, buf: &mut [f32]) -> Result<()>;

    /// Replaces `buf` with the `buf` held by the participant at `root`.
    ///
    /// # Arguments
    /// * `buf` - The value to share if this participant is `root`, overwritten otherwise.
    /// * `root` - The rank that owns the value.
    ///
    /// # Returns
    /// An error if `root` is out of range, the fleet is out of sync or the transport failed.
    async fn broadcast(&mut self, buf: &mut [f32], root: usize) -> Result<()>;
}
