use std::{num::NonZeroUsize, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::Barrier;

use super::{Collective, CollectiveErr, Result};
use crate::msg::{OpHeader, OpKind};

#[derive(Default)]
struct Slot {
    header: Option<OpHeader>,
    data: Vec<f32>,
}

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Slot>>,
}

/// A collective whose participants live in the same process, typically one tokio task each.
///
/// Each call publishes this participant's header and data into its slot, waits for the whole
/// fleet on a barrier, validates every slot and reads the outcome. A second barrier keeps the
/// slots untouched until everyone has read them.
pub struct MemoryCollective {
    rank: usize,
    size: usize,
    seq: u64,
    shared: Arc<Shared>,
}

impl MemoryCollective {
    /// Creates every participant of an in-process fleet.
    ///
    /// # Arguments
    /// * `size` - The amount of participants.
    ///
    /// # Returns
    /// One `MemoryCollective` per rank, ordered by rank.
    pub fn fleet(size: NonZeroUsize) -> Vec<Self> {
        let size = size.get();
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size),
            slots: Mutex::new((0..size).map(|_| Slot::default()).collect()),
        });

        (0..size)
            .map(|rank| Self {
                rank,
                size,
                seq: 0,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn next_header(&mut self, op: OpKind, len: usize) -> OpHeader {
        let header = OpHeader {
            seq: self.seq,
            op,
            len,
        };

        self.seq += 1;
        header
    }

    fn publish(&self, header: OpHeader, data: Option<&[f32]>) {
        let mut slots = self.shared.slots.lock();
        let slot = &mut slots[self.rank];

        slot.header = Some(header);
        slot.data.clear();

        if let Some(data) = data {
            slot.data.extend_from_slice(data);
        }
    }

    fn check(&self, slots: &[Slot], expected: OpHeader) -> Result<()> {
        for (rank, slot) in slots.iter().enumerate() {
            match slot.header {
                Some(got) if got == expected => {}
                Some(got) => {
                    return Err(CollectiveErr::Desync {
                        rank,
                        expected,
                        got,
                    });
                }
                None => {
                    return Err(CollectiveErr::Aborted(format!(
                        "rank {rank} never reached {expected}"
                    )));
                }
            }
        }

        Ok(())
    }
}

impl Collective for MemoryCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn allreduce_mean(&mut self, buf: &mut [f32]) -> Result<()> {
        let header = self.next_header(OpKind::AllreduceMean, buf.len());
        self.publish(header, Some(buf));
        self.shared.barrier.wait().await;

        let outcome = {
            let slots = self.shared.slots.lock();
            self.check(&slots, header).map(|()| {
                buf.fill(0.0);

                for slot in slots.iter() {
                    for (b, x) in buf.iter_mut().zip(&slot.data) {
                        *b += x;
                    }
                }

                let n = self.size as f32;
                buf.iter_mut().for_each(|b| *b /= n);
            })
        };

        outcome?;
        self.shared.barrier.wait().await;
        Ok(())
    }

    async fn broadcast(&mut self, buf: &mut [f32], root: usize) -> Result<()> {
        if root >= self.size {
            return Err(CollectiveErr::InvalidRoot {
                root,
                size: self.size,
            });
        }

        let header = self.next_header(OpKind::Broadcast { root }, buf.len());
        let data = (self.rank == root).then_some(&*buf);
        self.publish(header, data);
        self.shared.barrier.wait().await;

        let outcome = {
            let slots = self.shared.slots.lock();
            self.check(&slots, header)
                .map(|()| buf.copy_from_slice(&slots[root].data))
        };

        outcome?;
        self.shared.barrier.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::task::JoinSet;

    use super::*;

    fn fleet(size: usize) -> Vec<MemoryCollective> {
        MemoryCollective::fleet(NonZeroUsize::new(size).unwrap())
    }

    #[tokio::test]
    async fn allreduce_averages_in_every_rank() {
        let mut set = JoinSet::new();

        for mut member in fleet(4) {
            set.spawn(async move {
                let r = member.rank() as f32;
                let mut buf = [r, 2.0 * r];
                member.allreduce_mean(&mut buf).await.map(|()| buf)
            });
        }

        while let Some(res) = set.join_next().await {
            assert_eq!(res.unwrap().unwrap(), [1.5, 3.0]);
        }
    }

    #[tokio::test]
    async fn broadcast_copies_the_root_value() {
        let mut set = JoinSet::new();

        for mut member in fleet(3) {
            set.spawn(async move {
                let mut buf = [member.rank() as f32; 2];
                member.broadcast(&mut buf, 2).await.map(|()| buf)
            });
        }

        while let Some(res) = set.join_next().await {
            assert_eq!(res.unwrap().unwrap(), [2.0, 2.0]);
        }
    }

    #[tokio::test]
    async fn mismatched_calls_are_detected_by_everyone() {
        let mut set = JoinSet::new();

        for mut member in fleet(2) {
            set.spawn(async move {
                let mut buf = [1.0];
                if member.rank() == 0 {
                    member.allreduce_mean(&mut buf).await
                } else {
                    member.broadcast(&mut buf, 0).await
                }
            });
        }

        while let Some(res) = set.join_next().await {
            let err = res.unwrap().unwrap_err();
            assert!(matches!(err, CollectiveErr::Desync { .. }), "{err}");
        }
    }

    #[tokio::test]
    async fn root_out_of_range_is_rejected() {
        let mut member = fleet(1).pop().unwrap();
        let mut buf = [0.0];

        let err = member.broadcast(&mut buf, 1).await.unwrap_err();
        assert!(matches!(err, CollectiveErr::InvalidRoot { root: 1, size: 1 }));
    }

    #[tokio::test]
    async fn single_member_fleet_is_identity() {
        let mut member = fleet(1).pop().unwrap();
        let mut buf = [0.1, 0.2, 0.3];

        member.allreduce_mean(&mut buf).await.unwrap();
        member.broadcast(&mut buf, 0).await.unwrap();
        assert_eq!(buf, [0.1, 0.2, 0.3]);
    }
}
