use std::borrow::Cow;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Collective, CollectiveErr, Result};
use crate::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, OpHeader, OpKind, Payload},
};

struct Link<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rx: OnoReceiver<R>,
    tx: OnoSender<W>,
}

/// A collective with a star topology over framed byte streams.
///
/// Rank 0 is the hub: every other rank sends it the header of the call followed by its
/// contribution, the hub validates the headers, reduces in rank order and replies with the
/// outcome. Since every peer receives the exact bytes the hub computed, all ranks end up with
/// bit-identical results.
///
/// When the hub detects a desync it forwards the error to every peer, so the whole fleet aborts
/// instead of hanging on the next call.
pub struct StarCollective<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rank: usize,
    size: usize,
    seq: u64,
    // On the hub `links[i]` talks to rank `i + 1`, on a peer `links[0]` talks to the hub.
    links: Vec<Link<R, W>>,
    rx_buf: Vec<f32>,
}

impl<R, W> StarCollective<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Creates the hub (rank 0) of a star fleet.
    ///
    /// # Arguments
    /// * `peers` - The channels to every other rank, ordered by rank starting at rank 1.
    ///
    /// # Returns
    /// A new `StarCollective` for a fleet of `peers.len() + 1` participants.
    pub fn hub(peers: Vec<(OnoReceiver<R>, OnoSender<W>)>) -> Self {
        let size = peers.len() + 1;
        let links = peers.into_iter().map(|(rx, tx)| Link { rx, tx }).collect();
        Self::new(0, size, links)
    }

    /// Creates a non-hub participant of a star fleet.
    ///
    /// # Arguments
    /// * `rank` - This participant's rank, in `1..size`.
    /// * `size` - The amount of participants in the fleet.
    /// * `rx` - The receiving end of the channel to the hub.
    /// * `tx` - The sending end of the channel to the hub.
    ///
    /// # Returns
    /// A new `StarCollective` instance.
    pub fn peer(rank: usize, size: usize, rx: OnoReceiver<R>, tx: OnoSender<W>) -> Self {
        Self::new(rank, size, vec![Link { rx, tx }])
    }

    fn new(rank: usize, size: usize, links: Vec<Link<R, W>>) -> Self {
        Self {
            rank,
            size,
            seq: 0,
            links,
            rx_buf: Vec::new(),
        }
    }

    /// Gracefully closes the fleet, every rank must call it once it is done with collectives.
    ///
    /// Each link exchanges a disconnect message in both directions before its writing half is
    /// shut down.
    ///
    /// # Returns
    /// An io error if the disconnect handshake failed.
    pub async fn disconnect(mut self) -> Result<()> {
        let rank = self.rank;
        let msg = Msg::Control(Command::Disconnect);
        let Self { links, rx_buf, .. } = &mut self;

        if rank == 0 {
            for (i, link) in links.iter_mut().enumerate() {
                await_disconnect(&mut link.rx, rx_buf, i + 1).await?;
                link.tx.send(&msg).await?;
                link.tx.shutdown().await?;
            }
        } else {
            for link in links.iter_mut() {
                link.tx.send(&msg).await?;
                await_disconnect(&mut link.rx, rx_buf, 0).await?;
                link.tx.shutdown().await?;
            }
        }

        debug!(rank = rank; "disconnected from the fleet");
        Ok(())
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

    /// Receives and validates the header of every peer, handing the data sent by the peers
    /// that carry any to `on_values` in rank order.
    async fn hub_gather<F>(&mut self, header: OpHeader, mut on_values: F) -> Result<()>
    where
        F: FnMut(&[f32]) + Send,
    {
        let Self { links, rx_buf, .. } = self;

        for i in 0..links.len() {
            let rank = i + 1;
            let link = &mut links[i];

            let got = match recv_header(&mut link.rx, rx_buf, rank).await {
                Ok(got) => got,
                Err(e) => return Err(abort_fleet(links, e).await),
            };

            if got != header {
                let err = CollectiveErr::Desync {
                    rank,
                    expected: header,
                    got,
                };
                return Err(abort_fleet(links, err).await);
            }

            if !carries_data(header.op, rank) {
                continue;
            }

            let link = &mut links[i];
            match recv_values(&mut link.rx, rx_buf, rank).await {
                Ok(values) if values.len() == header.len => on_values(values),
                Ok(_) => {
                    let err = CollectiveErr::UnexpectedMessage {
                        rank,
                        got: "data of the wrong length",
                    };
                    return Err(abort_fleet(links, err).await);
                }
                Err(e) => return Err(abort_fleet(links, e).await),
            }
        }

        Ok(())
    }

    async fn hub_scatter(&mut self, buf: &mut [f32]) -> Result<()> {
        for link in self.links.iter_mut() {
            let msg = Msg::Data(Payload::Outcome(&mut *buf));
            link.tx.send(&msg).await?;
        }

        Ok(())
    }

    async fn peer_exchange(&mut self, header: OpHeader, buf: &mut [f32]) -> Result<()> {
        let rank = self.rank;
        let Self { links, rx_buf, .. } = self;
        let hub = &mut links[0];

        hub.tx.send(&Msg::Control(Command::Collective(header))).await?;

        if carries_data(header.op, rank) {
            hub.tx.send(&Msg::Data(Payload::Contribution(buf))).await?;
        }

        let values = recv_values(&mut hub.rx, rx_buf, 0).await?;
        if values.len() != buf.len() {
            return Err(CollectiveErr::UnexpectedMessage {
                rank: 0,
                got: "data of the wrong length",
            });
        }

        buf.copy_from_slice(values);
        Ok(())
    }
}

impl<R, W> Collective for StarCollective<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn allreduce_mean(&mut self, buf: &mut [f32]) -> Result<()> {
        let header = self.next_header(OpKind::AllreduceMean, buf.len());

        if self.rank != 0 {
            return self.peer_exchange(header, buf).await;
        }

        let mut acc = buf.to_vec();
        self.hub_gather(header, |values| {
            for (a, x) in acc.iter_mut().zip(values) {
                *a += x;
            }
        })
        .await?;

        let n = self.size as f32;
        for (b, a) in buf.iter_mut().zip(&acc) {
            *b = a / n;
        }

        self.hub_scatter(buf).await
    }

    async fn broadcast(&mut self, buf: &mut [f32], root: usize) -> Result<()> {
        if root >= self.size {
            return Err(CollectiveErr::InvalidRoot {
                root,
                size: self.size,
            });
        }

        let header = self.next_header(OpKind::Broadcast { root }, buf.len());

        if self.rank != 0 {
            return self.peer_exchange(header, buf).await;
        }

        self.hub_gather(header, |values| buf.copy_from_slice(values))
            .await?;

        self.hub_scatter(buf).await
    }
}

/// Returns whether `rank` has to send its data to the hub for an operation.
fn carries_data(op: OpKind, rank: usize) -> bool {
    match op {
        OpKind::AllreduceMean => true,
        OpKind::Broadcast { root } => root == rank,
    }
}

async fn recv_header<R>(
    rx: &mut OnoReceiver<R>,
    rx_buf: &mut Vec<f32>,
    rank: usize,
) -> Result<OpHeader>
where
    R: AsyncRead + Unpin,
{
    match rx.recv_into(rx_buf).await? {
        Msg::Control(Command::Collective(header)) => Ok(header),
        Msg::Err(detail) => Err(CollectiveErr::Aborted(detail.into_owned())),
        other => Err(CollectiveErr::UnexpectedMessage {
            rank,
            got: other.kind(),
        }),
    }
}

async fn recv_values<'b, R>(
    rx: &mut OnoReceiver<R>,
    rx_buf: &'b mut Vec<f32>,
    rank: usize,
) -> Result<&'b [f32]>
where
    R: AsyncRead + Unpin,
{
    let values: &[f32] = match rx.recv_into(rx_buf).await? {
        Msg::Data(Payload::Contribution(values)) => values,
        Msg::Data(Payload::Outcome(values)) => values,
        Msg::Err(detail) => return Err(CollectiveErr::Aborted(detail.into_owned())),
        other => {
            return Err(CollectiveErr::UnexpectedMessage {
                rank,
                got: other.kind(),
            });
        }
    };

    Ok(values)
}

async fn await_disconnect<R>(
    rx: &mut OnoReceiver<R>,
    rx_buf: &mut Vec<f32>,
    rank: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match rx.recv_into(rx_buf).await? {
        Msg::Control(Command::Disconnect) => Ok(()),
        other => Err(CollectiveErr::UnexpectedMessage {
            rank,
            got: other.kind(),
        }),
    }
}

/// Tells every peer the fleet is aborting and returns the error that caused it.
async fn abort_fleet<R, W>(links: &mut [Link<R, W>], err: CollectiveErr) -> CollectiveErr
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let detail = err.to_string();
    let msg = Msg::Err(Cow::Borrowed(&detail));

    for (i, link) in links.iter_mut().enumerate() {
        if let Err(e) = link.tx.send(&msg).await {
            warn!(rank = i + 1; "failed to notify abort: {e}");
        }
    }

    err
}
