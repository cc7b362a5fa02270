use std::{io, net::SocketAddr, time::Duration};

use log::{debug, info};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

use super::{CollectiveErr, Result, StarCollective};
use crate::msg::{Command, Msg};

const CONNECT_ATTEMPTS: usize = 30;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// A star collective running over tcp connections.
pub type TcpStarCollective = StarCollective<OwnedReadHalf, OwnedWriteHalf>;

/// Waits until every other rank of the fleet has joined, making this process the hub.
///
/// # Arguments
/// * `listener` - The listener peers connect to.
/// * `size` - The amount of participants in the fleet, this one included.
///
/// # Returns
/// The hub's collective, or an error if a peer sent an invalid join request.
pub async fn accept_peers(listener: TcpListener, size: usize) -> Result<TcpStarCollective> {
    let mut slots: Vec<Option<_>> = (1..size).map(|_| None).collect();
    let mut rx_buf: Vec<f32> = Vec::new();

    while slots.iter().any(Option::is_none) {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;

        let (rx, tx) = stream.into_split();
        let (mut rx, tx) = crate::channel(rx, tx);

        let (rank, peer_size) = match rx.recv_into(&mut rx_buf).await? {
            Msg::Control(Command::Join { rank, size }) => (rank, size),
            other => {
                return Err(CollectiveErr::Handshake(format!(
                    "expected a join request from {addr}, got {}",
                    other.kind()
                )));
            }
        };

        if peer_size != size {
            return Err(CollectiveErr::Handshake(format!(
                "rank {rank} at {addr} expects a fleet of {peer_size}, this fleet has {size}"
            )));
        }

        let Some(slot) = rank.checked_sub(1).and_then(|i| slots.get_mut(i)) else {
            return Err(CollectiveErr::Handshake(format!(
                "{addr} requested the invalid rank {rank}"
            )));
        };

        if slot.is_some() {
            return Err(CollectiveErr::Handshake(format!(
                "rank {rank} joined twice, the second time from {addr}"
            )));
        }

        info!(rank = rank; "peer joined from {addr}");
        *slot = Some((rx, tx));
    }

    Ok(StarCollective::hub(slots.into_iter().flatten().collect()))
}

/// Connects to the fleet's hub as a non-hub rank.
///
/// The hub may not be listening yet, connecting is retried with exponential backoff.
///
/// # Arguments
/// * `addr` - The hub's address.
/// * `rank` - This participant's rank, in `1..size`.
/// * `size` - The amount of participants in the fleet.
///
/// # Returns
/// This peer's collective, or an error if the hub could not be reached.
pub async fn join_hub(addr: SocketAddr, rank: usize, size: usize) -> Result<TcpStarCollective> {
    if rank == 0 || rank >= size {
        return Err(CollectiveErr::Handshake(format!(
            "rank {rank} can't join a fleet of {size} as a peer"
        )));
    }

    let stream = connect_with_retry(addr).await?;
    stream.set_nodelay(true)?;

    let (rx, tx) = stream.into_split();
    let (rx, mut tx) = crate::channel(rx, tx);
    tx.send(&Msg::Control(Command::Join { rank, size })).await?;

    info!(rank = rank; "joined the fleet hub at {addr}");
    Ok(StarCollective::peer(rank, size, rx, tx))
}

async fn connect_with_retry(addr: SocketAddr) -> io::Result<TcpStream> {
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;

    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                debug!(attempt = attempt; "hub at {addr} unreachable: {e}");
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
