//! Framed message transport and the collective operations built on top of it.
//!
//! A frame is a big endian `u64` body length followed by the body, the body being a
//! serialized [`msg::Msg`]. [`collective`] turns a set of framed links into a fleet that can
//! average and broadcast `f32` buffers.

pub mod collective;
mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;

use tokio::io::{AsyncRead, AsyncWrite};

pub use deserialize::Deserialize;
pub use receiver::{DEFAULT_MAX_FRAME_LEN, OnoReceiver};
pub use sender::OnoSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Wraps the two halves of a byte stream into the framed ends of a link.
///
/// # Arguments
/// * `rx` - The readable half.
/// * `tx` - The writable half.
///
/// # Returns
/// The receiving and sending ends of the link.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (OnoReceiver::new(rx), OnoSender::new(tx))
}
