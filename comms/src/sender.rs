use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, Serialize};

/// The writing end of a framed link.
///
/// Message bodies are assembled in a scratch buffer reused across sends. Whatever a message
/// lends as a trailing slice, typically an `f32` payload, goes to the wire straight from the
/// caller's memory.
pub struct OnoSender<W: AsyncWrite + Unpin> {
    tx: W,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    pub(crate) fn new(tx: W) -> Self {
        Self {
            tx,
            scratch: Vec::new(),
        }
    }

    /// Writes `msg` as a single frame and flushes it.
    ///
    /// # Arguments
    /// * `msg` - The message to send.
    ///
    /// # Returns
    /// An io error if the stream failed or the frame can't be described by its length prefix.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.scratch.clear();
        self.scratch.extend_from_slice(&[0; LEN_TYPE_SIZE]);

        let lent = msg.serialize(&mut self.scratch);
        let body_len = self.scratch.len() - LEN_TYPE_SIZE + lent.map_or(0, <[u8]>::len);
        let prefix = LenType::try_from(body_len).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("a {body_len} bytes frame doesn't fit its length prefix"),
            )
        })?;

        self.scratch[..LEN_TYPE_SIZE].copy_from_slice(&prefix.to_be_bytes());
        self.tx.write_all(&self.scratch).await?;

        if let Some(payload) = lent {
            self.tx.write_all(payload).await?;
        }

        self.tx.flush().await
    }

    /// Closes the writing half, the other end reads an end of stream after the last frame.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}
