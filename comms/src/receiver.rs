use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Deserialize, LEN_TYPE_SIZE, LenType};

/// The largest frame body accepted unless configured otherwise, 4 GiB.
pub const DEFAULT_MAX_FRAME_LEN: u64 = 4 << 30;

/// The reading end of a framed link.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
    max_frame_len: u64,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    pub(crate) fn new(rx: R) -> Self {
        Self {
            rx,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Caps the body length of the frames this receiver accepts.
    ///
    /// A corrupt or hostile length prefix is rejected before anything gets allocated for it.
    pub fn with_max_frame_len(mut self, max_frame_len: u64) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Waits for the next frame and deserializes it.
    ///
    /// The body is read into `buf` as `f32` words, so that an `f32` payload placed after the
    /// 4 byte message header can be borrowed in place.
    ///
    /// # Arguments
    /// * `buf` - Scratch storage for the frame, the returned value borrows from it.
    ///
    /// # Returns
    /// The message, or an io error if the stream failed, the frame is too long or its body is
    /// malformed.
    pub async fn recv_into<'buf, T>(&mut self, buf: &'buf mut Vec<f32>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
    {
        let len = self.read_len().await?;

        buf.clear();
        buf.resize(len.div_ceil(size_of::<f32>()), 0.0);

        let body = &mut bytemuck::cast_slice_mut::<f32, u8>(buf)[..len];
        self.rx.read_exact(body).await?;

        T::deserialize(body)
    }

    async fn read_len(&mut self) -> io::Result<usize> {
        let mut prefix = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut prefix).await?;
        let len = LenType::from_be_bytes(prefix);

        if len > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "a {len} bytes frame exceeds the limit of {} bytes",
                    self.max_frame_len
                ),
            ));
        }

        usize::try_from(len).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
