use std::{borrow::Cow, fmt, io};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    /// A participant's input to a collective operation.
    Contribution(&'a [f32]),
    /// The value every participant agrees on once the operation completes.
    Outcome(&'a mut [f32]),
}

/// The kind of collective operation being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    AllreduceMean,
    Broadcast { root: usize },
}

/// Identifies a single collective call.
///
/// Every participant numbers its collective calls, two participants are in sync as long as
/// the headers they attach to the same call are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OpHeader {
    pub seq: u64,
    pub op: OpKind,
    pub len: usize,
}

impl fmt::Display for OpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            OpKind::AllreduceMean => write!(f, "#{} allreduce of {} values", self.seq, self.len),
            OpKind::Broadcast { root } => write!(
                f,
                "#{} broadcast from rank {root} of {} values",
                self.seq, self.len
            ),
        }
    }
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Join { rank: usize, size: usize },
    Collective(OpHeader),
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// Returns a short name for the kind of message, used for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Join { .. }) => "control/join",
            Msg::Control(Command::Collective(_)) => "control/collective",
            Msg::Control(Command::Disconnect) => "control/disconnect",
            Msg::Data(Payload::Contribution(_)) => "data/contribution",
            Msg::Data(Payload::Outcome(_)) => "data/outcome",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid message kind {kind:#x}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                let header = (0 as Header).to_be_bytes();
                buf.extend_from_slice(&header);
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                let header = (1 as Header).to_be_bytes();
                buf.extend_from_slice(&header);

                // A derived `Command` written into a `Vec` has no way to fail.
                serde_json::to_writer(buf, &cmd).unwrap();
                None
            }
            Msg::Data(payload) => {
                let (kind, nums): (Header, &[f32]) = match payload {
                    Payload::Contribution(values) => (2, *values),
                    Payload::Outcome(values) => (3, &**values),
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                Some(bytemuck::cast_slice(nums))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);
        let mut kind_bytes = [0; HEADER_SIZE];
        kind_bytes.copy_from_slice(kind_buf);
        let kind = Header::from_be_bytes(kind_bytes);

        match kind {
            0 => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            1 => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            2..4 => {
                let nums = bytemuck::try_cast_slice_mut(rest).map_err(|err| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("{err:?}"))
                })?;

                let payload = match kind {
                    2 => Payload::Contribution(nums),
                    _ => Payload::Outcome(nums),
                };

                Ok(Self::Data(payload))
            }
            kind => Self::invalid_kind(kind),
        }
    }
}
