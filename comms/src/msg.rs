use std::{borrow::Cow, io};

use half::f16;
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR: Header = 0;
const CONTROL: Header = 1;
const TENSOR: Header = 2;
const HALF_TENSOR: Header = 3;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    Tensor(&'a [f32]),
    HalfTensor(&'a [f16]),
}

impl Payload<'_> {
    /// The amount of numbers inside this payload.
    pub fn len(&self) -> usize {
        match self {
            Payload::Tensor(nums) => nums.len(),
            Payload::HalfTensor(nums) => nums.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// A worker announcing itself to the rendezvous host.
    Join { rank: usize, world_size: usize },
    /// The rendezvous host accepting the whole group.
    Welcome,
    /// A member reached a barrier.
    Barrier,
    /// Every member reached the barrier.
    Release,
    /// A member's contribution to a gather collective.
    Gather(serde_json::Value),
    /// A worker handing its entry point's return value to the launching process.
    Return(serde_json::Value),
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
    /// A short name for the kind of this message, used for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Data(Payload::Tensor(_)) => "data/tensor",
            Msg::Data(Payload::HalfTensor(_)) => "data/half-tensor",
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
            format!("Received an invalid kind header {kind}"),
        ))
    }

    fn invalid_payload<T>(err: bytemuck::PodCastError) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received a malformed tensor payload: {err:?}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Data(Payload::Tensor(nums)) => {
                buf.extend_from_slice(&TENSOR.to_be_bytes());
                Ok(Some(bytemuck::cast_slice(nums)))
            }
            Msg::Data(Payload::HalfTensor(nums)) => {
                buf.extend_from_slice(&HALF_TENSOR.to_be_bytes());
                Ok(Some(bytemuck::cast_slice(nums)))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);
        let mut kind = [0; HEADER_SIZE];
        kind.copy_from_slice(kind_buf);

        match Header::from_be_bytes(kind) {
            ERR => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            TENSOR => match bytemuck::try_cast_slice(rest) {
                Ok(nums) => Ok(Self::Data(Payload::Tensor(nums))),
                Err(err) => Self::invalid_payload(err),
            },
            HALF_TENSOR => match bytemuck::try_cast_slice(rest) {
                Ok(nums) => Ok(Self::Data(Payload::HalfTensor(nums))),
                Err(err) => Self::invalid_payload(err),
            },
            kind => Self::invalid_kind(kind),
        }
    }
}
