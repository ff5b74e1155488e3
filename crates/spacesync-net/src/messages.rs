//! Wire message types for the sync protocol
//!
//! Every message is postcard-encoded into a frame payload. The diff
//! response classifies the remote condition: a peer that has never heard
//! of the space answers `SpaceMissing`, a peer that tombstoned it answers
//! `SpaceDeleted`; conflating the two would cause spurious deletions on
//! the requesting side.

use crate::framing::{Frame, FrameType};
use serde::{Deserialize, Serialize};
use spacesync_core::types::*;

/// Handshake: initiator introduces itself
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
    pub version: u16,
    /// Initiator's ed25519 identity key
    pub identity: Bytes32,
    /// Initiator's ephemeral x25519 key
    pub eph: Bytes32,
}

/// Handshake: responder accepts and proves its identity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloAck {
    pub identity: Bytes32,
    pub eph: Bytes32,
    /// Signature over both ephemerals and the initiator identity
    pub signature: Vec<u8>,
}

/// Handshake: initiator proves its identity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloConfirm {
    pub signature: Vec<u8>,
}

/// Keepalive probe
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Ping;

/// Keepalive answer
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Pong;

/// Ask which reconciliation scheme the peer serves
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DiffTypeRequest;

/// Capability answer
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DiffTypeResponse {
    pub diff_type: DiffType,
}

/// Evaluate ranges against the peer's element set for one space
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffRequest {
    pub space: SpaceId,
    pub ranges: Vec<DiffRange>,
}

/// Range evaluation outcome
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DiffResponse {
    Ranges(Vec<RangeResult>),
    SpaceMissing,
    SpaceDeleted,
    Error(String),
}

/// Push acknowledgement
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SpacePushAck {
    Ok,
    Rejected(String),
}

/// Pair a message type with its frame tag and generate the frame helpers.
macro_rules! frame_message {
    ($($msg:ty => $ft:expr),* $(,)?) => {$(
        impl WireMessage for $msg {
            const FRAME_TYPE: FrameType = $ft;
        }
    )*};
}

/// A message that travels as exactly one frame type.
pub trait WireMessage: Serialize + for<'de> Deserialize<'de> {
    const FRAME_TYPE: FrameType;

    fn to_frame(&self) -> Result<Frame, postcard::Error> {
        let payload = postcard::to_allocvec(self)?;
        Ok(Frame::new(Self::FRAME_TYPE, payload))
    }

    fn from_frame(frame: &Frame) -> Result<Self, postcard::Error>
    where
        Self: Sized,
    {
        postcard::from_bytes(&frame.payload)
    }
}

frame_message! {
    Hello => FrameType::Hello,
    HelloAck => FrameType::HelloAck,
    HelloConfirm => FrameType::HelloConfirm,
    Ping => FrameType::Ping,
    Pong => FrameType::Pong,
    DiffTypeRequest => FrameType::DiffTypeRequest,
    DiffTypeResponse => FrameType::DiffTypeResponse,
    DiffRequest => FrameType::DiffRequest,
    DiffResponse => FrameType::DiffResponse,
    SpacePushRequest => FrameType::SpacePush,
    SpacePushAck => FrameType::SpacePushAck,
}
