//! Spacesync networking primitives
//!
//! This crate provides:
//! - Peer identity derived from transport public keys
//! - Length-prefixed message framing
//! - Transport keys and session encryption
//! - The authenticated handshake establishing a secure channel
//! - Wire message types for the sync protocol

pub mod crypto;
pub mod framing;
pub mod handshake;
pub mod messages;
pub mod peer;

pub use crypto::KeyPair;
pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use handshake::{HandshakeError, SecureChannel};
pub use peer::{PeerId, PeerInfo};
