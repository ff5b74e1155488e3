//! Authenticated secure channel
//!
//! Every connection starts with a three-message handshake: the initiator
//! offers its identity and an ephemeral key, the responder answers with
//! its own pair and a signature binding both ephemerals, and the
//! initiator closes with its own proof. Both sides hold an authenticated
//! remote [`PeerId`] before any sync message is accepted; all later
//! frames are sealed by the session cipher.

use crate::crypto::{CryptoError, EphemeralExchange, KeyPair, SessionCipher};
use crate::framing::{Frame, FrameCodec, FrameError, FrameType};
use crate::messages::{Hello, HelloAck, HelloConfirm, WireMessage};
use crate::peer::PeerId;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

/// Protocol version offered in the hello
pub const PROTOCOL_VERSION: u16 = 1;

const ACCEPT_CONTEXT: &[u8] = b"spacesync-accept";
const CONFIRM_CONTEXT: &[u8] = b"spacesync-confirm";
const TRANSCRIPT_CONTEXT: &[u8] = b"spacesync-transcript";

/// Handshake failure carrying the remote address and the underlying cause.
///
/// A peer failing the handshake is unreachable for the round; the error
/// never surfaces as a space-level condition.
#[derive(Debug, Error)]
#[error("handshake with {remote_addr} failed: {source}")]
pub struct HandshakeError {
    pub remote_addr: String,
    #[source]
    pub source: HandshakeFailure,
}

/// Underlying handshake failure causes
#[derive(Debug, Error)]
pub enum HandshakeFailure {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("unsupported protocol version {0}")]
    Version(u16),
    #[error("unexpected {0:?} frame during handshake")]
    UnexpectedFrame(FrameType),
    #[error("connection closed during handshake")]
    Closed,
    #[error("message decode failed: {0}")]
    Decode(#[from] postcard::Error),
}

/// Channel errors after the handshake completed
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("message decode failed: {0}")]
    Decode(#[from] postcard::Error),
    #[error("connection closed")]
    Closed,
}

/// An established, mutually authenticated connection.
pub struct SecureChannel<S> {
    peer_id: PeerId,
    framed: Framed<S, FrameCodec>,
    cipher: SessionCipher,
}

impl<S> std::fmt::Debug for SecureChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

fn accept_sign_bytes(init_eph: &[u8; 32], resp_eph: &[u8; 32], init_identity: &[u8; 32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(ACCEPT_CONTEXT.len() + 96);
    bytes.extend_from_slice(ACCEPT_CONTEXT);
    bytes.extend_from_slice(init_eph);
    bytes.extend_from_slice(resp_eph);
    bytes.extend_from_slice(init_identity);
    bytes
}

fn confirm_sign_bytes(
    init_eph: &[u8; 32],
    resp_eph: &[u8; 32],
    resp_identity: &[u8; 32],
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(CONFIRM_CONTEXT.len() + 96);
    bytes.extend_from_slice(CONFIRM_CONTEXT);
    bytes.extend_from_slice(init_eph);
    bytes.extend_from_slice(resp_eph);
    bytes.extend_from_slice(resp_identity);
    bytes
}

fn transcript(
    init_eph: &[u8; 32],
    resp_eph: &[u8; 32],
    init_identity: &[u8; 32],
    resp_identity: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(TRANSCRIPT_CONTEXT);
    hasher.update(init_eph);
    hasher.update(resp_eph);
    hasher.update(init_identity);
    hasher.update(resp_identity);
    *hasher.finalize().as_bytes()
}

fn sig64(bytes: &[u8]) -> Result<[u8; 64], HandshakeFailure> {
    bytes
        .try_into()
        .map_err(|_| HandshakeFailure::Crypto(CryptoError::InvalidKeyLength))
}

async fn expect<S, M>(framed: &mut Framed<S, FrameCodec>) -> Result<M, HandshakeFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: WireMessage,
{
    let frame = framed
        .next()
        .await
        .ok_or(HandshakeFailure::Closed)?
        .map_err(HandshakeFailure::Frame)?;
    if frame.frame_type != M::FRAME_TYPE {
        return Err(HandshakeFailure::UnexpectedFrame(frame.frame_type));
    }
    M::from_frame(&frame).map_err(HandshakeFailure::Decode)
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureChannel<S> {
    /// Initiate the handshake on an outbound stream.
    pub async fn connect(
        stream: S,
        keypair: &KeyPair,
        remote_addr: impl Into<String>,
    ) -> Result<Self, HandshakeError> {
        let remote_addr = remote_addr.into();
        let channel = Self::connect_inner(stream, keypair).await.map_err(|source| {
            HandshakeError {
                remote_addr: remote_addr.clone(),
                source,
            }
        })?;
        debug!("secure channel to {} established with {}", remote_addr, channel.peer_id);
        Ok(channel)
    }

    async fn connect_inner(stream: S, keypair: &KeyPair) -> Result<Self, HandshakeFailure> {
        let mut framed = Framed::new(stream, FrameCodec::new());
        let eph = EphemeralExchange::new();
        let our_identity = keypair.public_key();
        let our_eph = eph.public_key();

        let hello = Hello {
            version: PROTOCOL_VERSION,
            identity: our_identity,
            eph: our_eph,
        };
        framed.send(hello.to_frame()?).await?;

        let ack: HelloAck = expect(&mut framed).await?;
        KeyPair::verify(
            &ack.identity,
            &accept_sign_bytes(&our_eph, &ack.eph, &our_identity),
            &sig64(&ack.signature)?,
        )?;

        let confirm = HelloConfirm {
            signature: keypair
                .sign(&confirm_sign_bytes(&our_eph, &ack.eph, &ack.identity))
                .to_vec(),
        };
        framed.send(confirm.to_frame()?).await?;

        let transcript = transcript(&our_eph, &ack.eph, &our_identity, &ack.identity);
        let cipher = SessionCipher::derive(&eph.exchange(&ack.eph), &transcript, true)?;

        Ok(Self {
            peer_id: PeerId::from_public_key(&ack.identity),
            framed,
            cipher,
        })
    }

    /// Run the responder side of the handshake on an inbound stream.
    pub async fn accept(
        stream: S,
        keypair: &KeyPair,
        remote_addr: impl Into<String>,
    ) -> Result<Self, HandshakeError> {
        let remote_addr = remote_addr.into();
        let channel = Self::accept_inner(stream, keypair).await.map_err(|source| {
            HandshakeError {
                remote_addr: remote_addr.clone(),
                source,
            }
        })?;
        debug!("secure channel from {} established with {}", remote_addr, channel.peer_id);
        Ok(channel)
    }

    async fn accept_inner(stream: S, keypair: &KeyPair) -> Result<Self, HandshakeFailure> {
        let mut framed = Framed::new(stream, FrameCodec::new());

        let hello: Hello = expect(&mut framed).await?;
        if hello.version != PROTOCOL_VERSION {
            return Err(HandshakeFailure::Version(hello.version));
        }

        let eph = EphemeralExchange::new();
        let our_identity = keypair.public_key();
        let our_eph = eph.public_key();

        let ack = HelloAck {
            identity: our_identity,
            eph: our_eph,
            signature: keypair
                .sign(&accept_sign_bytes(&hello.eph, &our_eph, &hello.identity))
                .to_vec(),
        };
        framed.send(ack.to_frame()?).await?;

        let confirm: HelloConfirm = expect(&mut framed).await?;
        KeyPair::verify(
            &hello.identity,
            &confirm_sign_bytes(&hello.eph, &our_eph, &our_identity),
            &sig64(&confirm.signature)?,
        )?;

        let transcript = transcript(&hello.eph, &our_eph, &hello.identity, &our_identity);
        let cipher = SessionCipher::derive(&eph.exchange(&hello.eph), &transcript, false)?;

        Ok(Self {
            peer_id: PeerId::from_public_key(&hello.identity),
            framed,
            cipher,
        })
    }

    /// The authenticated remote identity.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Send a message, sealing its payload.
    pub async fn send<M: WireMessage>(&mut self, message: &M) -> Result<(), ChannelError> {
        let frame = message.to_frame()?;
        let sealed = self
            .cipher
            .seal(&frame.payload, &[frame.frame_type as u8])?;
        self.framed
            .send(Frame::new(frame.frame_type, sealed))
            .await?;
        Ok(())
    }

    /// Receive the next frame, opening its payload.
    pub async fn recv(&mut self) -> Result<Frame, ChannelError> {
        let frame = self.framed.next().await.ok_or(ChannelError::Closed)??;
        let payload = self
            .cipher
            .open(&frame.payload, &[frame.frame_type as u8])?;
        Ok(Frame::new(frame.frame_type, payload))
    }

    /// Receive and decode a message of a known type.
    pub async fn recv_expect<M: WireMessage>(&mut self) -> Result<M, ChannelError> {
        let frame = self.recv().await?;
        if frame.frame_type != M::FRAME_TYPE {
            return Err(ChannelError::Decode(postcard::Error::DeserializeBadEncoding));
        }
        Ok(M::from_frame(&frame)?)
    }

    /// Send a request and wait for its typed response.
    ///
    /// Connections run one request at a time per caller; the orchestrator
    /// never writes local state before the response is fully known, so
    /// dropping this future mid-flight leaves no partial update behind.
    pub async fn request<Req: WireMessage, Resp: WireMessage>(
        &mut self,
        request: &Req,
    ) -> Result<Resp, ChannelError> {
        self.send(request).await?;
        self.recv_expect().await
    }
}
