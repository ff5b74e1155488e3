//! Remote diff over the wire
//!
//! Client side of the reconciliation protocol: frames range requests onto
//! a secure channel and classifies the peer's answer. A peer that never
//! heard of the space maps to [`DiffError::SpaceMissing`], a tombstoned
//! space to [`DiffError::SpaceDeleted`], and any other reported condition
//! to [`DiffError::Unexpected`].

use crate::diff::{DiffError, RemoteDiff};
use async_trait::async_trait;
use spacesync_core::types::*;
use spacesync_net::handshake::SecureChannel;
use spacesync_net::messages::{DiffRequest, DiffResponse, DiffTypeRequest, DiffTypeResponse};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

/// [`RemoteDiff`] implementation speaking the framed protocol.
///
/// One request runs at a time per channel; the lock serializes callers.
pub struct WireRemoteDiff<S> {
    space: SpaceId,
    channel: Mutex<SecureChannel<S>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> WireRemoteDiff<S> {
    pub fn new(space: SpaceId, channel: SecureChannel<S>) -> Self {
        Self {
            space,
            channel: Mutex::new(channel),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> RemoteDiff for WireRemoteDiff<S> {
    async fn diff_type(&self) -> Result<DiffType, DiffError> {
        let mut channel = self.channel.lock().await;
        let resp: DiffTypeResponse = channel.request(&DiffTypeRequest).await?;
        Ok(resp.diff_type)
    }

    async fn ranges(&self, ranges: &[DiffRange]) -> Result<Vec<RangeResult>, DiffError> {
        let request = DiffRequest {
            space: self.space,
            ranges: ranges.to_vec(),
        };
        let mut channel = self.channel.lock().await;
        let resp: DiffResponse = channel.request(&request).await?;
        match resp {
            DiffResponse::Ranges(results) => Ok(results),
            DiffResponse::SpaceMissing => Err(DiffError::SpaceMissing),
            DiffResponse::SpaceDeleted => Err(DiffError::SpaceDeleted),
            DiffResponse::Error(reason) => Err(DiffError::Unexpected(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Diff;
    use spacesync_net::crypto::KeyPair;
    use spacesync_net::messages::WireMessage;
    use spacesync_net::FrameType;

    async fn channel_pair() -> (
        SecureChannel<tokio::io::DuplexStream>,
        SecureChannel<tokio::io::DuplexStream>,
    ) {
        let client_kp = KeyPair::from_seed(&[1; 32]);
        let server_kp = KeyPair::from_seed(&[2; 32]);
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client, server) = tokio::join!(
            SecureChannel::connect(client_io, &client_kp, "test:client"),
            SecureChannel::accept(server_io, &server_kp, "test:server"),
        );
        (client.unwrap(), server.unwrap())
    }

    /// Serve diff requests from a real engine until the channel closes.
    async fn serve_engine(mut server: SecureChannel<tokio::io::DuplexStream>, engine: Diff) {
        while let Ok(frame) = server.recv().await {
            match frame.frame_type {
                FrameType::DiffTypeRequest => {
                    server
                        .send(&DiffTypeResponse {
                            diff_type: engine.diff_type(),
                        })
                        .await
                        .unwrap();
                }
                FrameType::DiffRequest => {
                    let req = DiffRequest::from_frame(&frame).unwrap();
                    server
                        .send(&DiffResponse::Ranges(engine.ranges(&req.ranges)))
                        .await
                        .unwrap();
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_wire_diff_against_served_engine() {
        let (client, server) = channel_pair().await;

        let remote_engine = Diff::new();
        let shared = Element {
            id: ObjectId([1; 32]),
            head: "same".into(),
        };
        let fresh = Element {
            id: ObjectId([2; 32]),
            head: "new".into(),
        };
        remote_engine.set(shared.clone());
        remote_engine.set(fresh.clone());

        let serve = tokio::spawn(serve_engine(server, remote_engine));

        let local = Diff::new();
        local.set(shared);
        let remote = WireRemoteDiff::new(SpaceId([7; 32]), client);

        assert_eq!(remote.diff_type().await.unwrap(), DiffType::RangeHash);
        let (new, changed, removed) = local.diff(&remote).await.unwrap();
        assert_eq!(new, vec![fresh.id]);
        assert!(changed.is_empty());
        assert!(removed.is_empty());

        drop(remote);
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_wire_diff_classifies_remote_conditions() {
        for (response, check) in [
            (
                DiffResponse::SpaceMissing,
                (|e| matches!(e, DiffError::SpaceMissing)) as fn(&DiffError) -> bool,
            ),
            (DiffResponse::SpaceDeleted, |e| {
                matches!(e, DiffError::SpaceDeleted)
            }),
            (DiffResponse::Error("drpc boom".into()), |e| {
                matches!(e, DiffError::Unexpected(reason) if reason == "drpc boom")
            }),
        ] {
            let (client, mut server) = channel_pair().await;
            let serve = tokio::spawn(async move {
                let frame = server.recv().await.unwrap();
                assert_eq!(frame.frame_type, FrameType::DiffRequest);
                server.send(&response).await.unwrap();
            });

            let remote = WireRemoteDiff::new(SpaceId([7; 32]), client);
            let err = remote
                .ranges(&[DiffRange {
                    from: ObjectId::MIN,
                    to: ObjectId::MAX,
                    limit: 16,
                }])
                .await
                .unwrap_err();
            assert!(check(&err), "got {:?}", err);
            serve.await.unwrap();
        }
    }
}
