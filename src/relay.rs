//! Direct and broadcast messaging between signed-in sessions.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::RoutingError;
use crate::protocol::{Envelope, Frame, Tag};
use crate::registry::SessionRegistry;

/// Deliver `envelope` to its receiver with the receiver field rewritten to
/// `sender`.
pub async fn direct(
    registry: &SessionRegistry,
    sender: &str,
    envelope: Envelope,
) -> Result<(), RoutingError> {
    let receiver = registry
        .lookup(&envelope.receiver)
        .await
        .ok_or_else(|| RoutingError::ReceiverOffline(envelope.receiver.clone()))?;

    let delivered = Envelope {
        receiver: sender.to_string(),
        message: envelope.message,
    };
    // Serializing two strings cannot fail.
    let payload = serde_json::to_vec(&delivered).unwrap_or_default();

    if let Err(e) = receiver.outbound.send(Frame::new(Tag::Message, payload)).await {
        warn!(receiver = %receiver.login, error = %e, "Failed to deliver message");
    }
    Ok(())
}

/// Forward a broadcast payload untouched, tagged `M`, to every session but
/// the sender's. Returns how many sessions it was written to.
pub async fn broadcast(registry: &SessionRegistry, sender: &str, payload: Bytes) -> usize {
    let mut delivered = 0;
    for receiver in registry.others(sender).await {
        match receiver
            .outbound
            .send(Frame::new(Tag::Message, payload.clone()))
            .await
        {
            Ok(()) => delivered += 1,
            Err(e) => warn!(receiver = %receiver.login, error = %e, "Failed to deliver broadcast"),
        }
    }
    debug!(sender = %sender, delivered, "Broadcast relayed");
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameCodec, FrameSink};
    use crate::registry::{SessionHandle, SessionId};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::sync::mpsc;

    async fn join(registry: &SessionRegistry, login: &str) -> BufReader<DuplexStream> {
        let (client, server) = tokio::io::duplex(1024);
        let (requests, _rx) = mpsc::channel(1);
        registry
            .register(Arc::new(SessionHandle {
                id: SessionId::next(),
                login: login.to_string(),
                peer: SocketAddr::from(([127, 0, 0, 1], 0)),
                outbound: FrameSink::new(server, FrameCodec::default(), Duration::from_secs(1)),
                requests,
            }))
            .await;
        BufReader::new(client)
    }

    async fn read_line(reader: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn direct_message_rewrites_receiver_to_sender() {
        let registry = SessionRegistry::new();
        let mut bob = join(&registry, "bob").await;

        let envelope = Envelope {
            receiver: "bob".into(),
            message: "hi".into(),
        };
        direct(&registry, "alice", envelope).await.unwrap();

        assert_eq!(read_line(&mut bob).await, "M{\"rec\":\"alice\",\"msg\":\"hi\"}\n");
    }

    #[tokio::test]
    async fn direct_message_to_offline_login_fails() {
        let registry = SessionRegistry::new();
        let envelope = Envelope {
            receiver: "nobody".into(),
            message: "hi".into(),
        };

        let err = direct(&registry, "alice", envelope).await.unwrap_err();
        assert!(matches!(err, RoutingError::ReceiverOffline(login) if login == "nobody"));
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let registry = SessionRegistry::new();
        let _alice = join(&registry, "alice").await;
        let mut bob = join(&registry, "bob").await;
        let mut carol = join(&registry, "carol").await;

        let payload = Bytes::from_static(br#"{"rec":"alice","msg":"hello"}"#);
        assert_eq!(broadcast(&registry, "alice", payload).await, 2);

        let expected = "M{\"rec\":\"alice\",\"msg\":\"hello\"}\n";
        assert_eq!(read_line(&mut bob).await, expected);
        assert_eq!(read_line(&mut carol).await, expected);
    }
}
