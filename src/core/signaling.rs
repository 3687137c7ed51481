//! Signaling adapter boundary.
//!
//! The relay server is an external collaborator. This module fixes the wire
//! envelope `{ "kind": <integer>, "data": <any> }`, the typed messages the
//! core exchanges through it, and the [`SignalingAdapter`] contract.
//!
//! [`LocalRelay`] is an in-process hub with the same delivery guarantees as
//! the real relay (ordered and reliable per peer). Every message crosses it
//! in its JSON encoding.

use crate::core::connection::{DescriptionType, IceCandidate, SessionDescription};
use crate::core::transaction::FileEntry;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

// ── Wire envelope ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    TransferProposed,
    TransportSignal,
    TransferCancelled,
}

impl SignalKind {
    pub fn code(self) -> u8 {
        match self {
            Self::TransferProposed => 1,
            Self::TransportSignal => 2,
            Self::TransferCancelled => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::TransferProposed),
            2 => Some(Self::TransportSignal),
            3 => Some(Self::TransferCancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: u8,
    pub data: Value,
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProposed {
    pub transaction_id: Uuid,
    pub source_peer_id: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSignal {
    pub transaction_id: Uuid,
    pub source_peer_id: String,
    pub target_peer_id: String,
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    Description {
        description_type: DescriptionType,
        description: String,
    },
    Candidate {
        candidate: IceCandidate,
    },
}

impl From<SessionDescription> for SignalPayload {
    fn from(desc: SessionDescription) -> Self {
        Self::Description {
            description_type: desc.kind,
            description: desc.sdp,
        }
    }
}

impl From<IceCandidate> for SignalPayload {
    fn from(candidate: IceCandidate) -> Self {
        Self::Candidate { candidate }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferCancelled {
    pub transaction_id: Uuid,
    pub source_peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A typed relay message.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    Proposed(TransferProposed),
    Transport(TransportSignal),
    Cancelled(TransferCancelled),
}

impl SignalMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Proposed(_) => SignalKind::TransferProposed,
            Self::Transport(_) => SignalKind::TransportSignal,
            Self::Cancelled(_) => SignalKind::TransferCancelled,
        }
    }

    pub fn transaction_id(&self) -> Uuid {
        match self {
            Self::Proposed(m) => m.transaction_id,
            Self::Transport(m) => m.transaction_id,
            Self::Cancelled(m) => m.transaction_id,
        }
    }

    pub fn source_peer_id(&self) -> &str {
        match self {
            Self::Proposed(m) => &m.source_peer_id,
            Self::Transport(m) => &m.source_peer_id,
            Self::Cancelled(m) => &m.source_peer_id,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope> {
        let data = match self {
            Self::Proposed(m) => serde_json::to_value(m)?,
            Self::Transport(m) => serde_json::to_value(m)?,
            Self::Cancelled(m) => serde_json::to_value(m)?,
        };
        Ok(Envelope {
            kind: self.kind().code(),
            data,
        })
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        let kind = SignalKind::from_code(envelope.kind)
            .ok_or_else(|| anyhow!("unknown signal kind {}", envelope.kind))?;
        Ok(match kind {
            SignalKind::TransferProposed => Self::Proposed(serde_json::from_value(envelope.data)?),
            SignalKind::TransportSignal => Self::Transport(serde_json::from_value(envelope.data)?),
            SignalKind::TransferCancelled => Self::Cancelled(serde_json::from_value(envelope.data)?),
        })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_envelope()?)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Self::from_envelope(serde_json::from_str(raw)?)
    }
}

// ── Adapter contract ──────────────────────────────────────────────────────────

/// Typed access to the external relay.
///
/// Delivery is ordered and reliable per target peer, with no ordering
/// across peers and no acknowledgment.
pub trait SignalingAdapter: Send + Sync {
    /// Identity the relay knows this endpoint by.
    fn local_peer_id(&self) -> &str;

    /// Fire-and-forget delivery to `target_peer_id`.
    fn send(&self, target_peer_id: &str, transaction_id: Uuid, message: SignalMessage) -> Result<()>;

    /// Register `handler` for every inbound message of `kind`. All
    /// registered handlers receive every message, in arrival order.
    fn subscribe(&self, kind: SignalKind, handler: mpsc::UnboundedSender<SignalMessage>);
}

// ── In-process relay ──────────────────────────────────────────────────────────

type Handlers = HashMap<SignalKind, Vec<mpsc::UnboundedSender<SignalMessage>>>;

/// In-process relay hub connecting any number of [`RelayClient`]s.
#[derive(Clone, Default)]
pub struct LocalRelay {
    peers: Arc<Mutex<HashMap<String, Handlers>>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer_id` on the hub and return its adapter.
    pub fn client(&self, peer_id: impl Into<String>) -> Arc<RelayClient> {
        let peer_id = peer_id.into();
        if let Ok(mut peers) = self.peers.lock() {
            peers.entry(peer_id.clone()).or_default();
        }
        Arc::new(RelayClient {
            peer_id,
            relay: self.clone(),
        })
    }

    /// Deliver a raw envelope to `target`. Undecodable envelopes and unknown
    /// targets are logged and dropped.
    pub fn deliver_raw(&self, target: &str, raw: &str) {
        let message = match SignalMessage::decode(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(event = "signal_decode_failure", target = %target, error = %e, "Dropping malformed relay envelope");
                return;
            }
        };

        let Ok(mut peers) = self.peers.lock() else {
            return;
        };
        let Some(handlers) = peers.get_mut(target) else {
            warn!(event = "signal_unknown_target", target = %target, "Dropping relay message for unknown peer");
            return;
        };
        if let Some(list) = handlers.get_mut(&message.kind()) {
            list.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }
}

/// One peer's view of a [`LocalRelay`].
pub struct RelayClient {
    peer_id: String,
    relay: LocalRelay,
}

impl SignalingAdapter for RelayClient {
    fn local_peer_id(&self) -> &str {
        &self.peer_id
    }

    fn send(&self, target_peer_id: &str, transaction_id: Uuid, message: SignalMessage) -> Result<()> {
        let raw = message.encode()?;
        debug!(
            event = "signal_send",
            from = %self.peer_id,
            to = %target_peer_id,
            transaction_id = %transaction_id,
            kind = message.kind().code(),
            "Relaying signal"
        );
        self.relay.deliver_raw(target_peer_id, &raw);
        Ok(())
    }

    fn subscribe(&self, kind: SignalKind, handler: mpsc::UnboundedSender<SignalMessage>) {
        if let Ok(mut peers) = self.relay.peers.lock() {
            peers
                .entry(self.peer_id.clone())
                .or_default()
                .entry(kind)
                .or_default()
                .push(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate_signal() -> SignalMessage {
        SignalMessage::Transport(TransportSignal {
            transaction_id: Uuid::nil(),
            source_peer_id: "alice".into(),
            target_peer_id: "bob".into(),
            payload: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }
            .into(),
        })
    }

    #[test]
    fn test_envelope_wire_shape() {
        let msg = SignalMessage::Proposed(TransferProposed {
            transaction_id: Uuid::nil(),
            source_peer_id: "alice".into(),
            files: vec![FileEntry::new("a.txt", 3, "text/plain")],
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": 1,
                "data": {
                    "transaction_id": "00000000-0000-0000-0000-000000000000",
                    "source_peer_id": "alice",
                    "files": [{"name": "a.txt", "size": 3, "type": "text/plain"}]
                }
            })
        );
    }

    #[test]
    fn test_transport_payload_variants_decode() {
        let offer = json!({
            "kind": 2,
            "data": {
                "transaction_id": Uuid::nil(),
                "source_peer_id": "alice",
                "target_peer_id": "bob",
                "payload": {"description_type": "offer", "description": "v=0"}
            }
        });
        let msg = SignalMessage::decode(&offer.to_string()).unwrap();
        let SignalMessage::Transport(signal) = msg else {
            panic!("expected transport signal");
        };
        assert_eq!(
            signal.payload,
            SignalPayload::Description {
                description_type: DescriptionType::Offer,
                description: "v=0".into()
            }
        );

        let decoded = SignalMessage::decode(&candidate_signal().encode().unwrap()).unwrap();
        assert_eq!(decoded, candidate_signal());
    }

    #[test]
    fn test_unknown_kind_and_bad_data_are_rejected() {
        assert!(SignalMessage::decode(r#"{"kind": 9, "data": {}}"#).is_err());
        assert!(SignalMessage::decode(r#"{"kind": 1, "data": {"files": 3}}"#).is_err());
        assert!(SignalMessage::decode("not json").is_err());
    }

    #[tokio::test]
    async fn test_relay_routes_in_order_to_every_handler() {
        let relay = LocalRelay::new();
        let alice = relay.client("alice");
        let bob = relay.client("bob");

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        bob.subscribe(SignalKind::TransportSignal, tx1);
        bob.subscribe(SignalKind::TransportSignal, tx2);

        let first = candidate_signal();
        let second = SignalMessage::Transport(TransportSignal {
            payload: SessionDescription::answer("v=0").into(),
            ..match candidate_signal() {
                SignalMessage::Transport(s) => s,
                _ => unreachable!(),
            }
        });
        alice.send("bob", Uuid::nil(), first.clone()).unwrap();
        alice.send("bob", Uuid::nil(), second.clone()).unwrap();

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap(), first);
            assert_eq!(rx.recv().await.unwrap(), second);
        }
    }

    #[tokio::test]
    async fn test_relay_drops_malformed_and_unsubscribed() {
        let relay = LocalRelay::new();
        let alice = relay.client("alice");
        let bob = relay.client("bob");
        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.subscribe(SignalKind::TransferCancelled, tx);

        relay.deliver_raw("bob", r#"{"kind": 3}"#);
        // No handler for this kind on bob.
        alice.send("bob", Uuid::nil(), candidate_signal()).unwrap();
        // Unknown target.
        alice.send("carol", Uuid::nil(), candidate_signal()).unwrap();

        let cancel = SignalMessage::Cancelled(TransferCancelled {
            transaction_id: Uuid::nil(),
            source_peer_id: "alice".into(),
            reason: None,
        });
        alice.send("bob", Uuid::nil(), cancel.clone()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), cancel);
        assert!(rx.try_recv().is_err());
    }
}
