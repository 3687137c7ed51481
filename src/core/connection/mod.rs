//! Negotiated peer-to-peer transport.
//!
//! The orchestrator never talks to a concrete transport. It goes through the
//! [`TransportConnector`] / [`NegotiatedTransport`] / [`DataChannel`] traits:
//!
//! - [`webrtc`] drives a real `RTCPeerConnection` (offer/answer, trickle ICE,
//!   ordered data channels).
//! - [`memory`] pairs endpoints inside one process and is used by tests.
//!
//! Every asynchronous happening on a transport (local candidate, state
//! change, channel open, inbound chunk, channel close) is posted as a
//! [`TransportEvent`] on the channel handed to [`TransportConnector::connect`].

pub mod manager;
pub mod memory;
pub mod webrtc;

use crate::core::config::IceServer;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

// ── Negotiation payloads ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionType {
    Offer,
    Answer,
}

/// A local or remote session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: DescriptionType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

// ── Connection state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `Failed` and `Closed` end the connection; the registry entry goes away.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Something that happened on a transport, tagged with the remote peer.
#[derive(Clone)]
pub enum TransportEvent {
    LocalCandidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    StateChanged {
        peer_id: String,
        state: ConnectionState,
    },
    /// A data channel opened. Its label is the transaction id it carries.
    ChannelOpen {
        peer_id: String,
        label: String,
        channel: Arc<dyn DataChannel>,
    },
    Message {
        peer_id: String,
        label: String,
        data: Bytes,
    },
    ChannelClosed {
        peer_id: String,
        label: String,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate { peer_id, .. } => write!(f, "LocalCandidate({peer_id})"),
            Self::StateChanged { peer_id, state } => write!(f, "StateChanged({peer_id}, {state})"),
            Self::ChannelOpen { peer_id, label, .. } => write!(f, "ChannelOpen({peer_id}, {label})"),
            Self::Message { peer_id, label, data } => {
                write!(f, "Message({peer_id}, {label}, {} bytes)", data.len())
            }
            Self::ChannelClosed { peer_id, label } => write!(f, "ChannelClosed({peer_id}, {label})"),
        }
    }
}

// ── Capability traits ─────────────────────────────────────────────────────────

/// Everything a connector needs to build one transport.
#[derive(Clone)]
pub struct ConnectContext {
    pub local_peer_id: String,
    pub remote_peer_id: String,
    pub ice_servers: Vec<IceServer>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

/// Factory for negotiated transports.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, ctx: ConnectContext) -> Result<Arc<dyn NegotiatedTransport>>;
}

/// One negotiated connection to a remote peer.
#[async_trait]
pub trait NegotiatedTransport: Send + Sync {
    /// Request an ordered, reliable data channel. Its opening is reported
    /// as [`TransportEvent::ChannelOpen`].
    async fn open_data_channel(&self, label: &str) -> Result<()>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer and install it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self) -> Result<()>;
}

/// The byte pipe a transfer runs over.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Bytes queued locally but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    async fn send(&self, data: Bytes) -> Result<()>;

    /// Close this channel on both ends. Queued bytes are still delivered.
    /// Closing an already closed channel is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Forward `event` to the owner of a transport; no-op once the receiver is gone.
pub(crate) fn emit(events: &mpsc::UnboundedSender<TransportEvent>, event: TransportEvent) {
    let _ = events.send(event);
}
