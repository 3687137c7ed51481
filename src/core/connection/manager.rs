//! Peer connection registry.
//!
//! Exactly one negotiated transport per remote peer id. The manager drives
//! the offer / answer / candidate exchange through the signaling adapter and
//! keeps the candidate bookkeeping: remote candidates that arrive before a
//! remote description are held back and applied once it is set.

use super::{
    ConnectContext, ConnectionState, DescriptionType, IceCandidate, NegotiatedTransport,
    SessionDescription, TransportConnector, TransportEvent,
};
use crate::core::config::IceServer;
use crate::core::error::{TransferError, TransferResult};
use crate::core::signaling::{SignalMessage, SignalPayload, SignalingAdapter, TransportSignal};
use crate::core::throughput::ThroughputMonitor;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Candidate exchange counters for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateStats {
    pub local: usize,
    pub remote: usize,
    pub pending: usize,
}

pub struct PeerConnection {
    pub peer_id: String,
    pub transport: Arc<dyn NegotiatedTransport>,
    pub state: ConnectionState,
    /// Transaction whose negotiation created the connection. Trickled local
    /// candidates are tagged with it.
    pub negotiation_txn: Uuid,
    remote_description_set: bool,
    pending_remote: Vec<IceCandidate>,
    stats: CandidateStats,
}

impl PeerConnection {
    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn stats(&self) -> CandidateStats {
        CandidateStats {
            pending: self.pending_remote.len(),
            ..self.stats
        }
    }
}

pub struct PeerConnectionManager {
    connector: Arc<dyn TransportConnector>,
    signaling: Arc<dyn SignalingAdapter>,
    throughput: ThroughputMonitor,
    ice_servers: Vec<IceServer>,
    events: mpsc::UnboundedSender<TransportEvent>,
    peers: HashMap<String, PeerConnection>,
}

impl PeerConnectionManager {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        signaling: Arc<dyn SignalingAdapter>,
        throughput: ThroughputMonitor,
        ice_servers: Vec<IceServer>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            connector,
            signaling,
            throughput,
            ice_servers,
            events,
            peers: HashMap::new(),
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerConnection> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    // ── Connection lifecycle ─────────────────────────────────────────────

    /// Return the connection to `remote_id`, creating it if needed.
    ///
    /// The flag is `true` when a new transport was created. An existing
    /// connection is returned as is; it is never renegotiated.
    pub async fn create_connection(
        &mut self,
        remote_id: &str,
        transaction_id: Uuid,
    ) -> TransferResult<(Arc<dyn NegotiatedTransport>, bool)> {
        if let Some(existing) = self.peers.get(remote_id) {
            debug!(event = "connection_reused", peer = %remote_id, transaction_id = %transaction_id, "Reusing peer connection");
            return Ok((existing.transport.clone(), false));
        }

        let transport = self
            .connector
            .connect(ConnectContext {
                local_peer_id: self.signaling.local_peer_id().to_string(),
                remote_peer_id: remote_id.to_string(),
                ice_servers: self.ice_servers.clone(),
                events: self.events.clone(),
            })
            .await
            .map_err(|e| TransferError::negotiation(remote_id, format!("{e:#}")))?;

        info!(event = "connection_created", peer = %remote_id, transaction_id = %transaction_id, "Peer connection created");
        self.peers.insert(
            remote_id.to_string(),
            PeerConnection {
                peer_id: remote_id.to_string(),
                transport: transport.clone(),
                state: ConnectionState::New,
                negotiation_txn: transaction_id,
                remote_description_set: false,
                pending_remote: Vec::new(),
                stats: CandidateStats::default(),
            },
        );
        Ok((transport, true))
    }

    /// Create an offer on the connection to `remote_id` and send it.
    pub async fn send_offer(&mut self, remote_id: &str, transaction_id: Uuid) -> TransferResult<()> {
        let transport = self.transport(remote_id)?;
        let offer = transport
            .create_offer()
            .await
            .map_err(|e| TransferError::negotiation(remote_id, format!("{e:#}")))?;
        self.send_signal(remote_id, transaction_id, offer.into())
    }

    /// Apply an inbound offer, answer or candidate from `from_id`.
    ///
    /// Returns the description type when a description was applied.
    pub async fn handle_inbound_signal(
        &mut self,
        from_id: &str,
        transaction_id: Uuid,
        payload: SignalPayload,
    ) -> TransferResult<Option<DescriptionType>> {
        match payload {
            SignalPayload::Description {
                description_type,
                description,
            } => {
                let desc = SessionDescription {
                    kind: description_type,
                    sdp: description,
                };
                self.apply_description(from_id, transaction_id, desc).await?;
                Ok(Some(description_type))
            }
            SignalPayload::Candidate { candidate } => {
                self.apply_candidate(from_id, candidate).await?;
                Ok(None)
            }
        }
    }

    async fn apply_description(
        &mut self,
        from_id: &str,
        transaction_id: Uuid,
        desc: SessionDescription,
    ) -> TransferResult<()> {
        let kind = desc.kind;
        let known = self.peers.get(from_id).map(|c| c.remote_description_set);
        match (kind, known) {
            (DescriptionType::Offer, None) => {
                self.create_connection(from_id, transaction_id).await?;
            }
            (DescriptionType::Offer, Some(true)) => {
                return Err(TransferError::signaling(
                    from_id,
                    "offer for an already negotiated connection",
                ));
            }
            (DescriptionType::Answer, None) => {
                return Err(TransferError::signaling(from_id, "answer for unknown peer"));
            }
            _ => {}
        }

        let transport = self.transport(from_id)?;
        transport
            .set_remote_description(desc)
            .await
            .map_err(|e| TransferError::negotiation(from_id, format!("{e:#}")))?;

        let pending = match self.peers.get_mut(from_id) {
            Some(conn) => {
                conn.remote_description_set = true;
                std::mem::take(&mut conn.pending_remote)
            }
            None => Vec::new(),
        };
        debug!(event = "remote_description_set", peer = %from_id, kind = ?kind, flushed = pending.len(), "Remote description applied");
        for candidate in pending {
            self.add_candidate(from_id, &transport, candidate).await?;
        }

        if kind == DescriptionType::Offer {
            let answer = transport
                .create_answer()
                .await
                .map_err(|e| TransferError::negotiation(from_id, format!("{e:#}")))?;
            self.send_signal(from_id, transaction_id, answer.into())?;
        }
        Ok(())
    }

    async fn apply_candidate(&mut self, from_id: &str, candidate: IceCandidate) -> TransferResult<()> {
        let Some(conn) = self.peers.get_mut(from_id) else {
            return Err(TransferError::signaling(from_id, "candidate for unknown peer"));
        };
        if !conn.remote_description_set {
            conn.pending_remote.push(candidate);
            return Ok(());
        }
        let transport = conn.transport.clone();
        self.add_candidate(from_id, &transport, candidate).await
    }

    async fn add_candidate(
        &mut self,
        from_id: &str,
        transport: &Arc<dyn NegotiatedTransport>,
        candidate: IceCandidate,
    ) -> TransferResult<()> {
        transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| TransferError::negotiation(from_id, format!("{e:#}")))?;
        if let Some(conn) = self.peers.get_mut(from_id) {
            conn.stats.remote += 1;
        }
        Ok(())
    }

    /// Forward a locally gathered candidate to the remote peer.
    pub fn on_local_candidate(&mut self, peer_id: &str, candidate: IceCandidate) -> TransferResult<()> {
        let Some(conn) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };
        conn.stats.local += 1;
        let txn = conn.negotiation_txn;
        self.send_signal(peer_id, txn, candidate.into())
    }

    /// Record a state change. Disconnected or failed connections stop the
    /// throughput estimate for their transfers; terminal ones leave the registry.
    pub fn on_state_change(&mut self, peer_id: &str, state: ConnectionState) {
        let Some(conn) = self.peers.get_mut(peer_id) else {
            return;
        };
        conn.state = state;

        if matches!(state, ConnectionState::Disconnected | ConnectionState::Failed) {
            self.throughput.stop_peer(peer_id);
        }
        if state.is_terminal() {
            self.peers.remove(peer_id);
            info!(event = "connection_removed", peer = %peer_id, state = %state, "Peer connection removed");
        }
    }

    /// Close every connection.
    pub async fn close_all(&mut self) {
        for (peer_id, conn) in self.peers.drain() {
            if let Err(e) = conn.transport.close().await {
                warn!(event = "connection_close_failure", peer = %peer_id, error = %e, "Failed to close peer connection");
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn transport(&self, peer_id: &str) -> TransferResult<Arc<dyn NegotiatedTransport>> {
        self.peers
            .get(peer_id)
            .map(|c| c.transport.clone())
            .ok_or_else(|| TransferError::signaling(peer_id, "no connection"))
    }

    fn send_signal(&self, target: &str, transaction_id: Uuid, payload: SignalPayload) -> TransferResult<()> {
        let message = SignalMessage::Transport(TransportSignal {
            transaction_id,
            source_peer_id: self.signaling.local_peer_id().to_string(),
            target_peer_id: target.to_string(),
            payload,
        });
        self.signaling
            .send(target, transaction_id, message)
            .map_err(|e| TransferError::signaling(target, format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::MemoryNetwork;
    use crate::core::signaling::{LocalRelay, SignalKind};

    struct Side {
        manager: PeerConnectionManager,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        signal_rx: mpsc::UnboundedReceiver<SignalMessage>,
    }

    fn side(net: &MemoryNetwork, relay: &LocalRelay, id: &str) -> Side {
        let client = relay.client(id);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        client.subscribe(SignalKind::TransportSignal, signal_tx);
        let (tx, transport_rx) = mpsc::unbounded_channel();
        Side {
            manager: PeerConnectionManager::new(
                Arc::new(net.clone()),
                client,
                ThroughputMonitor::new(None),
                Vec::new(),
                tx,
            ),
            transport_rx,
            signal_rx,
        }
    }

    fn payload(msg: SignalMessage) -> SignalPayload {
        match msg {
            SignalMessage::Transport(s) => s.payload,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".into(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn test_one_connection_per_peer() {
        let (net, relay) = (MemoryNetwork::new(), LocalRelay::new());
        let mut a = side(&net, &relay, "alice");

        let (first, created) = a.manager.create_connection("bob", Uuid::new_v4()).await.unwrap();
        assert!(created);
        let (second, created) = a.manager.create_connection("bob", Uuid::new_v4()).await.unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(a.manager.len(), 1);
    }

    #[tokio::test]
    async fn test_non_offer_for_unknown_peer_is_dropped() {
        let (net, relay) = (MemoryNetwork::new(), LocalRelay::new());
        let mut a = side(&net, &relay, "alice");

        let err = a
            .manager
            .handle_inbound_signal("bob", Uuid::new_v4(), candidate().into())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Signaling { .. }));
        let err = a
            .manager
            .handle_inbound_signal("bob", Uuid::new_v4(), SessionDescription::answer("x").into())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Signaling { .. }));
        assert!(a.manager.is_empty());
    }

    #[tokio::test]
    async fn test_offer_answer_exchange_with_buffered_candidates() {
        let (net, relay) = (MemoryNetwork::new(), LocalRelay::new());
        let mut a = side(&net, &relay, "alice");
        let mut b = side(&net, &relay, "bob");
        let txn = Uuid::new_v4();

        let (transport, _) = a.manager.create_connection("bob", txn).await.unwrap();
        transport.open_data_channel(&txn.to_string()).await.unwrap();
        a.manager.send_offer("bob", txn).await.unwrap();

        // Bob sees a candidate before the offer: it is held back.
        let offer = payload(b.signal_rx.recv().await.unwrap());
        b.manager.create_connection("alice", txn).await.unwrap();
        b.manager
            .handle_inbound_signal("alice", txn, candidate().into())
            .await
            .unwrap();
        assert_eq!(b.manager.get("alice").unwrap().stats().pending, 1);

        let applied = b.manager.handle_inbound_signal("alice", txn, offer).await.unwrap();
        assert_eq!(applied, Some(DescriptionType::Offer));
        let stats = b.manager.get("alice").unwrap().stats();
        assert_eq!((stats.pending, stats.remote), (0, 1));

        let answer = payload(a.signal_rx.recv().await.unwrap());
        assert!(matches!(
            answer,
            SignalPayload::Description {
                description_type: DescriptionType::Answer,
                ..
            }
        ));
        a.manager.handle_inbound_signal("bob", txn, answer).await.unwrap();

        let mut opened = false;
        while let Ok(ev) = a.transport_rx.try_recv() {
            match ev {
                TransportEvent::LocalCandidate { peer_id, candidate } => {
                    a.manager.on_local_candidate(&peer_id, candidate).unwrap();
                }
                TransportEvent::StateChanged { peer_id, state } => {
                    a.manager.on_state_change(&peer_id, state);
                }
                TransportEvent::ChannelOpen { label, .. } => {
                    assert_eq!(label, txn.to_string());
                    opened = true;
                }
                _ => {}
            }
        }
        assert!(opened);
        assert_eq!(a.manager.get("bob").unwrap().state, ConnectionState::Connected);
        assert_eq!(a.manager.get("bob").unwrap().stats().local, 1);
        assert!(b.transport_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_second_offer_is_rejected() {
        let (net, relay) = (MemoryNetwork::new(), LocalRelay::new());
        let mut b = side(&net, &relay, "bob");
        let txn = Uuid::new_v4();

        b.manager
            .handle_inbound_signal("alice", txn, SessionDescription::offer("o1").into())
            .await
            .unwrap();
        let err = b
            .manager
            .handle_inbound_signal("alice", Uuid::new_v4(), SessionDescription::offer("o2").into())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Signaling { .. }));
    }

    #[tokio::test]
    async fn test_terminal_state_removes_entry() {
        let (net, relay) = (MemoryNetwork::new(), LocalRelay::new());
        let mut a = side(&net, &relay, "alice");
        a.manager.create_connection("bob", Uuid::new_v4()).await.unwrap();

        a.manager.on_state_change("bob", ConnectionState::Disconnected);
        assert!(a.manager.contains("bob"));
        a.manager.on_state_change("bob", ConnectionState::Failed);
        assert!(!a.manager.contains("bob"));
    }
}
