//! In-process transport.
//!
//! A [`MemoryNetwork`] pairs the endpoint `alice → bob` with `bob → alice`.
//! Once both have a local and a remote description the pair links: both
//! report `Connected` and every requested data channel opens on both sides.
//! Messages are delivered straight into the remote side's event channel, so
//! `buffered_amount` is always zero.

use super::{
    ConnectContext, ConnectionState, DataChannel, IceCandidate, NegotiatedTransport,
    SessionDescription, TransportConnector, TransportEvent, emit,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

type EndpointKey = (String, String);

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<EndpointKey, Arc<MemoryTransport>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EndpointKey, Arc<MemoryTransport>>> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pair(
        endpoints: &HashMap<EndpointKey, Arc<MemoryTransport>>,
        local: &str,
        remote: &str,
    ) -> Option<(Arc<MemoryTransport>, Arc<MemoryTransport>)> {
        let a = endpoints.get(&(local.to_string(), remote.to_string()))?;
        let b = endpoints.get(&(remote.to_string(), local.to_string()))?;
        Some((a.clone(), b.clone()))
    }

    fn try_link(&self, local: &str, remote: &str) {
        let endpoints = self.lock();
        let Some((a, b)) = Self::pair(&endpoints, local, remote) else {
            return;
        };
        if !a.ready() || !b.ready() || a.linked() || b.linked() {
            return;
        }
        debug!(event = "memory_link", local = %local, remote = %remote, "In-process transports linked");

        a.set_state(ConnectionState::Connected);
        b.set_state(ConnectionState::Connected);
        let labels: Vec<String> = a.take_pending().into_iter().chain(b.take_pending()).collect();
        for label in labels {
            open_pair(&a, &b, &label);
        }
    }

    /// Open `label` on an already linked pair, or queue it until linking.
    fn open_or_queue(&self, local: &str, remote: &str, label: &str) {
        let endpoints = self.lock();
        match Self::pair(&endpoints, local, remote) {
            Some((a, b)) if a.linked() && b.linked() => open_pair(&a, &b, label),
            _ => {
                if let Some(a) = endpoints.get(&(local.to_string(), remote.to_string())) {
                    a.state().pending.push(label.to_string());
                }
            }
        }
    }

    /// Force both ends of `a ↔ b` into `state`, as a network fault would.
    pub fn set_link_state(&self, a: &str, b: &str, state: ConnectionState) {
        let endpoints = self.lock();
        for key in [(a.to_string(), b.to_string()), (b.to_string(), a.to_string())] {
            if let Some(end) = endpoints.get(&key) {
                end.set_state(state);
                if state.is_terminal() {
                    end.close_channels();
                }
            }
        }
    }

    fn remove(&self, local: &str, remote: &str) -> Option<Arc<MemoryTransport>> {
        let mut endpoints = self.lock();
        let removed = endpoints.remove(&(local.to_string(), remote.to_string()));
        let peer = endpoints.get(&(remote.to_string(), local.to_string())).cloned();
        drop(endpoints);
        removed.and(peer)
    }
}

fn open_pair(a: &Arc<MemoryTransport>, b: &Arc<MemoryTransport>, label: &str) {
    let open = Arc::new(AtomicBool::new(true));
    let to_b = Arc::new(MemoryChannel {
        label: label.to_string(),
        sender_id: a.local_peer_id.clone(),
        receiver_id: b.local_peer_id.clone(),
        open: open.clone(),
        local_events: a.events.clone(),
        remote_events: b.events.clone(),
    });
    let to_a = Arc::new(MemoryChannel {
        label: label.to_string(),
        sender_id: b.local_peer_id.clone(),
        receiver_id: a.local_peer_id.clone(),
        open,
        local_events: b.events.clone(),
        remote_events: a.events.clone(),
    });
    a.state().channels.push(to_b.clone());
    b.state().channels.push(to_a.clone());

    emit(
        &a.events,
        TransportEvent::ChannelOpen {
            peer_id: a.remote_peer_id.clone(),
            label: label.to_string(),
            channel: to_b,
        },
    );
    emit(
        &b.events,
        TransportEvent::ChannelOpen {
            peer_id: b.remote_peer_id.clone(),
            label: label.to_string(),
            channel: to_a,
        },
    );
}

#[async_trait]
impl TransportConnector for MemoryNetwork {
    async fn connect(&self, ctx: ConnectContext) -> Result<Arc<dyn NegotiatedTransport>> {
        let transport = Arc::new(MemoryTransport {
            local_peer_id: ctx.local_peer_id.clone(),
            remote_peer_id: ctx.remote_peer_id.clone(),
            events: ctx.events,
            network: self.clone(),
            inner: Mutex::new(EndpointState {
                state: ConnectionState::New,
                has_local: false,
                has_remote: false,
                linked: false,
                pending: Vec::new(),
                channels: Vec::new(),
                remote_candidates: 0,
            }),
        });
        self.lock()
            .insert((ctx.local_peer_id, ctx.remote_peer_id), transport.clone());
        Ok(transport)
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

struct EndpointState {
    state: ConnectionState,
    has_local: bool,
    has_remote: bool,
    linked: bool,
    pending: Vec<String>,
    channels: Vec<Arc<MemoryChannel>>,
    remote_candidates: usize,
}

pub struct MemoryTransport {
    local_peer_id: String,
    remote_peer_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    network: MemoryNetwork,
    inner: Mutex<EndpointState>,
}

impl MemoryTransport {
    fn state(&self) -> MutexGuard<'_, EndpointState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ready(&self) -> bool {
        let st = self.state();
        st.has_local && st.has_remote
    }

    fn linked(&self) -> bool {
        self.state().linked
    }

    fn take_pending(&self) -> Vec<String> {
        std::mem::take(&mut self.state().pending)
    }

    fn set_state(&self, state: ConnectionState) {
        {
            let mut st = self.state();
            if st.state == state {
                return;
            }
            st.state = state;
            if state == ConnectionState::Connected {
                st.linked = true;
            }
        }
        emit(
            &self.events,
            TransportEvent::StateChanged {
                peer_id: self.remote_peer_id.clone(),
                state,
            },
        );
    }

    fn close_channels(&self) {
        let channels = std::mem::take(&mut self.state().channels);
        for ch in channels {
            if ch.open.swap(false, Ordering::AcqRel) {
                emit(
                    &self.events,
                    TransportEvent::ChannelClosed {
                        peer_id: self.remote_peer_id.clone(),
                        label: ch.label.clone(),
                    },
                );
            }
        }
    }

    fn local_description(&self, desc: SessionDescription) -> SessionDescription {
        {
            let mut st = self.state();
            st.has_local = true;
            if st.state == ConnectionState::New {
                st.state = ConnectionState::Connecting;
            }
        }
        emit(
            &self.events,
            TransportEvent::LocalCandidate {
                peer_id: self.remote_peer_id.clone(),
                candidate: IceCandidate {
                    candidate: format!("candidate:memory 1 udp 1 {} 0 typ host", self.local_peer_id),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                },
            },
        );
        self.network.try_link(&self.local_peer_id, &self.remote_peer_id);
        desc
    }

    pub fn remote_candidate_count(&self) -> usize {
        self.state().remote_candidates
    }
}

#[async_trait]
impl NegotiatedTransport for MemoryTransport {
    async fn open_data_channel(&self, label: &str) -> Result<()> {
        if self.state().state.is_terminal() {
            return Err(anyhow!("transport to {} is closed", self.remote_peer_id));
        }
        self.network
            .open_or_queue(&self.local_peer_id, &self.remote_peer_id, label);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let desc = SessionDescription::offer(format!("memory-offer {}", self.local_peer_id));
        Ok(self.local_description(desc))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if !self.state().has_remote {
            return Err(anyhow!("cannot answer before a remote offer is set"));
        }
        let desc = SessionDescription::answer(format!("memory-answer {}", self.local_peer_id));
        Ok(self.local_description(desc))
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
        self.state().has_remote = true;
        self.network.try_link(&self.local_peer_id, &self.remote_peer_id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.is_empty() {
            return Err(anyhow!("empty candidate"));
        }
        self.state().remote_candidates += 1;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state().state
    }

    async fn close(&self) -> Result<()> {
        self.close_channels();
        self.set_state(ConnectionState::Closed);
        if let Some(peer) = self.network.remove(&self.local_peer_id, &self.remote_peer_id) {
            peer.close_channels();
            peer.set_state(ConnectionState::Closed);
        }
        Ok(())
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Sending half of an in-process data channel. Both halves share the open flag.
pub struct MemoryChannel {
    label: String,
    sender_id: String,
    receiver_id: String,
    open: Arc<AtomicBool>,
    local_events: mpsc::UnboundedSender<TransportEvent>,
    remote_events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("data channel '{}' is closed", self.label));
        }
        self.remote_events
            .send(TransportEvent::Message {
                peer_id: self.sender_id.clone(),
                label: self.label.clone(),
                data,
            })
            .map_err(|_| anyhow!("remote side of '{}' is gone", self.label))
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(event = "memory_channel_closed", label = %self.label, "In-process data channel closed");
        emit(
            &self.local_events,
            TransportEvent::ChannelClosed {
                peer_id: self.receiver_id.clone(),
                label: self.label.clone(),
            },
        );
        emit(
            &self.remote_events,
            TransportEvent::ChannelClosed {
                peer_id: self.sender_id.clone(),
                label: self.label.clone(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::default_ice_servers;

    async fn endpoint(
        net: &MemoryNetwork,
        local: &str,
        remote: &str,
    ) -> (Arc<dyn NegotiatedTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let t = net
            .connect(ConnectContext {
                local_peer_id: local.into(),
                remote_peer_id: remote.into(),
                ice_servers: default_ice_servers(),
                events: tx,
            })
            .await
            .unwrap();
        (t, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_offer_answer_links_and_opens_channel() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = endpoint(&net, "alice", "bob").await;
        let (b, mut b_rx) = endpoint(&net, "bob", "alice").await;

        a.open_data_channel("txn").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        assert_eq!(a.connection_state(), ConnectionState::Connecting);
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);

        let b_channel = drain(&mut b_rx)
            .into_iter()
            .find_map(|ev| match ev {
                TransportEvent::ChannelOpen { channel, peer_id, .. } => {
                    assert_eq!(peer_id, "alice");
                    Some(channel)
                }
                _ => None,
            })
            .unwrap();
        assert!(drain(&mut a_rx).iter().any(|ev| matches!(ev, TransportEvent::ChannelOpen { .. })));

        b_channel.send(Bytes::from_static(b"hi")).await.unwrap();
        match a_rx.recv().await.unwrap() {
            TransportEvent::Message { peer_id, label, data } => {
                assert_eq!(peer_id, "bob");
                assert_eq!(label, "txn");
                assert_eq!(&data[..], b"hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let net = MemoryNetwork::new();
        let (b, _rx) = endpoint(&net, "bob", "alice").await;
        assert!(b.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn test_fault_closes_channels() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = endpoint(&net, "alice", "bob").await;
        let (b, _b_rx) = endpoint(&net, "bob", "alice").await;
        a.open_data_channel("txn").await.unwrap();
        b.set_remote_description(a.create_offer().await.unwrap()).await.unwrap();
        a.set_remote_description(b.create_answer().await.unwrap()).await.unwrap();
        drain(&mut a_rx);

        net.set_link_state("alice", "bob", ConnectionState::Failed);
        let events = drain(&mut a_rx);
        assert!(events.iter().any(|ev| matches!(
            ev,
            TransportEvent::StateChanged { state: ConnectionState::Failed, .. }
        )));
        assert!(events.iter().any(|ev| matches!(ev, TransportEvent::ChannelClosed { .. })));
        assert!(a.open_data_channel("next").await.is_err());
    }

    #[tokio::test]
    async fn test_channel_close_reaches_both_ends() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = endpoint(&net, "alice", "bob").await;
        let (b, mut b_rx) = endpoint(&net, "bob", "alice").await;
        a.open_data_channel("txn").await.unwrap();
        b.set_remote_description(a.create_offer().await.unwrap()).await.unwrap();
        a.set_remote_description(b.create_answer().await.unwrap()).await.unwrap();

        let a_channel = drain(&mut a_rx)
            .into_iter()
            .find_map(|ev| match ev {
                TransportEvent::ChannelOpen { channel, .. } => Some(channel),
                _ => None,
            })
            .unwrap();
        drain(&mut b_rx);

        a_channel.send(Bytes::from_static(b"last")).await.unwrap();
        a_channel.close().await.unwrap();
        a_channel.close().await.unwrap();
        assert!(!a_channel.is_open());
        assert!(a_channel.send(Bytes::from_static(b"late")).await.is_err());

        let closed: Vec<(String, String)> = drain(&mut a_rx)
            .into_iter()
            .filter_map(|ev| match ev {
                TransportEvent::ChannelClosed { peer_id, label } => Some((peer_id, label)),
                _ => None,
            })
            .collect();
        assert_eq!(closed, vec![("bob".to_string(), "txn".to_string())]);

        // The remote end sees the queued message first, then the close.
        let b_events = drain(&mut b_rx);
        assert!(matches!(&b_events[0], TransportEvent::Message { data, .. } if &data[..] == b"last"));
        assert!(matches!(
            &b_events[1],
            TransportEvent::ChannelClosed { peer_id, label } if peer_id == "alice" && label == "txn"
        ));
        assert_eq!(b_events.len(), 2);

        // The link itself stays up.
        assert_eq!(a.connection_state(), ConnectionState::Connected);
    }
}
