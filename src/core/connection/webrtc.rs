//! WebRTC transport built on the `webrtc` crate.
//!
//! One `RTCPeerConnection` per remote peer. Candidates trickle: every local
//! candidate is posted as soon as it is gathered, and remote candidates are
//! applied as they arrive. Data channels are ordered and reliable, one per
//! transaction, labelled with the transaction id.

use super::{
    ConnectContext, ConnectionState, DataChannel, DescriptionType, IceCandidate,
    NegotiatedTransport, SessionDescription, TransportConnector, TransportEvent, emit,
};
use crate::core::config::IceServer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Connector producing real WebRTC peer connections.
#[derive(Debug, Default, Clone)]
pub struct WebRtcConnector;

impl WebRtcConnector {
    pub fn new() -> Self {
        Self
    }
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone(),
            credential: s.credential.clone(),
        })
        .collect()
}

fn create_webrtc_api() -> Result<webrtc::api::API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;
    Ok(APIBuilder::new()
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

fn map_state(s: RTCPeerConnectionState) -> ConnectionState {
    match s {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

#[async_trait]
impl TransportConnector for WebRtcConnector {
    async fn connect(&self, ctx: ConnectContext) -> Result<Arc<dyn NegotiatedTransport>> {
        let api = create_webrtc_api()?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: rtc_ice_servers(&ctx.ice_servers),
                ..Default::default()
            })
            .await?,
        );

        // Connection state.
        {
            let tx = ctx.events.clone();
            let peer_id = ctx.remote_peer_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                let tx = tx.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    match s {
                        RTCPeerConnectionState::Connected => {
                            info!(event = "webrtc_connected", peer = %peer_id, "WebRTC connection established");
                        }
                        RTCPeerConnectionState::Failed => {
                            error!(event = "webrtc_failed", peer = %peer_id, "WebRTC connection failed");
                        }
                        RTCPeerConnectionState::Disconnected => {
                            warn!(event = "webrtc_disconnected", peer = %peer_id, "WebRTC transient disconnect (ICE may recover)");
                        }
                        RTCPeerConnectionState::Closed => {
                            info!(event = "webrtc_closed", peer = %peer_id, "WebRTC connection closed");
                        }
                        _ => {}
                    }
                    emit(
                        &tx,
                        TransportEvent::StateChanged {
                            peer_id,
                            state: map_state(s),
                        },
                    );
                })
            }));
        }

        // Trickled local candidates.
        {
            let tx = ctx.events.clone();
            let peer_id = ctx.remote_peer_id.clone();
            pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    // `None` marks the end of gathering.
                    let Some(c) = c else {
                        debug!(event = "ice_gathering_complete", peer = %peer_id, "ICE gathering complete");
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => emit(
                            &tx,
                            TransportEvent::LocalCandidate {
                                peer_id,
                                candidate: IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                },
                            },
                        ),
                        Err(e) => warn!(event = "ice_candidate_encode_failure", peer = %peer_id, error = %e, "Dropping local candidate"),
                    }
                })
            }));
        }

        // Channels opened by the remote side.
        {
            let tx = ctx.events.clone();
            let peer_id = ctx.remote_peer_id.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let tx = tx.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    attach_dc_handlers(&dc, &peer_id, &tx);
                })
            }));
        }

        Ok(Arc::new(WebRtcTransport {
            pc,
            remote_peer_id: ctx.remote_peer_id,
            events: ctx.events,
        }))
    }
}

// ── Data channel handlers ─────────────────────────────────────────────────────

/// Attach `on_open`, `on_close`, `on_error`, and `on_message` callbacks to `dc`.
fn attach_dc_handlers(
    dc: &Arc<RTCDataChannel>,
    peer_id: &str,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let announced = Arc::new(AtomicBool::new(false));
    let label = dc.label().to_string();

    {
        let dc_ref = dc.clone();
        let tx = events.clone();
        let peer_id = peer_id.to_string();
        let announced = announced.clone();
        dc.on_open(Box::new(move || {
            let dc_ref = dc_ref.clone();
            let tx = tx.clone();
            let peer_id = peer_id.clone();
            let announced = announced.clone();
            Box::pin(async move {
                announce_open(&dc_ref, &peer_id, &tx, &announced);
            })
        }));
    }

    {
        let tx = events.clone();
        let peer_id = peer_id.to_string();
        let label = label.clone();
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            let peer_id = peer_id.clone();
            let label = label.clone();
            Box::pin(async move {
                warn!(event = "dc_closed", channel = %label, "DataChannel closed by transport");
                emit(&tx, TransportEvent::ChannelClosed { peer_id, label });
            })
        }));
    }

    {
        let label = label.clone();
        dc.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                error!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
            })
        }));
    }

    {
        let tx = events.clone();
        let peer_id = peer_id.to_string();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            let peer_id = peer_id.clone();
            let label = label.clone();
            Box::pin(async move {
                if msg.data.is_empty() {
                    return;
                }
                emit(
                    &tx,
                    TransportEvent::Message {
                        peer_id,
                        label,
                        data: msg.data,
                    },
                );
            })
        }));
    }

    // The remote side may hand over a channel that is already open.
    if dc.ready_state() == RTCDataChannelState::Open {
        announce_open(dc, peer_id, events, &announced);
    }
}

fn announce_open(
    dc: &Arc<RTCDataChannel>,
    peer_id: &str,
    events: &mpsc::UnboundedSender<TransportEvent>,
    announced: &AtomicBool,
) {
    if announced.swap(true, Ordering::AcqRel) {
        return;
    }
    debug!(event = "dc_open", channel = %dc.label(), peer = %peer_id, "DataChannel open");
    emit(
        events,
        TransportEvent::ChannelOpen {
            peer_id: peer_id.to_string(),
            label: dc.label().to_string(),
            channel: Arc::new(WebRtcChannel { dc: dc.clone() }),
        },
    );
}

// ── Transport ─────────────────────────────────────────────────────────────────

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    remote_peer_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
impl NegotiatedTransport for WebRtcTransport {
    async fn open_data_channel(&self, label: &str) -> Result<()> {
        // Explicit ordered + fully reliable (SCTP default, no partial reliability).
        let init = Some(RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        });
        let dc = self
            .pc
            .create_data_channel(label, init)
            .await
            .with_context(|| format!("create data channel '{label}'"))?;
        attach_dc_handlers(&dc, &self.remote_peer_id, &self.events);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let rtc = match desc.kind {
            DescriptionType::Offer => RTCSessionDescription::offer(desc.sdp)?,
            DescriptionType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        };
        self.pc.set_remote_description(rtc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        map_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.dc
            .send(&data)
            .await
            .with_context(|| format!("send on data channel '{}'", self.dc.label()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if matches!(
            self.dc.ready_state(),
            RTCDataChannelState::Closing | RTCDataChannelState::Closed
        ) {
            return Ok(());
        }
        self.dc
            .close()
            .await
            .with_context(|| format!("close data channel '{}'", self.dc.label()))?;
        Ok(())
    }
}
