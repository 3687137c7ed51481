//! TransferEngine: the transfer orchestrator.
//!
//! One task owns every registry (transactions, peer connections, reassembly
//! buffers) and processes events strictly one at a time:
//!
//! - relay messages from the signaling adapter,
//! - transport events (candidates, state changes, channel open/close, chunks),
//! - commands from the embedding application ([`EngineHandle`]),
//! - completion reports from sender tasks.
//!
//! Sender tasks are the only concurrent workers. They touch their data
//! channel and the throughput monitor, and report back with
//! [`EngineEvent::SendFinished`].
//!
//! Every transaction runs on its own data channel, closed when the
//! transaction ends. A completed sink leaves the close to the source, which
//! closes only once its buffer has drained.
//!
//! Roles: the side that receives a proposal is the offerer and the sink; the
//! side that proposed is the answerer and the source.

use crate::core::config::EngineConfig;
use crate::core::connection::manager::PeerConnectionManager;
use crate::core::connection::{
    ConnectionState, DataChannel, DescriptionType, TransportConnector, TransportEvent,
};
use crate::core::error::{TransferError, TransferResult};
use crate::core::pipeline::receiver::{ChunkOutcome, DeliveredPayload, Reassembler};
use crate::core::pipeline::sender::{SendReport, send_files};
use crate::core::signaling::{
    SignalKind, SignalMessage, SignalPayload, SignalingAdapter, TransferCancelled,
    TransferProposed, TransportSignal,
};
use crate::core::throughput::{HttpLatencyProbe, LatencyProbe, ThroughputMonitor};
use crate::core::transaction::{
    OutgoingFile, Transaction, TransactionManager, TransactionState,
};
use crate::utils::sos::SignalOfStop;
use anyhow::{Result, anyhow};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ── Events ───────────────────────────────────────────────────────────────────

/// Requests from the embedding application.
#[derive(Debug)]
pub enum TransferCommand {
    Propose {
        target: String,
        files: Vec<OutgoingFile>,
        reply: oneshot::Sender<TransferResult<Uuid>>,
    },
    Cancel {
        transaction_id: Uuid,
        reply: oneshot::Sender<TransferResult<()>>,
    },
    Shutdown,
}

/// Everything the orchestrator reacts to.
#[derive(Debug)]
pub enum EngineEvent {
    Signal(SignalMessage),
    Transport(TransportEvent),
    Command(TransferCommand),
    SendFinished {
        transaction_id: Uuid,
        result: TransferResult<SendReport>,
    },
}

/// Notifications for the embedding application.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    StateChanged {
        transaction_id: Uuid,
        peer_id: String,
        state: TransactionState,
    },
    Progress {
        transaction_id: Uuid,
        received: u64,
        total: u64,
    },
    Delivered(DeliveredPayload),
    SendFinished {
        transaction_id: Uuid,
        report: SendReport,
    },
}

/// Forward `msg` to the application layer; silently no-ops when `app_tx` is `None`.
#[inline]
fn notify_app(app_tx: &Option<mpsc::UnboundedSender<TransferEvent>>, msg: TransferEvent) {
    if let Some(tx) = app_tx {
        let _ = tx.send(msg);
    }
}

/// How a transaction ends.
enum Termination {
    Completed,
    Failed(String),
    Cancelled(Option<String>),
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Cloneable command side of a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    events: mpsc::UnboundedSender<EngineEvent>,
    throughput: ThroughputMonitor,
}

impl EngineHandle {
    /// Propose `files` to `target`. Returns the new transaction id.
    pub async fn propose_transfer(&self, target: &str, files: Vec<OutgoingFile>) -> Result<Uuid> {
        let (reply, rx) = oneshot::channel();
        self.send(TransferCommand::Propose {
            target: target.to_string(),
            files,
            reply,
        })?;
        Ok(rx.await.map_err(|_| anyhow!("engine stopped"))??)
    }

    /// Cancel a live transaction.
    pub async fn cancel(&self, transaction_id: Uuid) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(TransferCommand::Cancel {
            transaction_id,
            reply,
        })?;
        Ok(rx.await.map_err(|_| anyhow!("engine stopped"))??)
    }

    pub fn shutdown(&self) {
        let _ = self.send(TransferCommand::Shutdown);
    }

    pub fn throughput(&self) -> &ThroughputMonitor {
        &self.throughput
    }

    fn send(&self, cmd: TransferCommand) -> Result<()> {
        self.events
            .send(EngineEvent::Command(cmd))
            .map_err(|_| anyhow!("engine stopped"))
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Receiving ends of the engine's inputs.
pub struct EngineInputs {
    signals: mpsc::UnboundedReceiver<SignalMessage>,
    transport: mpsc::UnboundedReceiver<TransportEvent>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
}

pub struct TransferEngine {
    local_peer_id: String,
    signaling: Arc<dyn SignalingAdapter>,
    transactions: TransactionManager,
    peers: PeerConnectionManager,
    reassembler: Reassembler,
    throughput: ThroughputMonitor,
    senders: HashMap<Uuid, JoinHandle<()>>,
    channels: HashMap<Uuid, Arc<dyn DataChannel>>,
    app_tx: Option<mpsc::UnboundedSender<TransferEvent>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl TransferEngine {
    /// Build an engine and subscribe it to the relay. Nothing runs until
    /// [`TransferEngine::run`] is awaited.
    pub fn new(
        config: &EngineConfig,
        signaling: Arc<dyn SignalingAdapter>,
        connector: Arc<dyn TransportConnector>,
        app_tx: Option<mpsc::UnboundedSender<TransferEvent>>,
    ) -> (Self, EngineInputs) {
        let probe: Option<Arc<dyn LatencyProbe>> = match &config.liveness_url {
            Some(url) => match HttpLatencyProbe::new(url.clone()) {
                Ok(p) => Some(Arc::new(p)),
                Err(e) => {
                    warn!(event = "idle_probe_disabled", error = %e, "Could not build liveness probe");
                    None
                }
            },
            None => None,
        };
        let throughput = ThroughputMonitor::new(probe);

        let (signal_tx, signals) = mpsc::unbounded_channel();
        for kind in [
            SignalKind::TransferProposed,
            SignalKind::TransportSignal,
            SignalKind::TransferCancelled,
        ] {
            signaling.subscribe(kind, signal_tx.clone());
        }
        let (transport_tx, transport) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        let peers = PeerConnectionManager::new(
            connector,
            signaling.clone(),
            throughput.clone(),
            config.ice_servers.clone(),
            transport_tx,
        );

        let engine = Self {
            local_peer_id: signaling.local_peer_id().to_string(),
            signaling,
            transactions: TransactionManager::new(),
            peers,
            reassembler: Reassembler::new(throughput.clone()),
            throughput,
            senders: HashMap::new(),
            channels: HashMap::new(),
            app_tx,
            events_tx,
        };
        let inputs = EngineInputs {
            signals,
            transport,
            events,
        };
        (engine, inputs)
    }

    /// Build, spawn and return the handle of a running engine.
    pub fn start(
        config: &EngineConfig,
        signaling: Arc<dyn SignalingAdapter>,
        connector: Arc<dyn TransportConnector>,
        app_tx: Option<mpsc::UnboundedSender<TransferEvent>>,
        sos: SignalOfStop,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (engine, inputs) = Self::new(config, signaling, connector, app_tx);
        let handle = engine.handle();
        engine.throughput.spawn(sos.clone());
        let task = tokio::spawn(engine.run(inputs, sos));
        (handle, task)
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            events: self.events_tx.clone(),
            throughput: self.throughput.clone(),
        }
    }

    /// Process events until shutdown or cancellation.
    pub async fn run(mut self, mut inputs: EngineInputs, sos: SignalOfStop) {
        info!(event = "engine_started", peer = %self.local_peer_id, "Transfer engine running");
        loop {
            let event = tokio::select! {
                _ = sos.wait() => break,
                Some(msg) = inputs.signals.recv() => EngineEvent::Signal(msg),
                Some(ev) = inputs.transport.recv() => EngineEvent::Transport(ev),
                Some(ev) = inputs.events.recv() => ev,
                else => break,
            };
            if matches!(event, EngineEvent::Command(TransferCommand::Shutdown)) {
                break;
            }
            self.dispatch(event).await;
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        for (_, task) in self.senders.drain() {
            task.abort();
        }
        self.peers.close_all().await;
        info!(event = "engine_stopped", peer = %self.local_peer_id, active = self.transactions.active_count(), "Transfer engine stopped");
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub async fn dispatch(&mut self, event: EngineEvent) {
        let result = match event {
            EngineEvent::Signal(SignalMessage::Proposed(msg)) => self.on_proposed(msg).await,
            EngineEvent::Signal(SignalMessage::Transport(msg)) => self.on_transport_signal(msg).await,
            EngineEvent::Signal(SignalMessage::Cancelled(msg)) => self.on_remote_cancel(msg),
            EngineEvent::Transport(ev) => self.on_transport_event(ev),
            EngineEvent::Command(cmd) => {
                self.on_command(cmd);
                Ok(())
            }
            EngineEvent::SendFinished {
                transaction_id,
                result,
            } => {
                self.on_send_finished(transaction_id, result);
                Ok(())
            }
        };
        if let Err(e) = result {
            log_error(&e);
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    fn on_command(&mut self, cmd: TransferCommand) {
        match cmd {
            TransferCommand::Propose {
                target,
                files,
                reply,
            } => {
                let _ = reply.send(self.propose_transfer(&target, files));
            }
            TransferCommand::Cancel {
                transaction_id,
                reply,
            } => {
                let _ = reply.send(self.cancel(transaction_id));
            }
            TransferCommand::Shutdown => {}
        }
    }

    /// Create a source transaction and announce it to `target`.
    pub fn propose_transfer(&mut self, target: &str, files: Vec<OutgoingFile>) -> TransferResult<Uuid> {
        let txn = Transaction::new_source(target.to_string(), files)?;
        let id = txn.id;
        let message = SignalMessage::Proposed(TransferProposed {
            transaction_id: id,
            source_peer_id: self.local_peer_id.clone(),
            files: txn.files.clone(),
        });
        info!(
            event = "transfer_proposed",
            transaction_id = %id,
            peer = %target,
            files = txn.files.len(),
            bytes = txn.total_bytes(),
            "Proposing transfer"
        );
        self.transactions.insert(txn);
        self.notify_state(id);

        if let Err(e) = self.signaling.send(target, id, message) {
            let err = TransferError::signaling(target, format!("{e:#}"));
            self.terminate(id, Termination::Failed(err.to_string()));
            return Err(err);
        }
        Ok(id)
    }

    /// Cancel a live transaction. The remote peer is told only when a
    /// connection to it exists; a later offer for the transaction is
    /// answered with a cancellation instead.
    pub fn cancel(&mut self, transaction_id: Uuid) -> TransferResult<()> {
        let Some(txn) = self.transactions.get(&transaction_id) else {
            return Err(TransferError::UnknownTransaction(transaction_id));
        };
        if txn.state.is_terminal() {
            return Err(TransferError::UnknownTransaction(transaction_id));
        }
        let peer_id = txn.peer_id.clone();
        self.terminate(transaction_id, Termination::Cancelled(Some("cancelled locally".into())));

        if self.peers.contains(&peer_id) {
            self.send_cancel_notice(&peer_id, transaction_id, Some("cancelled by peer".into()));
        }
        Ok(())
    }

    // ── Relay messages ───────────────────────────────────────────────────

    async fn on_proposed(&mut self, msg: TransferProposed) -> TransferResult<()> {
        let id = msg.transaction_id;
        let peer = msg.source_peer_id.clone();
        if self.transactions.get(&id).is_some() {
            return Err(TransferError::signaling(&peer, format!("duplicate proposal {id}")));
        }

        let txn = Transaction::new_sink(id, peer.clone(), msg.files)?;
        info!(
            event = "transfer_incoming",
            transaction_id = %id,
            peer = %peer,
            files = txn.files.len(),
            bytes = txn.total_bytes(),
            "Incoming transfer proposal"
        );
        self.transactions.insert(txn);
        self.notify_state(id);
        self.set_state(id, TransactionState::Negotiating);

        let (transport, created) = self.peers.create_connection(&peer, id).await?;
        transport
            .open_data_channel(&id.to_string())
            .await
            .map_err(|e| TransferError::negotiation(&peer, format!("{e:#}")))?;
        if created {
            self.peers.send_offer(&peer, id).await?;
        }
        Ok(())
    }

    async fn on_transport_signal(&mut self, msg: TransportSignal) -> TransferResult<()> {
        if msg.target_peer_id != self.local_peer_id {
            return Err(TransferError::signaling(
                &msg.source_peer_id,
                format!("signal addressed to {}", msg.target_peer_id),
            ));
        }
        let is_offer = matches!(
            msg.payload,
            SignalPayload::Description {
                description_type: DescriptionType::Offer,
                ..
            }
        );
        let live = self
            .transactions
            .get(&msg.transaction_id)
            .is_some_and(|t| t.peer_id == msg.source_peer_id && !t.state.is_terminal());
        if is_offer && !live {
            self.send_cancel_notice(&msg.source_peer_id, msg.transaction_id, Some("transfer is no longer available".into()));
            return Err(TransferError::signaling(
                &msg.source_peer_id,
                format!("offer for transaction {} that is not live", msg.transaction_id),
            ));
        }

        let applied = self
            .peers
            .handle_inbound_signal(&msg.source_peer_id, msg.transaction_id, msg.payload)
            .await?;

        if applied.is_some()
            && let Some(txn) = self.transactions.get(&msg.transaction_id)
            && txn.state == TransactionState::Created
        {
            self.set_state(msg.transaction_id, TransactionState::Negotiating);
        }
        Ok(())
    }

    fn on_remote_cancel(&mut self, msg: TransferCancelled) -> TransferResult<()> {
        let id = msg.transaction_id;
        match self.transactions.get(&id) {
            Some(txn) if !txn.state.is_terminal() && txn.peer_id == msg.source_peer_id => {
                info!(event = "transfer_cancelled_remote", transaction_id = %id, peer = %msg.source_peer_id, "Remote peer cancelled transfer");
                self.terminate(id, Termination::Cancelled(msg.reason));
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(TransferError::UnknownTransaction(id)),
        }
    }

    // ── Transport events ─────────────────────────────────────────────────

    fn on_transport_event(&mut self, ev: TransportEvent) -> TransferResult<()> {
        match ev {
            TransportEvent::LocalCandidate { peer_id, candidate } => {
                self.peers.on_local_candidate(&peer_id, candidate)
            }
            TransportEvent::StateChanged { peer_id, state } => {
                self.on_connection_state(&peer_id, state);
                Ok(())
            }
            TransportEvent::ChannelOpen {
                peer_id,
                label,
                channel,
            } => self.on_channel_open(&peer_id, &label, channel),
            TransportEvent::Message {
                peer_id,
                label,
                data,
            } => self.on_chunk(&peer_id, &label, data),
            TransportEvent::ChannelClosed { peer_id, label } => {
                self.on_channel_closed(&peer_id, &label);
                Ok(())
            }
        }
    }

    fn on_connection_state(&mut self, peer_id: &str, state: ConnectionState) {
        debug!(event = "connection_state", peer = %peer_id, state = %state, "Peer connection state changed");
        self.peers.on_state_change(peer_id, state);

        if !state.is_terminal() {
            return;
        }
        log_error(&TransferError::PeerDisconnect {
            peer_id: peer_id.to_string(),
        });
        for id in self.transactions.active_for_peer(peer_id) {
            self.terminate(id, Termination::Failed(format!("peer connection {state}")));
            self.send_cancel_notice(peer_id, id, Some(format!("peer connection {state}")));
        }
    }

    fn on_channel_open(
        &mut self,
        peer_id: &str,
        label: &str,
        channel: Arc<dyn DataChannel>,
    ) -> TransferResult<()> {
        let id = self.live_transaction(peer_id, label)?;
        if self.transactions.get(&id).is_some_and(|t| t.state == TransactionState::Created) {
            // Reused connection: no offer was exchanged for this transaction.
            self.set_state(id, TransactionState::Negotiating);
        }
        self.set_state(id, TransactionState::ChannelOpen);
        self.set_state(id, TransactionState::Transferring);
        self.throughput.start(id, peer_id);

        let Some(txn) = self.transactions.get(&id) else {
            return Err(TransferError::UnknownTransaction(id));
        };
        self.channels.insert(id, channel.clone());

        if txn.is_source() {
            let files = txn.outgoing_files();
            let throughput = self.throughput.clone();
            let events = self.events_tx.clone();
            let task = tokio::spawn(async move {
                let result = send_files(id, channel, files, throughput).await;
                let _ = events.send(EngineEvent::SendFinished {
                    transaction_id: id,
                    result,
                });
            });
            self.senders.insert(id, task);
        } else if let Some(payload) = self.reassembler.register(txn) {
            self.deliver(id, payload);
        }
        Ok(())
    }

    fn on_chunk(&mut self, peer_id: &str, label: &str, data: Bytes) -> TransferResult<()> {
        let id = self.live_transaction(peer_id, label)?;
        let Some(txn) = self.transactions.get_active_mut(&id) else {
            return Err(TransferError::UnknownTransaction(id));
        };
        if txn.is_source() {
            return Err(TransferError::signaling(peer_id, "data received on a source transaction"));
        }

        match self.reassembler.on_chunk(txn, data) {
            Ok(ChunkOutcome::Progress { received, total }) => {
                notify_app(&self.app_tx, TransferEvent::Progress { transaction_id: id, received, total });
                Ok(())
            }
            Ok(ChunkOutcome::Completed(payload)) => {
                let total = txn.total_bytes();
                notify_app(&self.app_tx, TransferEvent::Progress { transaction_id: id, received: total, total });
                self.deliver(id, payload);
                Ok(())
            }
            Err(e @ TransferError::Overflow { .. }) => {
                self.terminate(id, Termination::Failed(e.to_string()));
                self.send_cancel_notice(peer_id, id, Some("received more bytes than declared".into()));
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn on_channel_closed(&mut self, peer_id: &str, label: &str) {
        let Ok(id) = self.live_transaction(peer_id, label) else {
            return;
        };
        // Source transactions learn about it from their sender task.
        if self.transactions.get(&id).is_some_and(|t| !t.is_source()) {
            self.terminate(id, Termination::Failed("data channel closed before completion".into()));
        }
    }

    fn on_send_finished(&mut self, id: Uuid, result: TransferResult<SendReport>) {
        self.senders.remove(&id);
        if !self.transactions.contains_active(&id) {
            return;
        }
        let result = result.and_then(|report| {
            let Some(txn) = self.transactions.get_active_mut(&id) else {
                return Err(TransferError::UnknownTransaction(id));
            };
            let sent = txn.add_received(report.bytes_sent)?;
            if sent != txn.total_bytes() {
                return Err(TransferError::Transport {
                    transaction_id: id,
                    reason: format!("sent {sent} of {} declared bytes", txn.total_bytes()),
                });
            }
            Ok(report)
        });
        match result {
            Ok(report) => {
                notify_app(&self.app_tx, TransferEvent::SendFinished { transaction_id: id, report });
                self.terminate(id, Termination::Completed);
            }
            Err(e) => {
                log_error(&e);
                let peer = self.transactions.get(&id).map(|t| t.peer_id.clone());
                self.terminate(id, Termination::Failed(e.to_string()));
                if let Some(peer) = peer {
                    self.send_cancel_notice(&peer, id, Some("sender failed".into()));
                }
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    /// Resolve a channel label to a live transaction with `peer_id`.
    fn live_transaction(&self, peer_id: &str, label: &str) -> TransferResult<Uuid> {
        let id = Uuid::parse_str(label)
            .map_err(|_| TransferError::signaling(peer_id, format!("channel label {label:?} is not a transaction id")))?;
        match self.transactions.get(&id) {
            Some(txn) if txn.peer_id == peer_id && !txn.state.is_terminal() => Ok(id),
            _ => Err(TransferError::UnknownTransaction(id)),
        }
    }

    fn deliver(&mut self, id: Uuid, payload: DeliveredPayload) {
        info!(
            event = "transfer_delivered",
            transaction_id = %id,
            name = %payload.name,
            bytes = payload.data.len(),
            "Transfer delivered"
        );
        notify_app(&self.app_tx, TransferEvent::Delivered(payload));
        self.terminate(id, Termination::Completed);
    }

    fn set_state(&mut self, id: Uuid, next: TransactionState) -> bool {
        let Some(txn) = self.transactions.get_active_mut(&id) else {
            return false;
        };
        let prev = txn.state;
        if !txn.transition(next) {
            warn!(event = "invalid_transition", transaction_id = %id, from = ?prev, to = ?next, "Ignoring invalid state transition");
            return false;
        }
        debug!(event = "transaction_state", transaction_id = %id, from = ?prev, to = ?next, "Transaction state changed");
        self.notify_state(id);
        true
    }

    fn notify_state(&self, id: Uuid) {
        if let Some(txn) = self.transactions.get(&id) {
            notify_app(
                &self.app_tx,
                TransferEvent::StateChanged {
                    transaction_id: id,
                    peer_id: txn.peer_id.clone(),
                    state: txn.state,
                },
            );
        }
    }

    /// Drive `id` to a terminal state, release its local resources and
    /// move it to history.
    fn terminate(&mut self, id: Uuid, how: Termination) {
        if let Some(task) = self.senders.remove(&id) {
            task.abort();
        }
        self.reassembler.abort(&id);
        self.throughput.stop(id);

        let Some(txn) = self.transactions.get_active_mut(&id) else {
            self.channels.remove(&id);
            return;
        };
        let sink_completed = matches!(how, Termination::Completed) && !txn.is_source();
        let changed = match how {
            Termination::Completed => txn.transition(TransactionState::Completed),
            Termination::Failed(reason) => {
                warn!(event = "transfer_failed", transaction_id = %id, reason = %reason, "Transfer failed");
                txn.fail(reason)
            }
            Termination::Cancelled(reason) => txn.cancel(reason),
        };
        if changed {
            info!(event = "transaction_finished", transaction_id = %id, state = ?txn.state, "Transaction finished");
            self.notify_state(id);
        }
        if txn_is_terminal(&self.transactions, &id) {
            self.transactions.archive(&id);
        }

        if let Some(channel) = self.channels.remove(&id)
            && !sink_completed
        {
            tokio::spawn(async move {
                if let Err(e) = channel.close().await {
                    debug!(event = "channel_close_failure", transaction_id = %id, error = %e, "Closing data channel failed");
                }
            });
        }
    }

    fn send_cancel_notice(&self, peer_id: &str, id: Uuid, reason: Option<String>) {
        let message = SignalMessage::Cancelled(TransferCancelled {
            transaction_id: id,
            source_peer_id: self.local_peer_id.clone(),
            reason,
        });
        if let Err(e) = self.signaling.send(peer_id, id, message) {
            log_error(&TransferError::signaling(peer_id, format!("{e:#}")));
        }
    }
}

fn txn_is_terminal(transactions: &TransactionManager, id: &Uuid) -> bool {
    transactions.get(id).is_some_and(|t| t.state.is_terminal())
}

/// Structured diagnostics for errors that never leave the engine.
fn log_error(e: &TransferError) {
    match e {
        TransferError::Signaling { peer_id, reason } => {
            warn!(event = "signaling_error", peer = %peer_id, reason = %reason, "Dropping signal");
        }
        TransferError::Negotiation { peer_id, reason } => {
            error!(event = "negotiation_error", peer = %peer_id, reason = %reason, "Negotiation step failed");
        }
        TransferError::Transport {
            transaction_id,
            reason,
        } => {
            error!(event = "transport_error", transaction_id = %transaction_id, reason = %reason, "Transport send failed");
        }
        TransferError::PeerDisconnect { peer_id } => {
            warn!(event = "peer_disconnect", peer = %peer_id, "Peer connection lost");
        }
        TransferError::Overflow {
            transaction_id,
            received,
            total,
        } => {
            error!(event = "overflow", transaction_id = %transaction_id, received, total, "Received more bytes than declared");
        }
        TransferError::UnknownTransaction(id) => {
            debug!(event = "unknown_transaction", transaction_id = %id, "Event for unknown transaction");
        }
    }
}
