//! Transaction model for direct transfers.
//!
//! A Transaction is one proposed transfer between this device and one remote
//! peer, regardless of how many files it declares. It owns:
//! - the lifecycle state machine,
//! - the two independent role markers (who negotiates, who sends bytes),
//! - the declared file list and the fixed `total_bytes`,
//! - the monotonically growing `received_bytes` counter (sink side).
//!
//! Transactions are owned by the [`TransactionManager`] held by the
//! orchestrator and only mutated from its event handlers.

use crate::core::config::MAX_FINISHED_TRANSACTIONS;
use crate::core::error::{TransferError, TransferResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Instant;
use uuid::Uuid;

// ── Transaction State Machine ────────────────────────────────────────────────

/// Lifecycle of a transaction.
///
/// `Created → Negotiating → ChannelOpen → Transferring → Completed`, with
/// `Failed` and `Cancelled` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Known locally, negotiation not started yet.
    Created,
    /// Offer/answer/candidate exchange in progress.
    Negotiating,
    /// The data channel for this transaction just opened.
    ChannelOpen,
    /// Bytes are moving.
    Transferring,
    /// All declared bytes were sent or received.
    Completed,
    /// Transport failure, overflow or lost peer.
    Failed,
    /// Cancelled by a local user or by the remote peer.
    Cancelled,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Completed | TransactionState::Failed | TransactionState::Cancelled
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Failed | Cancelled) => true,
            (Created, Negotiating) => true,
            (Negotiating, ChannelOpen) => true,
            (ChannelOpen, Transferring) => true,
            (Transferring, Completed) => true,
            _ => false,
        }
    }
}

// ── Roles ────────────────────────────────────────────────────────────────────

/// Which side of the offer/answer exchange this device plays.
///
/// The side that receives the proposal creates the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Which side of the byte stream this device plays once the channel opens.
///
/// Independent from [`NegotiationRole`]: the offerer is the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteRole {
    /// Holds the files and streams them.
    Source,
    /// Solicited the transfer and reassembles the stream.
    Sink,
}

// ── Files ────────────────────────────────────────────────────────────────────

/// A declared file as exchanged on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub media_type: String,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, size: u64, media_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            media_type: media_type.into(),
        }
    }
}

/// A local file offered by the source side.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub entry: FileEntry,
    pub path: PathBuf,
}

impl OutgoingFile {
    /// Build an outgoing file from disk metadata.
    ///
    /// The declared size is taken from the filesystem at proposal time.
    pub async fn from_path(path: PathBuf, media_type: impl Into<String>) -> anyhow::Result<Self> {
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            entry: FileEntry::new(name, meta.len(), media_type),
            path,
        })
    }
}

// ── Transaction ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: Uuid,
    pub state: TransactionState,
    pub negotiation: NegotiationRole,
    pub bytes: ByteRole,
    /// Remote participant.
    pub peer_id: String,
    /// Declared files, in stream order.
    pub files: Vec<FileEntry>,
    /// Local paths for the declared files (source side only).
    pub sources: Vec<PathBuf>,
    /// Sum of declared sizes, fixed at creation.
    total_bytes: u64,
    /// Bytes received so far (sink) or handed to the transport (source).
    received_bytes: u64,
    pub created_at: Instant,
    /// When the transaction reached a terminal state.
    pub finished_at: Option<Instant>,
    /// Why the transaction failed or was cancelled.
    pub reason: Option<String>,
}

/// Sum of declared sizes, `None` if it does not fit in a `u64`.
pub fn declared_total(files: &[FileEntry]) -> Option<u64> {
    files.iter().try_fold(0u64, |acc, f| acc.checked_add(f.size))
}

impl Transaction {
    /// Create the sink-side transaction for a proposal received from `peer_id`.
    ///
    /// Declared sizes come from the remote peer; a proposal whose total does
    /// not fit in a `u64` is refused.
    pub fn new_sink(id: Uuid, peer_id: String, files: Vec<FileEntry>) -> TransferResult<Self> {
        Self::new(id, peer_id, NegotiationRole::Offerer, ByteRole::Sink, files, Vec::new())
    }

    /// Create the source-side transaction for files we propose to `peer_id`.
    pub fn new_source(peer_id: String, files: Vec<OutgoingFile>) -> TransferResult<Self> {
        let (entries, paths): (Vec<FileEntry>, Vec<PathBuf>) =
            files.into_iter().map(|f| (f.entry, f.path)).unzip();
        Self::new(
            Uuid::new_v4(),
            peer_id,
            NegotiationRole::Answerer,
            ByteRole::Source,
            entries,
            paths,
        )
    }

    fn new(
        id: Uuid,
        peer_id: String,
        negotiation: NegotiationRole,
        bytes: ByteRole,
        files: Vec<FileEntry>,
        sources: Vec<PathBuf>,
    ) -> TransferResult<Self> {
        let Some(total_bytes) = declared_total(&files) else {
            return Err(TransferError::signaling(
                &peer_id,
                format!("declared file sizes of transaction {id} overflow"),
            ));
        };
        Ok(Self {
            id,
            state: TransactionState::Created,
            negotiation,
            bytes,
            peer_id,
            files,
            sources,
            total_bytes,
            received_bytes: 0,
            created_at: Instant::now(),
            finished_at: None,
            reason: None,
        })
    }

    /// Declared files paired with their local paths (source side).
    pub fn outgoing_files(&self) -> Vec<OutgoingFile> {
        self.files
            .iter()
            .cloned()
            .zip(self.sources.iter().cloned())
            .map(|(entry, path)| OutgoingFile { entry, path })
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Account for `n` more bytes, refusing to exceed `total_bytes`.
    pub fn add_received(&mut self, n: u64) -> TransferResult<u64> {
        let next = self.received_bytes.saturating_add(n);
        if next > self.total_bytes {
            return Err(TransferError::Overflow {
                transaction_id: self.id,
                received: next,
                total: self.total_bytes,
            });
        }
        self.received_bytes = next;
        Ok(next)
    }

    // ── State transitions ────────────────────────────────────────────────

    /// Move to `next` if the state machine allows it. Returns whether the
    /// state changed.
    pub fn transition(&mut self, next: TransactionState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Instant::now());
        }
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        let changed = self.transition(TransactionState::Failed);
        if changed {
            self.reason = Some(reason.into());
        }
        changed
    }

    pub fn cancel(&mut self, reason: Option<String>) -> bool {
        let changed = self.transition(TransactionState::Cancelled);
        if changed {
            self.reason = reason;
        }
        changed
    }

    pub fn is_source(&self) -> bool {
        self.bytes == ByteRole::Source
    }
}

// ── Transaction Manager ──────────────────────────────────────────────────────

/// Registry of live and finished transactions, keyed by id.
///
/// Finished transactions are kept for lookups up to
/// [`MAX_FINISHED_TRANSACTIONS`]; older ones are dropped.
#[derive(Debug, Default)]
pub struct TransactionManager {
    active: HashMap<Uuid, Transaction>,
    finished: HashMap<Uuid, Transaction>,
    finished_order: VecDeque<Uuid>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, txn: Transaction) {
        self.active.insert(txn.id, txn);
    }

    /// Get a transaction by ID (active or recently finished).
    pub fn get(&self, id: &Uuid) -> Option<&Transaction> {
        self.active.get(id).or_else(|| self.finished.get(id))
    }

    pub fn get_active_mut(&mut self, id: &Uuid) -> Option<&mut Transaction> {
        self.active.get_mut(id)
    }

    pub fn contains_active(&self, id: &Uuid) -> bool {
        self.active.contains_key(id)
    }

    /// Move a terminal transaction out of the active set.
    pub fn archive(&mut self, id: &Uuid) -> Option<&Transaction> {
        let txn = self.active.remove(id)?;
        if self.finished_order.len() >= MAX_FINISHED_TRANSACTIONS
            && let Some(oldest) = self.finished_order.pop_front()
        {
            self.finished.remove(&oldest);
        }
        self.finished_order.push_back(txn.id);
        self.finished.insert(txn.id, txn);
        self.finished.get(id)
    }

    /// Ids of non-terminal transactions with `peer_id`.
    pub fn active_for_peer(&self, peer_id: &str) -> Vec<Uuid> {
        self.active
            .values()
            .filter(|t| t.peer_id == peer_id && !t.state.is_terminal())
            .map(|t| t.id)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Finished transactions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Transaction> {
        self.finished_order.iter().filter_map(|id| self.finished.get(id))
    }
}
