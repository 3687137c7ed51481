//! Error taxonomy of the transfer core.
//!
//! None of these errors is surfaced to remote peers. The orchestrator logs
//! them as structured diagnostics and, where a transaction is affected,
//! reflects the outcome in its state.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced while negotiating or moving bytes.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Malformed or out-of-context inbound signal. Dropped without touching
    /// any transaction.
    #[error("signaling error from {peer_id}: {reason}")]
    Signaling { peer_id: String, reason: String },

    /// Applying or producing a session description or candidate failed.
    /// The transaction stays in `Negotiating`.
    #[error("negotiation with {peer_id} failed: {reason}")]
    Negotiation { peer_id: String, reason: String },

    /// A chunk could not be handed to the transport; remaining sends are aborted.
    #[error("transport error on transaction {transaction_id}: {reason}")]
    Transport { transaction_id: Uuid, reason: String },

    /// The direct connection to a peer was lost or failed.
    #[error("peer {peer_id} disconnected")]
    PeerDisconnect { peer_id: String },

    /// More bytes arrived than the transaction declared.
    #[error("transaction {transaction_id} overflow: {received} bytes received, {total} declared")]
    Overflow {
        transaction_id: Uuid,
        received: u64,
        total: u64,
    },

    /// An event or command named a transaction that is not live.
    #[error("unknown transaction {0}")]
    UnknownTransaction(Uuid),
}

impl TransferError {
    pub fn signaling(peer_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Signaling {
            peer_id: peer_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn negotiation(peer_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Negotiation {
            peer_id: peer_id.into(),
            reason: reason.to_string(),
        }
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
