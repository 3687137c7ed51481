//! Receiver-side reassembly.
//!
//! Chunks are appended in arrival order; the transport is ordered, so there
//! is no resequencing and no duplicate detection. A transaction finalizes
//! exactly once, when its received byte count reaches the declared total.
//! Finalizing removes its buffer, so a late chunk is reported as belonging
//! to an unknown transaction.

use crate::core::config::COMBINED_PAYLOAD_PREFIX;
use crate::core::error::{TransferError, TransferResult};
use crate::core::throughput::ThroughputMonitor;
use crate::core::transaction::{FileEntry, Transaction};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// A fully received transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredPayload {
    pub transaction_id: Uuid,
    /// The single declared file's name, or `transfer-<id>.bin` for several.
    pub name: String,
    pub data: Bytes,
    /// Declared files, in send order.
    pub manifest: Vec<FileEntry>,
}

impl DeliveredPayload {
    pub fn is_combined(&self) -> bool {
        self.manifest.len() != 1
    }

    /// Cut the payload back into the declared files by their sizes.
    ///
    /// Files are sent back-to-back, so the declared sizes are the only
    /// boundaries. Sizes past the end of the data yield truncated slices.
    pub fn split_files(&self) -> Vec<(FileEntry, Bytes)> {
        let mut offset = 0usize;
        self.manifest
            .iter()
            .map(|entry| {
                let start = offset.min(self.data.len());
                let end = start.saturating_add(entry.size as usize).min(self.data.len());
                offset = end;
                (entry.clone(), self.data.slice(start..end))
            })
            .collect()
    }
}

/// Result of feeding one chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    Progress { received: u64, total: u64 },
    Completed(DeliveredPayload),
}

struct Buffer {
    chunks: Vec<Bytes>,
    files: Vec<FileEntry>,
}

pub struct Reassembler {
    buffers: HashMap<Uuid, Buffer>,
    throughput: ThroughputMonitor,
}

impl Reassembler {
    pub fn new(throughput: ThroughputMonitor) -> Self {
        Self {
            buffers: HashMap::new(),
            throughput,
        }
    }

    pub fn is_registered(&self, id: &Uuid) -> bool {
        self.buffers.contains_key(id)
    }

    /// Start collecting chunks for `txn`. A transaction that declares zero
    /// bytes is delivered right away.
    pub fn register(&mut self, txn: &Transaction) -> Option<DeliveredPayload> {
        if txn.total_bytes() == 0 {
            info!(event = "reassembly_empty", transaction_id = %txn.id, "Zero-byte transfer completed on open");
            return Some(build_payload(txn.id, Vec::new(), txn.files.clone(), 0));
        }
        self.buffers.insert(
            txn.id,
            Buffer {
                chunks: Vec::new(),
                files: txn.files.clone(),
            },
        );
        None
    }

    /// Feed one inbound chunk for `txn`.
    ///
    /// A chunk that would push the received count past the declared total is
    /// rejected and the buffer dropped.
    pub fn on_chunk(&mut self, txn: &mut Transaction, data: Bytes) -> TransferResult<ChunkOutcome> {
        if !self.buffers.contains_key(&txn.id) {
            return Err(TransferError::UnknownTransaction(txn.id));
        }
        self.throughput.record(data.len() as u64);

        let received = match txn.add_received(data.len() as u64) {
            Ok(r) => r,
            Err(e) => {
                self.buffers.remove(&txn.id);
                return Err(e);
            }
        };
        let total = txn.total_bytes();

        if received < total {
            if let Some(buf) = self.buffers.get_mut(&txn.id) {
                buf.chunks.push(data);
            }
            return Ok(ChunkOutcome::Progress { received, total });
        }

        let Some(mut buf) = self.buffers.remove(&txn.id) else {
            return Err(TransferError::UnknownTransaction(txn.id));
        };
        buf.chunks.push(data);
        debug!(event = "reassembly_complete", transaction_id = %txn.id, chunks = buf.chunks.len(), bytes = total, "All bytes received");
        Ok(ChunkOutcome::Completed(build_payload(txn.id, buf.chunks, buf.files, total)))
    }

    /// Drop the buffer of `id`. Returns whether one existed.
    pub fn abort(&mut self, id: &Uuid) -> bool {
        self.buffers.remove(id).is_some()
    }
}

fn build_payload(id: Uuid, chunks: Vec<Bytes>, files: Vec<FileEntry>, total: u64) -> DeliveredPayload {
    let data = if chunks.len() == 1 {
        chunks.into_iter().next().unwrap_or_default()
    } else {
        let mut out = BytesMut::with_capacity(total as usize);
        for chunk in &chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    };
    let name = match files.as_slice() {
        [single] => single.name.clone(),
        _ => format!("{COMBINED_PAYLOAD_PREFIX}-{id}.bin"),
    };
    DeliveredPayload {
        transaction_id: id,
        name,
        data,
        manifest: files,
    }
}
