//! Sender pipeline: slices outbound files into fixed-size chunks and pushes
//! them onto a data channel with backpressure.
//!
//! Files are sent sequentially and back-to-back, with no delimiter. Before
//! every chunk the channel's buffered amount is checked; while it exceeds
//! [`BACKPRESSURE_THRESHOLD`] the loop sleeps [`BACKPRESSURE_POLL_INTERVAL`]
//! and checks again. There is no cap on the total wait: the loop only gives
//! up when the channel closes.
//!
//! Each file must still have the size declared in the proposal; the sink
//! counts bytes against that declaration. After the last chunk the loop waits
//! for the channel buffer to empty, so the caller may close the channel once
//! the report comes back.

use crate::core::config::{BACKPRESSURE_POLL_INTERVAL, BACKPRESSURE_THRESHOLD, CHUNK_SIZE};
use crate::core::connection::DataChannel;
use crate::core::error::{TransferError, TransferResult};
use crate::core::throughput::ThroughputMonitor;
use crate::core::transaction::OutgoingFile;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a finished send loop accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub bytes_sent: u64,
    pub chunks_sent: u64,
}

/// Zero-copy split of `data` into [`CHUNK_SIZE`] pieces; the last may be shorter.
pub fn chunk_slices(data: &Bytes) -> impl Iterator<Item = Bytes> + '_ {
    (0..data.len())
        .step_by(CHUNK_SIZE)
        .map(move |start| data.slice(start..(start + CHUNK_SIZE).min(data.len())))
}

/// Wait until the channel has room for another chunk.
async fn wait_for_buffer_space(channel: &dyn DataChannel, transaction_id: Uuid) -> TransferResult<()> {
    let mut logged = false;
    loop {
        if !channel.is_open() {
            return Err(TransferError::Transport {
                transaction_id,
                reason: format!("data channel '{}' closed during backpressure wait", channel.label()),
            });
        }
        let buffered = channel.buffered_amount().await;
        if buffered <= BACKPRESSURE_THRESHOLD {
            return Ok(());
        }
        if !logged {
            debug!(
                event = "backpressure",
                channel = %channel.label(),
                buffered,
                high_watermark = BACKPRESSURE_THRESHOLD,
                "Applying backpressure - waiting for buffer to drain"
            );
            logged = true;
        }
        tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL).await;
    }
}

/// Wait until everything handed to the channel has left the local buffer.
async fn flush(channel: &dyn DataChannel, transaction_id: Uuid) -> TransferResult<()> {
    loop {
        if !channel.is_open() {
            return Err(TransferError::Transport {
                transaction_id,
                reason: format!("data channel '{}' closed before the buffer drained", channel.label()),
            });
        }
        if channel.buffered_amount().await == 0 {
            return Ok(());
        }
        tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL).await;
    }
}

/// Send every file in `files`, in order, over `channel`.
///
/// A read or send failure aborts the remaining chunks and files. Bytes that
/// were already sent are not retried. A file whose size on disk no longer
/// matches its declared size is refused before any of its bytes go out.
pub async fn send_files(
    transaction_id: Uuid,
    channel: Arc<dyn DataChannel>,
    files: Vec<OutgoingFile>,
    throughput: ThroughputMonitor,
) -> TransferResult<SendReport> {
    let mut report = SendReport::default();

    for file in files {
        let path = &file.path;
        let data = Bytes::from(tokio::fs::read(path).await.map_err(|e| TransferError::Transport {
            transaction_id,
            reason: format!("read {}: {e}", path.display()),
        })?);
        if data.len() as u64 != file.entry.size {
            warn!(event = "file_size_changed", transaction_id = %transaction_id, path = %path.display(), declared = file.entry.size, actual = data.len(), "File changed since it was proposed");
            return Err(TransferError::Transport {
                transaction_id,
                reason: format!(
                    "{} is {} bytes, {} were declared",
                    path.display(),
                    data.len(),
                    file.entry.size
                ),
            });
        }
        debug!(event = "file_send_start", transaction_id = %transaction_id, path = %path.display(), size = data.len(), "Sending file");

        for chunk in chunk_slices(&data) {
            wait_for_buffer_space(channel.as_ref(), transaction_id).await?;

            let len = chunk.len() as u64;
            if let Err(e) = channel.send(chunk).await {
                warn!(event = "chunk_send_failure", transaction_id = %transaction_id, chunks_sent = report.chunks_sent, error = %e, "Chunk send failed, aborting");
                return Err(TransferError::Transport {
                    transaction_id,
                    reason: format!("{e:#}"),
                });
            }
            throughput.record(len);
            report.bytes_sent += len;
            report.chunks_sent += 1;
        }
    }
    flush(channel.as_ref(), transaction_id).await?;

    info!(
        event = "send_complete",
        transaction_id = %transaction_id,
        bytes = report.bytes_sent,
        chunks = report.chunks_sent,
        "All files handed to the transport"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::FileEntry;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("directdrop_test")
            .join("sender")
            .join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn cleanup(path: &Path) {
        let _ = std::fs::remove_dir_all(path);
    }

    /// Declare `path` with its current size on disk.
    fn outgoing(path: &Path) -> OutgoingFile {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        declared(path, size)
    }

    fn declared(path: &Path, size: u64) -> OutgoingFile {
        OutgoingFile {
            entry: FileEntry::new("f", size, ""),
            path: path.to_path_buf(),
        }
    }

    /// Channel whose buffer fills on send and drains a fixed amount per poll.
    struct SlowChannel {
        buffered: AtomicUsize,
        drain_per_poll: usize,
        open: AtomicBool,
        fail_after: Option<usize>,
        last_polled: AtomicUsize,
        sent: Mutex<Vec<Bytes>>,
        polled_at_send: Mutex<Vec<usize>>,
    }

    impl SlowChannel {
        fn new(initial: usize, drain_per_poll: usize) -> Self {
            Self {
                buffered: AtomicUsize::new(initial),
                drain_per_poll,
                open: AtomicBool::new(true),
                fail_after: None,
                last_polled: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                polled_at_send: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DataChannel for SlowChannel {
        fn label(&self) -> &str {
            "slow"
        }

        async fn buffered_amount(&self) -> usize {
            let now = self.buffered.load(Ordering::SeqCst);
            self.last_polled.store(now, Ordering::SeqCst);
            let next = now.saturating_sub(self.drain_per_poll);
            self.buffered.store(next, Ordering::SeqCst);
            now
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send(&self, data: Bytes) -> anyhow::Result<()> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_after.is_some_and(|n| sent.len() >= n) {
                return Err(anyhow!("sctp association lost"));
            }
            self.polled_at_send
                .lock()
                .unwrap()
                .push(self.last_polled.load(Ordering::SeqCst));
            self.buffered.fetch_add(data.len(), Ordering::SeqCst);
            sent.push(data);
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_chunk_slices_sizes() {
        let data = Bytes::from(vec![7u8; CHUNK_SIZE + 7232]);
        let sizes: Vec<usize> = chunk_slices(&data).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![CHUNK_SIZE, 7232]);
        assert_eq!(chunk_slices(&Bytes::new()).count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_holds_until_drained() {
        let dir = test_dir("backpressure");
        let path = dir.join("big.bin");
        let data: Vec<u8> = (0..CHUNK_SIZE * 24).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        // Start over the watermark; drain one chunk per poll.
        let channel = Arc::new(SlowChannel::new(BACKPRESSURE_THRESHOLD + 1, CHUNK_SIZE));
        let started = tokio::time::Instant::now();
        let report = send_files(
            Uuid::new_v4(),
            channel.clone(),
            vec![outgoing(&path)],
            ThroughputMonitor::new(None),
        )
        .await
        .unwrap();

        assert_eq!(report.chunks_sent, 24);
        assert_eq!(report.bytes_sent, data.len() as u64);
        assert!(started.elapsed() >= BACKPRESSURE_POLL_INTERVAL);
        for polled in channel.polled_at_send.lock().unwrap().iter() {
            assert!(*polled <= BACKPRESSURE_THRESHOLD);
        }
        let joined: Vec<u8> = channel
            .sent
            .lock()
            .unwrap()
            .iter()
            .flat_map(|c| c.to_vec())
            .collect();
        assert_eq!(joined, data);
        // Returned only once the buffer was empty.
        assert_eq!(channel.buffered.load(Ordering::SeqCst), 0);

        cleanup(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_aborts_backpressure_wait() {
        let dir = test_dir("closed_wait");
        let path = dir.join("f.bin");
        std::fs::write(&path, vec![1u8; CHUNK_SIZE]).unwrap();

        let channel = Arc::new(SlowChannel::new(usize::MAX / 2, 0));
        let closer = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            closer.open.store(false, Ordering::SeqCst);
        });

        let err = send_files(Uuid::new_v4(), channel.clone(), vec![outgoing(&path)], ThroughputMonitor::new(None))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Transport { .. }));
        assert!(channel.sent.lock().unwrap().is_empty());

        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_send_failure_aborts_remaining_files() {
        let dir = test_dir("send_failure");
        let first = dir.join("a.bin");
        let second = dir.join("b.bin");
        std::fs::write(&first, vec![1u8; CHUNK_SIZE * 3]).unwrap();
        std::fs::write(&second, vec![2u8; CHUNK_SIZE]).unwrap();

        let mut channel = SlowChannel::new(0, usize::MAX);
        channel.fail_after = Some(2);
        let channel = Arc::new(channel);
        let err = send_files(
            Uuid::new_v4(),
            channel.clone(),
            vec![outgoing(&first), outgoing(&second)],
            ThroughputMonitor::new(None),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::Transport { .. }));
        assert_eq!(channel.sent.lock().unwrap().len(), 2);

        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_missing_file_is_a_transport_error() {
        let channel = Arc::new(SlowChannel::new(0, 0));
        let err = send_files(
            Uuid::new_v4(),
            channel,
            vec![declared(&test_dir("missing").join("nope.bin"), 10)],
            ThroughputMonitor::new(None),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_file_changed_since_proposal_is_refused() {
        let dir = test_dir("size_changed");
        let first = dir.join("a.bin");
        let second = dir.join("b.bin");
        std::fs::write(&first, vec![1u8; CHUNK_SIZE]).unwrap();
        std::fs::write(&second, vec![2u8; 100]).unwrap();

        // Second file declared at 40000 bytes, now 100 on disk.
        let channel = Arc::new(SlowChannel::new(0, usize::MAX));
        let err = send_files(
            Uuid::new_v4(),
            channel.clone(),
            vec![outgoing(&first), declared(&second, 40000)],
            ThroughputMonitor::new(None),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::Transport { .. }));
        assert_eq!(channel.sent.lock().unwrap().len(), 1);

        // Grown files are refused too.
        let channel = Arc::new(SlowChannel::new(0, usize::MAX));
        let err = send_files(Uuid::new_v4(), channel.clone(), vec![declared(&first, 10)], ThroughputMonitor::new(None))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Transport { .. }));
        assert!(channel.sent.lock().unwrap().is_empty());

        cleanup(&dir);
    }
}
