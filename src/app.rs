//! Demo binary plumbing: arguments and the two-peer in-process run.
//!
//! Both peers live in this process and talk through a [`LocalRelay`]; the
//! bytes go over the chosen transport. The receiving side writes what it
//! gets to `--out-dir`.

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use directdrop::core::config::EngineConfig;
use directdrop::core::connection::TransportConnector;
use directdrop::core::connection::memory::MemoryNetwork;
use directdrop::core::connection::webrtc::WebRtcConnector;
use directdrop::core::engine::{TransferEngine, TransferEvent};
use directdrop::core::pipeline::receiver::DeliveredPayload;
use directdrop::core::signaling::LocalRelay;
use directdrop::core::throughput::SpeedReading;
use directdrop::core::transaction::{OutgoingFile, TransactionState};
use directdrop::utils::atomic_write::{atomic_write, sanitize_file_name};
use directdrop::utils::sos::SignalOfStop;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const SENDER_ID: &str = "sender";
const RECEIVER_ID: &str = "receiver";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process transport, no network involved.
    #[default]
    Memory,
    /// Real WebRTC data channels over loopback / ICE.
    Webrtc,
}

#[derive(Parser, Deserialize, Clone, Debug)]
#[command(author, version, about = "directdrop - direct peer-to-peer file transfer")]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// Path to a config file (TOML)
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Files to send, in order.
    pub files: Vec<PathBuf>,

    /// Directory the receiving peer writes delivered files to.
    #[clap(long, default_value = "received")]
    pub out_dir: PathBuf,

    #[clap(long, value_enum, default_value_t = TransportKind::Memory)]
    pub transport: TransportKind,

    /// Write multi-file transfers back as separate files instead of one
    /// combined payload.
    #[clap(long)]
    pub split: bool,

    /// Disable the idle-mode liveness probe.
    #[clap(long)]
    pub no_probe: bool,

    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Engine settings; only read from the config file.
    #[clap(skip)]
    pub engine: EngineConfig,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            files: Vec::new(),
            out_dir: PathBuf::from("received"),
            transport: TransportKind::Memory,
            split: false,
            no_probe: false,
            verbose: 0,
            engine: EngineConfig::default(),
        }
    }
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let cli_args = Args::parse();

        if let Some(config_path) = &cli_args.config
            && let Some(file_args) = Self::from_file(config_path)
        {
            return Self::merge(file_args, cli_args);
        }

        let default_path = PathBuf::from("directdrop.toml");
        if let Some(file_args) = Self::from_file(&default_path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str::<Args>(&content) {
            Ok(args) => Some(args),
            Err(e) => {
                eprintln!("ignoring config file {}: {e}", path.display());
                None
            }
        }
    }

    fn merge(mut file: Args, cli: Args) -> Args {
        let defaults = Args::default();
        if cli.config.is_some() {
            file.config = cli.config;
        }
        if !cli.files.is_empty() {
            file.files = cli.files;
        }
        if cli.out_dir != defaults.out_dir {
            file.out_dir = cli.out_dir;
        }
        if cli.transport != defaults.transport {
            file.transport = cli.transport;
        }
        if cli.split {
            file.split = true;
        }
        if cli.no_probe {
            file.no_probe = true;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        file
    }

    fn engine_config(&self) -> EngineConfig {
        let mut config = self.engine.clone();
        if self.no_probe {
            config.liveness_url = None;
        }
        config
    }
}

/// Write a delivered payload under `out_dir`. Returns the written paths.
pub fn write_payload(out_dir: &Path, payload: &DeliveredPayload, split: bool) -> Result<Vec<PathBuf>> {
    if split && payload.is_combined() {
        return payload
            .split_files()
            .into_iter()
            .map(|(entry, data)| {
                let path = out_dir.join(sanitize_file_name(&entry.name));
                atomic_write(&path, &data)?;
                Ok(path)
            })
            .collect();
    }
    let path = out_dir.join(sanitize_file_name(&payload.name));
    atomic_write(&path, &payload.data)?;
    Ok(vec![path])
}

fn format_speed(reading: SpeedReading) -> String {
    let mbps = |bps: f64| bps * 8.0 / 1_000_000.0;
    match reading {
        SpeedReading::Active(bps) => format!("{:.1} Mbit/s", mbps(bps)),
        SpeedReading::Idle(bps) => format!("~{:.0} Mbit/s (idle estimate)", mbps(bps)),
        SpeedReading::Unknown => "unknown".to_string(),
    }
}

/// Send `args.files` from one in-process peer to another.
pub async fn run(args: Args, sos: SignalOfStop) -> Result<()> {
    if args.files.is_empty() {
        bail!("no files to send");
    }

    let connector: Arc<dyn TransportConnector> = match args.transport {
        TransportKind::Memory => Arc::new(MemoryNetwork::new()),
        TransportKind::Webrtc => Arc::new(WebRtcConnector::new()),
    };
    let config = args.engine_config();
    let relay = LocalRelay::new();

    let (sender_tx, mut sender_rx) = mpsc::unbounded_channel();
    let (receiver_tx, mut receiver_rx) = mpsc::unbounded_channel();
    let (sender, sender_task) = TransferEngine::start(
        &config,
        relay.client(SENDER_ID),
        connector.clone(),
        Some(sender_tx),
        sos.clone(),
    );
    let (receiver, receiver_task) = TransferEngine::start(
        &config,
        relay.client(RECEIVER_ID),
        connector,
        Some(receiver_tx),
        sos.clone(),
    );

    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let file = OutgoingFile::from_path(path.clone(), "application/octet-stream")
            .await
            .with_context(|| format!("cannot send {}", path.display()))?;
        files.push(file);
    }

    let id = sender.propose_transfer(RECEIVER_ID, files).await?;
    info!(event = "demo_started", transaction_id = %id, transport = ?args.transport, "Transfer proposed");

    let mut speed = sender.throughput().subscribe();
    let mut written = Vec::new();
    let outcome = loop {
        tokio::select! {
            _ = sos.wait() => {
                warn!(event = "demo_interrupted", "Interrupted, cancelling transfer");
                let _ = sender.cancel(id).await;
                break TransactionState::Cancelled;
            }
            Some(ev) = receiver_rx.recv() => match ev {
                TransferEvent::Progress { received, total, .. } => {
                    debug!(event = "demo_progress", received, total, "Receiving");
                }
                TransferEvent::Delivered(payload) => {
                    written.extend(write_payload(&args.out_dir, &payload, args.split)?);
                }
                TransferEvent::StateChanged { transaction_id, state, .. }
                    if transaction_id == id && state.is_terminal() =>
                {
                    break state;
                }
                _ => {}
            },
            Some(ev) = sender_rx.recv() => {
                if let TransferEvent::SendFinished { report, .. } = ev {
                    info!(event = "demo_sent", bytes = report.bytes_sent, chunks = report.chunks_sent, "Sender finished");
                }
            }
            Ok(()) = speed.changed() => {
                debug!(event = "demo_speed", speed = %format_speed(*speed.borrow()), "Throughput");
            }
        }
    };

    sender.shutdown();
    receiver.shutdown();
    let _ = tokio::join!(sender_task, receiver_task);

    match outcome {
        TransactionState::Completed => {
            for path in &written {
                println!("{}", path.display());
            }
            Ok(())
        }
        other => bail!("transfer ended {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use directdrop::core::transaction::FileEntry;
    use uuid::Uuid;

    #[test]
    fn test_cli_overrides_file() {
        let file: Args = toml::from_str(
            r#"
            out_dir = "from-file"
            transport = "webrtc"
            verbose = 1

            [engine]
            liveness_url = "http://127.0.0.1:9/ping"
            "#,
        )
        .unwrap();
        assert_eq!(file.engine.liveness_url.as_deref(), Some("http://127.0.0.1:9/ping"));
        assert!(!file.engine.ice_servers.is_empty());

        let cli = Args::parse_from(["directdrop", "--no-probe", "a.bin"]);
        let merged = Args::merge(file, cli);
        assert_eq!(merged.out_dir, PathBuf::from("from-file"));
        assert_eq!(merged.transport, TransportKind::Webrtc);
        assert_eq!(merged.files, vec![PathBuf::from("a.bin")]);
        assert_eq!(merged.verbose, 1);
        assert_eq!(merged.engine_config().liveness_url, None);
    }

    #[test]
    fn test_write_payload_combined_and_split() {
        let dir = std::env::temp_dir().join("directdrop_test").join("app").join("write");
        let _ = std::fs::remove_dir_all(&dir);
        let payload = DeliveredPayload {
            transaction_id: Uuid::nil(),
            name: format!("transfer-{}.bin", Uuid::nil()),
            data: Bytes::from_static(b"abcdef"),
            manifest: vec![FileEntry::new("../x.txt", 2, ""), FileEntry::new("y.txt", 4, "")],
        };

        let combined = write_payload(&dir, &payload, false).unwrap();
        assert_eq!(combined.len(), 1);
        assert_eq!(std::fs::read(&combined[0]).unwrap(), b"abcdef");

        let split = write_payload(&dir, &payload, true).unwrap();
        assert_eq!(split, vec![dir.join("x.txt"), dir.join("y.txt")]);
        assert_eq!(std::fs::read(dir.join("x.txt")).unwrap(), b"ab");
        assert_eq!(std::fs::read(dir.join("y.txt")).unwrap(), b"cdef");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
