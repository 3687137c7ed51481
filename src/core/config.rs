//! Centralized configuration for directdrop.
//!
//! Compile-time tunables live here as constants so they can be reviewed in a
//! single place. Runtime knobs that embedders may want to change (ICE servers,
//! liveness endpoint) are grouped in [`EngineConfig`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Size of one transport message carrying file bytes (16 KiB).
///
/// The last chunk of a file may be shorter.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Buffered-but-unsent bytes above which the sender stops issuing chunks.
pub const BACKPRESSURE_THRESHOLD: usize = 10 * CHUNK_SIZE;

/// Delay between two buffered-amount checks while backpressure is applied.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Name used when a multi-file transfer is delivered as one combined payload.
pub const COMBINED_PAYLOAD_PREFIX: &str = "transfer";

/// Finished transactions kept for lookups; the oldest are dropped first.
pub const MAX_FINISHED_TRANSACTIONS: usize = 256;

// ── Throughput estimation ────────────────────────────────────────────────────

/// Rolling window of samples kept by the active-mode estimator.
pub const THROUGHPUT_WINDOW: Duration = Duration::from_millis(2000);

/// Weight of the newest measurement in the exponential moving average.
pub const SPEED_EMA_ALPHA: f64 = 0.3;

/// How often the smoothed speed is published while transferring.
pub const SPEED_DISPLAY_INTERVAL: Duration = Duration::from_millis(100);

/// How often the idle-mode latency probe runs.
pub const IDLE_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Timeout applied to a single idle-mode probe request.
pub const IDLE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before falling back to idle mode once a transfer stops.
pub const IDLE_GRACE_DELAY: Duration = Duration::from_millis(1000);

/// Multiplicative jitter applied to idle-mode estimates (±10 %).
pub const IDLE_JITTER: f64 = 0.1;

/// Latency → bandwidth buckets (upper latency bound in ms, Mbit/s).
/// Latencies at or above the last bound map to [`IDLE_FLOOR_MBPS`].
pub const IDLE_LATENCY_BUCKETS: [(u64, u64); 5] = [(5, 100), (10, 50), (20, 25), (50, 10), (100, 5)];

/// Bandwidth reported for very slow liveness round trips.
pub const IDLE_FLOOR_MBPS: u64 = 1;

// ── Connection / Network ─────────────────────────────────────────────────────

/// Default liveness endpoint probed in idle mode.
pub const DEFAULT_LIVENESS_URL: &str = "https://www.google.com/generate_204";

/// A STUN/TURN helper server handed to the negotiation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Public helper servers used when nothing else is configured.
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            username: String::new(),
            credential: String::new(),
        },
        IceServer {
            urls: vec!["turn:openrelay.metered.ca:80".into()],
            username: "openrelayproject".into(),
            credential: "openrelayproject".into(),
        },
    ]
}

// ── Runtime configuration ────────────────────────────────────────────────────

/// Runtime configuration for a [`TransferEngine`](crate::core::engine::TransferEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// ICE helper servers for every new peer connection.
    pub ice_servers: Vec<IceServer>,
    /// Endpoint probed by the idle-mode estimator. `None` disables probing.
    pub liveness_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            liveness_url: Some(DEFAULT_LIVENESS_URL.to_string()),
        }
    }
}
