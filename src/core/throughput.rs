//! Throughput estimation.
//!
//! Two mutually exclusive modes, selected by whether any transfer is running:
//!
//! - **Active**: every byte event is recorded as a `(timestamp, bytes)` sample
//!   in a 2 s rolling window. The instantaneous speed is
//!   `sum(bytes) / (now - earliest) * 1000` and is smoothed with an EMA that
//!   is refreshed on a fixed display tick.
//! - **Idle**: a liveness endpoint is probed periodically and the round-trip
//!   latency is mapped onto a coarse bandwidth bucket.
//!
//! [`ThroughputEstimator`] is the pure, clock-injected core. [`ThroughputMonitor`]
//! is the shared handle used by the orchestrator and sender tasks; it owns the
//! mode switch and publishes [`SpeedReading`]s on a `watch` channel.

use crate::core::config::{
    IDLE_FLOOR_MBPS, IDLE_GRACE_DELAY, IDLE_JITTER, IDLE_LATENCY_BUCKETS, IDLE_PROBE_INTERVAL,
    IDLE_PROBE_TIMEOUT, SPEED_DISPLAY_INTERVAL, SPEED_EMA_ALPHA, THROUGHPUT_WINDOW,
};
use crate::utils::sos::SignalOfStop;
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

// ── Readings ──────────────────────────────────────────────────────────────────

/// What the estimator currently reports, in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeedReading {
    /// Smoothed speed measured from real transfer bytes.
    Active(f64),
    /// Coarse estimate derived from liveness latency.
    Idle(f64),
    /// The last idle probe failed.
    Unknown,
}

// ── Active-mode estimator ─────────────────────────────────────────────────────

/// Rolling-window speed estimator with explicit timestamps.
#[derive(Debug, Default)]
pub struct ThroughputEstimator {
    samples: BTreeMap<Instant, u64>,
    current: f64,
    smoothed: Option<f64>,
}

impl ThroughputEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every sample and forget the smoothed value.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.current = 0.0;
        self.smoothed = None;
    }

    /// Record `bytes` observed at `at` and recompute the current speed.
    ///
    /// Samples sharing a timestamp are merged.
    pub fn record_at(&mut self, at: Instant, bytes: u64) -> f64 {
        *self.samples.entry(at).or_insert(0) += bytes;

        if let Some(cutoff) = at.checked_sub(THROUGHPUT_WINDOW) {
            self.samples = self.samples.split_off(&cutoff);
        }

        self.current = self.compute_current(at);
        self.current
    }

    fn compute_current(&self, now: Instant) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let Some(earliest) = self.samples.keys().next() else {
            return 0.0;
        };
        let elapsed_ms = now.saturating_duration_since(*earliest).as_secs_f64() * 1000.0;
        if elapsed_ms <= 0.0 {
            return 0.0;
        }
        let total: u64 = self.samples.values().sum();
        total as f64 / elapsed_ms * 1000.0
    }

    /// Advance the EMA by one display tick and return the smoothed speed.
    pub fn refresh(&mut self) -> f64 {
        let next = match self.smoothed {
            None => self.current,
            Some(prev) => SPEED_EMA_ALPHA * self.current + (1.0 - SPEED_EMA_ALPHA) * prev,
        };
        self.smoothed = Some(next);
        next
    }

    pub fn current_speed(&self) -> f64 {
        self.current
    }

    pub fn smoothed_speed(&self) -> f64 {
        self.smoothed.unwrap_or(0.0)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

// ── Idle-mode estimate ────────────────────────────────────────────────────────

/// Map a liveness round trip onto a bandwidth bucket in Mbit/s.
pub fn bandwidth_bucket_mbps(latency: Duration) -> u64 {
    let ms = latency.as_millis() as u64;
    IDLE_LATENCY_BUCKETS
        .iter()
        .find(|(bound, _)| ms < *bound)
        .map(|(_, mbps)| *mbps)
        .unwrap_or(IDLE_FLOOR_MBPS)
}

/// Bytes/s estimate for `latency`, with ±10 % multiplicative jitter.
pub fn idle_estimate<R: Rng>(latency: Duration, rng: &mut R) -> f64 {
    let bytes_per_sec = bandwidth_bucket_mbps(latency) as f64 * 1_000_000.0 / 8.0;
    bytes_per_sec * rng.gen_range((1.0 - IDLE_JITTER)..=(1.0 + IDLE_JITTER))
}

/// Measures the round trip of a lightweight liveness request.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn round_trip(&self) -> Result<Duration>;
}

/// HTTP `HEAD` probe against a liveness endpoint.
pub struct HttpLatencyProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpLatencyProbe {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(IDLE_PROBE_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl LatencyProbe for HttpLatencyProbe {
    async fn round_trip(&self) -> Result<Duration> {
        let started = Instant::now();
        self.client
            .head(&self.url)
            .send()
            .await?
            .error_for_status()?;
        Ok(started.elapsed())
    }
}

// ── Monitor ───────────────────────────────────────────────────────────────────

struct MonitorState {
    estimator: ThroughputEstimator,
    is_transferring: bool,
    /// Transfers currently feeding the estimator, with their peer.
    active: HashMap<Uuid, String>,
    /// When the pending switch back to idle mode fires.
    idle_at: Option<Instant>,
}

/// Shared handle over the estimator and the published reading.
#[derive(Clone)]
pub struct ThroughputMonitor {
    state: Arc<Mutex<MonitorState>>,
    reading_tx: Arc<watch::Sender<SpeedReading>>,
    probe: Option<Arc<dyn LatencyProbe>>,
}

impl ThroughputMonitor {
    pub fn new(probe: Option<Arc<dyn LatencyProbe>>) -> Self {
        let (reading_tx, _) = watch::channel(SpeedReading::Unknown);
        Self {
            state: Arc::new(Mutex::new(MonitorState {
                estimator: ThroughputEstimator::new(),
                is_transferring: false,
                active: HashMap::new(),
                idle_at: None,
            })),
            reading_tx: Arc::new(reading_tx),
            probe,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SpeedReading> {
        self.reading_tx.subscribe()
    }

    pub fn reading(&self) -> SpeedReading {
        *self.reading_tx.borrow()
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        // A poisoned lock only means a panicking holder; the numbers are still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_transferring(&self) -> bool {
        self.lock().is_transferring
    }

    /// Switch to active mode for `transaction_id`.
    ///
    /// Unless another transfer is still feeding the estimator, all rolling
    /// state is reset, including during the grace delay after a previous
    /// transfer.
    pub fn start(&self, transaction_id: Uuid, peer_id: &str) {
        let mut st = self.lock();
        st.idle_at = None;
        if st.active.is_empty() {
            st.estimator.reset();
        }
        if !st.is_transferring {
            st.is_transferring = true;
            debug!(event = "throughput_active", transaction_id = %transaction_id, "Throughput estimator switched to active mode");
        }
        st.active.insert(transaction_id, peer_id.to_string());
    }

    /// Samples currently inside the window.
    pub fn sample_count(&self) -> usize {
        self.lock().estimator.sample_count()
    }

    /// Unsmoothed rate over the window, bytes per second.
    pub fn current_speed(&self) -> f64 {
        self.lock().estimator.current_speed()
    }

    /// Stop tracking `transaction_id`; idle mode resumes after the grace delay
    /// once nothing is transferring.
    pub fn stop(&self, transaction_id: Uuid) {
        self.stop_where(now(), |id, _| *id == transaction_id);
    }

    /// Stop tracking every transfer with `peer_id`.
    pub fn stop_peer(&self, peer_id: &str) {
        self.stop_where(now(), |_, p| p == peer_id);
    }

    fn stop_where(&self, at: Instant, matches: impl Fn(&Uuid, &String) -> bool) {
        let mut st = self.lock();
        st.active.retain(|id, peer| !matches(id, peer));
        if st.is_transferring && st.active.is_empty() && st.idle_at.is_none() {
            st.idle_at = Some(at + IDLE_GRACE_DELAY);
        }
    }

    /// Record a byte event. Ignored while idle.
    pub fn record(&self, bytes: u64) {
        self.record_at(now(), bytes);
    }

    pub fn record_at(&self, at: Instant, bytes: u64) {
        let mut st = self.lock();
        if st.is_transferring {
            st.estimator.record_at(at, bytes);
        }
    }

    /// Apply a pending idle switch whose grace delay elapsed before `at`.
    /// Returns whether the monitor is transferring afterwards.
    pub fn poll_mode(&self, at: Instant) -> bool {
        let mut st = self.lock();
        if let Some(deadline) = st.idle_at
            && at >= deadline
        {
            st.idle_at = None;
            st.is_transferring = false;
            st.estimator.reset();
            debug!(event = "throughput_idle", "Throughput estimator switched to idle mode");
        }
        st.is_transferring
    }

    /// One display tick: advance the EMA and publish it while active.
    pub fn on_display_tick(&self, at: Instant) {
        if !self.poll_mode(at) {
            return;
        }
        let smoothed = self.lock().estimator.refresh();
        self.reading_tx.send_replace(SpeedReading::Active(smoothed));
    }

    /// Run one idle-mode probe and publish its outcome.
    pub async fn run_probe(&self) {
        let Some(probe) = self.probe.clone() else {
            return;
        };
        let outcome = probe.round_trip().await;
        if self.is_transferring() {
            return;
        }
        let reading = match outcome {
            Ok(latency) => {
                let estimate = idle_estimate(latency, &mut rand::thread_rng());
                debug!(event = "idle_probe", latency_ms = latency.as_millis() as u64, estimate, "Idle bandwidth estimate");
                SpeedReading::Idle(estimate)
            }
            Err(e) => {
                warn!(event = "idle_probe_failure", error = %e, "Liveness probe failed");
                SpeedReading::Unknown
            }
        };
        self.reading_tx.send_replace(reading);
    }

    /// Spawn the display ticker and the idle prober.
    pub fn spawn(&self, sos: SignalOfStop) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut display = tokio::time::interval(SPEED_DISPLAY_INTERVAL);
            display.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut probe = tokio::time::interval(IDLE_PROBE_INTERVAL);
            probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = sos.wait() => break,
                    _ = display.tick() => monitor.on_display_tick(now()),
                    _ = probe.tick() => {
                        if !monitor.poll_mode(now()) {
                            monitor.run_probe().await;
                        }
                    }
                }
            }
        })
    }
}

/// Clock source that follows tokio's paused time in tests.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_current_speed_window_formula() {
        let t0 = Instant::now();
        let mut est = ThroughputEstimator::new();

        assert_eq!(est.record_at(t0, 1000), 0.0);
        // 3000 bytes over 500 ms
        let speed = est.record_at(t0 + ms(500), 2000);
        assert!((speed - 6000.0).abs() < 1e-6);

        // 6000 bytes over 1000 ms
        let speed = est.record_at(t0 + ms(1000), 3000);
        assert!((speed - 6000.0).abs() < 1e-6);
    }

    #[test]
    fn test_samples_outside_window_are_pruned() {
        let t0 = Instant::now();
        let mut est = ThroughputEstimator::new();
        est.record_at(t0, 50_000);
        est.record_at(t0 + ms(1000), 1000);
        est.record_at(t0 + ms(2500), 1000);

        // t0 fell out of the window: 2000 bytes over 1500 ms
        assert_eq!(est.sample_count(), 2);
        assert!((est.current_speed() - 2000.0 / 1500.0 * 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_same_timestamp_is_merged_and_zero_elapsed_is_zero() {
        let t0 = Instant::now();
        let mut est = ThroughputEstimator::new();
        est.record_at(t0, 100);
        assert_eq!(est.record_at(t0, 100), 0.0);
        assert_eq!(est.sample_count(), 1);
    }

    #[test]
    fn test_smoothed_speed_seeds_then_converges() {
        let t0 = Instant::now();
        let mut est = ThroughputEstimator::new();
        est.record_at(t0, 0);
        est.record_at(t0 + ms(100), 100);
        let slow = est.current_speed();
        assert!((slow - 1000.0).abs() < 1e-6);
        assert_eq!(est.refresh(), slow);

        // The rate jumps and stays there.
        let mut t = t0 + ms(100);
        for _ in 0..30 {
            t += ms(100);
            est.record_at(t, 1000);
            est.refresh();
        }
        let target = est.current_speed();
        assert!(target > slow);
        assert!(est.smoothed_speed() < target);

        let mut last_gap = f64::MAX;
        for _ in 0..40 {
            let gap = (est.refresh() - target).abs();
            assert!(gap <= last_gap);
            last_gap = gap;
        }
        assert!(last_gap < target * 1e-3);
    }

    #[test]
    fn test_ema_weighting() {
        let t0 = Instant::now();
        let mut est = ThroughputEstimator::new();
        est.record_at(t0, 500);
        est.record_at(t0 + ms(1000), 500);
        assert_eq!(est.refresh(), 1000.0);

        est.record_at(t0 + ms(1500), 2000);
        // 3000 bytes / 1500 ms
        let current = est.current_speed();
        assert!((current - 2000.0).abs() < 1e-6);
        let expected = 0.3 * 2000.0 + 0.7 * 1000.0;
        assert!((est.refresh() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_latency_buckets() {
        assert_eq!(bandwidth_bucket_mbps(ms(3)), 100);
        assert_eq!(bandwidth_bucket_mbps(ms(7)), 50);
        assert_eq!(bandwidth_bucket_mbps(ms(15)), 25);
        assert_eq!(bandwidth_bucket_mbps(ms(30)), 10);
        assert_eq!(bandwidth_bucket_mbps(ms(99)), 5);
        assert_eq!(bandwidth_bucket_mbps(ms(100)), 1);
        assert_eq!(bandwidth_bucket_mbps(ms(2000)), 1);
    }

    #[test]
    fn test_idle_estimate_jitter_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let fast = idle_estimate(ms(3), &mut rng);
            assert!((11_250_000.0..=13_750_000.0).contains(&fast), "{fast}");
            let slow = idle_estimate(ms(30), &mut rng);
            assert!((1_125_000.0..=1_375_000.0).contains(&slow), "{slow}");
        }
    }

    struct FixedProbe(Option<Duration>);

    #[async_trait]
    impl LatencyProbe for FixedProbe {
        async fn round_trip(&self) -> Result<Duration> {
            self.0.ok_or_else(|| anyhow::anyhow!("unreachable"))
        }
    }

    #[test]
    fn test_monitor_mode_switch_with_grace_delay() {
        let monitor = ThroughputMonitor::new(None);
        let txn = Uuid::new_v4();
        let t0 = Instant::now();

        monitor.record_at(t0, 1000);
        assert!(!monitor.is_transferring());

        monitor.start(txn, "peer");
        monitor.record_at(t0, 1000);
        monitor.record_at(t0 + ms(100), 1000);
        monitor.on_display_tick(t0 + ms(100));
        match monitor.reading() {
            SpeedReading::Active(v) => assert!((v - 20_000.0).abs() < 1e-6),
            other => panic!("unexpected reading {other:?}"),
        }

        monitor.stop_where(t0 + ms(200), |id, _| *id == txn);
        assert!(monitor.poll_mode(t0 + ms(500)));
        assert!(!monitor.poll_mode(t0 + ms(200) + IDLE_GRACE_DELAY));
    }

    #[test]
    fn test_monitor_restart_cancels_pending_idle() {
        let monitor = ThroughputMonitor::new(None);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Instant::now();

        monitor.start(a, "peer-1");
        monitor.start(b, "peer-2");
        monitor.stop_where(t0, |_, p| p == "peer-1");
        // peer-2 still transferring: no idle switch scheduled
        assert!(monitor.poll_mode(t0 + IDLE_GRACE_DELAY * 2));

        monitor.stop_where(t0, |_, p| p == "peer-2");
        monitor.start(a, "peer-1");
        assert!(monitor.poll_mode(t0 + IDLE_GRACE_DELAY * 2));
    }

    #[test]
    fn test_start_within_grace_delay_resets_window() {
        let monitor = ThroughputMonitor::new(None);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Instant::now();

        monitor.start(first, "peer");
        monitor.record_at(t0, 1_000_000);
        monitor.record_at(t0 + ms(100), 1_000_000);
        monitor.on_display_tick(t0 + ms(100));
        assert_eq!(monitor.sample_count(), 2);

        monitor.stop_where(t0 + ms(150), |id, _| *id == first);
        // Still inside the grace delay: the monitor has not gone idle yet.
        assert!(monitor.poll_mode(t0 + ms(200)));

        monitor.start(second, "peer");
        assert_eq!(monitor.sample_count(), 0);
        assert_eq!(monitor.current_speed(), 0.0);
        monitor.record_at(t0 + ms(300), 500);
        monitor.record_at(t0 + ms(400), 500);
        monitor.on_display_tick(t0 + ms(400));
        match monitor.reading() {
            SpeedReading::Active(v) => assert!((v - 10_000.0).abs() < 1e-6),
            other => panic!("unexpected reading {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_start_keeps_window() {
        let monitor = ThroughputMonitor::new(None);
        let t0 = Instant::now();
        monitor.start(Uuid::new_v4(), "peer-1");
        monitor.record_at(t0, 1000);
        monitor.start(Uuid::new_v4(), "peer-2");
        assert_eq!(monitor.sample_count(), 1);
    }

    #[tokio::test]
    async fn test_probe_outcomes() {
        let ok = ThroughputMonitor::new(Some(Arc::new(FixedProbe(Some(ms(3))))));
        ok.run_probe().await;
        match ok.reading() {
            SpeedReading::Idle(v) => assert!((11_250_000.0..=13_750_000.0).contains(&v)),
            other => panic!("unexpected reading {other:?}"),
        }

        let failing = ThroughputMonitor::new(Some(Arc::new(FixedProbe(None))));
        failing.run_probe().await;
        assert_eq!(failing.reading(), SpeedReading::Unknown);
    }
}
