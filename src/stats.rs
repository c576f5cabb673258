use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Lock-free session counters
#[derive(Debug)]
pub struct Stats {
    pub frames_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub decrypt_failures: AtomicU64,
    pub parse_errors: AtomicU64,
    pub events_published: AtomicU64,
    pub publish_errors: AtomicU64,
    pub speaker_messages: AtomicU64,
    pub mic_chunks: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decrypt_failures: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            speaker_messages: AtomicU64::new(0),
            mic_chunks: AtomicU64::new(0),
        })
    }

    #[inline(always)]
    pub fn record_recv(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_decrypt_failure(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_speaker_message(&self) {
        self.speaker_messages.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_mic_chunk(&self) {
        self.mic_chunks.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot and reset counters, return rates
    pub fn snapshot_and_reset(&self, elapsed: Duration) -> StatsSnapshot {
        let secs = elapsed.as_secs_f64().max(0.001);

        let frames = self.frames_received.swap(0, Ordering::Relaxed);
        let bytes = self.bytes_received.swap(0, Ordering::Relaxed);
        let decrypt = self.decrypt_failures.swap(0, Ordering::Relaxed);
        let parse = self.parse_errors.swap(0, Ordering::Relaxed);
        let events = self.events_published.swap(0, Ordering::Relaxed);
        let publish = self.publish_errors.swap(0, Ordering::Relaxed);
        let speaker = self.speaker_messages.swap(0, Ordering::Relaxed);
        let mic = self.mic_chunks.swap(0, Ordering::Relaxed);

        StatsSnapshot {
            recv_mps: (frames as f64) / secs,
            recv_kbps: ((bytes as f64) * 8.0) / (secs * 1000.0),
            event_mps: (events as f64) / secs,
            speaker_messages: speaker,
            mic_chunks: mic,
            decrypt_failures: decrypt,
            parse_errors: parse,
            publish_errors: publish,
        }
    }
}

#[derive(Debug)]
pub struct StatsSnapshot {
    pub recv_mps: f64,
    pub recv_kbps: f64,
    pub event_mps: f64,
    pub speaker_messages: u64,
    pub mic_chunks: u64,
    pub decrypt_failures: u64,
    pub parse_errors: u64,
    pub publish_errors: u64,
}

/// Background stats reporter task
pub async fn stats_reporter(stats: Arc<Stats>, interval_secs: u64) {
    if interval_secs == 0 {
        // Stats disabled — park forever
        std::future::pending::<()>().await;
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    let mut last = Instant::now();

    loop {
        tokio::time::sleep(interval).await;
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let snap = stats.snapshot_and_reset(elapsed);
        info!(
            "stats: recv {:.0} msg/s {:.1} kbit/s | events {:.1}/s | speaker={} mic={} | errors: decrypt={} parse={} publish={}",
            snap.recv_mps,
            snap.recv_kbps,
            snap.event_mps,
            snap.speaker_messages,
            snap.mic_chunks,
            snap.decrypt_failures,
            snap.parse_errors,
            snap.publish_errors
        );
    }
}
