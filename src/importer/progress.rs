use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MB: f64 = 1024.0 * 1024.0;

/// Format seconds into a human-readable time string (e.g., "1h30m45s", "5m30s", or "45s")
pub(crate) fn format_time(secs: f64) -> String {
    let total_secs = secs as u64;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{:.2}s", secs)
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / MB / secs
    } else {
        0.0
    }
}

/// Totals for a finished copy
#[derive(Debug, Clone)]
pub struct FinalStats {
    pub bytes_received: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

impl FinalStats {
    /// Decoded bytes per received byte; `None` before anything arrived
    pub fn expansion_ratio(&self) -> Option<f64> {
        (self.bytes_received > 0).then(|| self.bytes_written as f64 / self.bytes_received as f64)
    }

    pub fn write_rate(&self) -> f64 {
        rate(self.bytes_written, self.elapsed)
    }

    pub fn total_time_formatted(&self) -> String {
        format_time(self.elapsed.as_secs_f64())
    }
}

/// Throttled progress logging for the copy loop
pub(crate) struct ProgressTracker {
    received: Option<Arc<AtomicU64>>,
    content_length: Option<u64>,
    bytes_written: u64,
    start_time: Instant,
    last_update: Instant,
    interval: Duration,
}

impl ProgressTracker {
    pub(crate) fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            received: None,
            content_length: None,
            bytes_written: 0,
            start_time: now,
            last_update: now,
            interval,
        }
    }

    /// Track raw backend bytes; `content_length` is their expected total
    pub(crate) fn with_source(mut self, received: Arc<AtomicU64>, content_length: Option<u64>) -> Self {
        self.received = Some(received);
        self.content_length = content_length;
        self
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.received
            .as_ref()
            .map(|r| r.load(Ordering::Relaxed))
            .unwrap_or(self.bytes_written)
    }

    pub(crate) fn add_written(&mut self, n: usize) {
        self.bytes_written += n as u64;
        self.update(false);
    }

    /// Log progress if the interval has passed or `force` is set
    pub(crate) fn update(&mut self, force: bool) {
        let now = Instant::now();
        if !force && now.duration_since(self.last_update) < self.interval {
            return;
        }
        self.last_update = now;

        let elapsed = now.duration_since(self.start_time);
        let received = self.bytes_received();
        let written_mb = self.bytes_written as f64 / MB;

        match self.content_length {
            Some(total) if total > 0 => {
                let percent = (received as f64 / total as f64 * 100.0).min(100.0);
                tracing::info!(
                    "Progress: {:.1}% | received {:.2} MB / {:.2} MB | written {:.2} MB | {:.2} MB/s",
                    percent,
                    received as f64 / MB,
                    total as f64 / MB,
                    written_mb,
                    rate(self.bytes_written, elapsed)
                );
            }
            _ => {
                tracing::info!(
                    "Progress: received {:.2} MB | written {:.2} MB | {:.2} MB/s",
                    received as f64 / MB,
                    written_mb,
                    rate(self.bytes_written, elapsed)
                );
            }
        }
    }

    pub(crate) fn finish(&mut self) -> FinalStats {
        self.update(true);
        FinalStats {
            bytes_received: self.bytes_received(),
            bytes_written: self.bytes_written,
            elapsed: self.start_time.elapsed(),
        }
    }
}
