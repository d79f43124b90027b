//! Progress reporter implementation
//!
//! Uses indicatif for the byte bar (throughput and ETA included) and
//! humansize for the closing summary.

use crate::client::TransferListener;
use crate::transfer::TransferDirection;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const BAR_TEMPLATE: &str =
    "{prefix:.bold.dim} [{bar:40.green/white}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})";

/// Terminal progress for one transfer at a time
pub struct TransferProgress {
    bar: ProgressBar,
    started: Mutex<Option<Instant>>,
    transferred: AtomicU64,
    resumed_at: AtomicU64,
    succeeded: AtomicBool,
}

impl TransferProgress {
    /// Progress drawn on stderr
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self::with_bar(bar)
    }

    /// Progress that counts without drawing
    pub fn disabled() -> Self {
        Self::with_bar(ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::hidden()))
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            started: Mutex::new(None),
            transferred: AtomicU64::new(0),
            resumed_at: AtomicU64::new(0),
            succeeded: AtomicBool::new(false),
        }
    }

    /// Bytes acknowledged in this run, excluding resumed ones
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Summary of the last transfer
    pub fn summary(&self) -> TransferSummary {
        let elapsed = self
            .started
            .lock()
            .ok()
            .and_then(|s| *s)
            .map(|s| s.elapsed())
            .unwrap_or_default();
        let transferred = self.transferred();
        TransferSummary {
            total: self.bar.length().unwrap_or(0),
            transferred,
            resumed_at: self.resumed_at.load(Ordering::Relaxed),
            elapsed,
            throughput: if elapsed.as_secs_f64() > 0.0 {
                transferred as f64 / elapsed.as_secs_f64()
            } else {
                0.0
            },
            succeeded: self.succeeded.load(Ordering::Relaxed),
        }
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferListener for TransferProgress {
    fn started(&self, remote: &str, direction: TransferDirection, total: u64, resumed_at: u64) {
        if let Ok(mut started) = self.started.lock() {
            *started = Some(Instant::now());
        }
        self.transferred.store(0, Ordering::Relaxed);
        self.resumed_at.store(resumed_at, Ordering::Relaxed);
        self.succeeded.store(false, Ordering::Relaxed);

        self.bar.set_prefix(match direction {
            TransferDirection::Upload => "Upload  ",
            TransferDirection::Download => "Download",
        });
        self.bar.set_message(remote.to_string());
        self.bar.set_length(total);
        self.bar.set_position(resumed_at);
        self.bar.reset_eta();
    }

    fn advanced(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
        self.bar.inc(bytes);
    }

    fn finished(&self, _remote: &str, succeeded: bool) {
        self.succeeded.store(succeeded, Ordering::Relaxed);
        if succeeded {
            self.bar.finish();
        } else {
            self.bar.abandon();
        }
    }
}

/// Outcome of a transfer
#[derive(Debug, Clone)]
pub struct TransferSummary {
    /// Total length
    pub total: u64,
    /// Bytes moved in the last run
    pub transferred: u64,
    /// Bytes skipped because an earlier run acknowledged them
    pub resumed_at: u64,
    /// Duration of the last run
    pub elapsed: Duration,
    /// Bytes per second
    pub throughput: f64,
    /// Whether the last run completed
    pub succeeded: bool,
}

impl TransferSummary {
    /// Print to stderr
    pub fn print(&self) {
        eprintln!(
            "{} {} in {} ({}/s){}",
            if self.succeeded { "Transferred" } else { "Stopped after" },
            humansize::format_size(self.transferred, humansize::BINARY),
            humantime::format_duration(Duration::from_millis(self.elapsed.as_millis() as u64)),
            humansize::format_size(self.throughput as u64, humansize::BINARY),
            if self.resumed_at > 0 {
                format!(
                    ", resumed at {}",
                    humansize::format_size(self.resumed_at, humansize::BINARY)
                )
            } else {
                String::new()
            }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_counts_chunks() {
        let progress = TransferProgress::disabled();
        progress.started("a.bin", TransferDirection::Upload, 30, 10);
        progress.advanced(10);
        progress.advanced(10);
        progress.finished("a.bin", true);

        let summary = progress.summary();
        assert_eq!(summary.total, 30);
        assert_eq!(summary.transferred, 20);
        assert_eq!(summary.resumed_at, 10);
        assert!(summary.succeeded);
    }

    #[test]
    fn test_restart_resets_counters() {
        let progress = TransferProgress::disabled();
        progress.started("a.bin", TransferDirection::Download, 30, 0);
        progress.advanced(10);
        progress.finished("a.bin", false);
        assert!(!progress.summary().succeeded);

        progress.started("a.bin", TransferDirection::Download, 30, 10);
        assert_eq!(progress.transferred(), 0);
    }
}
