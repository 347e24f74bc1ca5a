//! # Pacer
//!
//! Spreads flushes over time so the ingest endpoint receives at most a configured number of
//! lines per minute, and bounds the number of flushes in flight.

use std::time::Duration;
use tokio::sync::{AcquireError, Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::debug;

const MINUTE: Duration = Duration::from_secs(60);

pub struct DeliveryPacer {
    lines_per_minute: Option<u32>,
    /// Earliest time the next flush may start
    watermark: Mutex<Instant>,
    flushes: Semaphore,
}

impl DeliveryPacer {
    /// `None` or zero disables pacing, `max_concurrent_flushes` is at least one
    pub fn new(lines_per_minute: Option<u32>, max_concurrent_flushes: usize) -> Self {
        Self {
            lines_per_minute: lines_per_minute.filter(|budget| *budget > 0),
            watermark: Mutex::new(Instant::now()),
            flushes: Semaphore::new(max_concurrent_flushes.max(1)),
        }
    }

    /// Reserve the send slot of a flush of `lines` lines and return when it starts
    pub async fn schedule(&self, lines: usize) -> Instant {
        let now = Instant::now();
        let Some(budget) = self.lines_per_minute else {
            return now;
        };

        let mut watermark = self.watermark.lock().await;
        let scheduled = (*watermark).max(now);
        *watermark = scheduled + MINUTE.mul_f64(lines as f64 / f64::from(budget));
        scheduled
    }

    /// Wait for the reserved slot, then for a free flush permit
    pub async fn ready(&self, lines: usize) -> Result<SemaphorePermit<'_>, AcquireError> {
        let scheduled = self.schedule(lines).await;
        if scheduled > Instant::now() {
            debug!("Delaying flush of {lines} lines by {:?}", scheduled - Instant::now());
            tokio::time::sleep_until(scheduled).await;
        }
        self.flushes.acquire().await
    }
}
