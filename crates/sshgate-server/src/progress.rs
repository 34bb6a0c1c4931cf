//! Throttled transfer progress.
//!
//! The tracker turns raw byte counts into percentage events, emitting only
//! when the whole-number percentage moves forward. A transfer therefore
//! produces at most 101 events no matter how small its writes are.

use std::time::Instant;

/// One progress notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// Whole percent, 0–100.
    pub percent: u8,
    /// Bytes per second since the previous event.
    pub speed: f64,
}

/// Per-transfer progress state. Create one per transfer.
#[derive(Debug)]
pub struct ProgressTracker {
    total: Option<u64>,
    transferred: u64,
    last_percent: u8,
    last_emit_bytes: u64,
    last_emit_at: Instant,
    finished: bool,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            total: None,
            transferred: 0,
            last_percent: 0,
            last_emit_bytes: 0,
            last_emit_at: Instant::now(),
            finished: false,
        }
    }

    /// Set the expected size. Ignored once a size is known, and ignored when
    /// the size is unknown.
    pub fn init(&mut self, total: Option<u64>) {
        if self.total.is_some() {
            return;
        }
        if let Some(total) = total {
            self.total = Some(total);
            self.last_emit_at = Instant::now();
        }
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Account for `n` more bytes. Returns an event if the percentage advanced.
    pub fn on_bytes(&mut self, n: u64) -> Option<ProgressEvent> {
        self.on_bytes_at(n, Instant::now())
    }

    fn on_bytes_at(&mut self, n: u64, now: Instant) -> Option<ProgressEvent> {
        self.transferred = self.transferred.saturating_add(n);
        let total = self.total?;
        if self.finished {
            return None;
        }

        let percent = percent_of(self.transferred, total);
        if percent > self.last_percent {
            Some(self.emit(percent, now))
        } else {
            None
        }
    }

    /// Close the transfer. Guarantees a terminal 100% event when the size was
    /// known and 100% has not been reported yet.
    pub fn end(&mut self) -> Option<ProgressEvent> {
        self.end_at(Instant::now())
    }

    fn end_at(&mut self, now: Instant) -> Option<ProgressEvent> {
        if self.finished || self.total.is_none() {
            return None;
        }
        let event = (self.last_percent < 100).then(|| self.emit(100, now));
        self.finished = true;
        event
    }

    fn emit(&mut self, percent: u8, now: Instant) -> ProgressEvent {
        let elapsed = now.saturating_duration_since(self.last_emit_at).as_secs_f64();
        let bytes = self.transferred.saturating_sub(self.last_emit_bytes);
        let speed = if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        };

        self.last_percent = percent;
        self.last_emit_bytes = self.transferred;
        self.last_emit_at = now;

        ProgressEvent { percent, speed }
    }
}

fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (u128::from(done) * 100) / u128::from(total);
    pct.min(100) as u8
}
