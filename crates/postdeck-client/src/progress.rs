//! Progress, throughput and ETA aggregation

use std::time::{Duration, Instant};

/// Progress callback type
pub type ProgressCallback = Box<dyn Fn(UploadProgress) + Send + Sync>;

/// Borrowed progress callback, as passed through the engine
pub type ProgressFn<'a> = &'a (dyn Fn(UploadProgress) + Send + Sync);

/// Upload progress information
#[derive(Clone, Debug, PartialEq)]
pub struct UploadProgress {
    /// Bytes uploaded so far
    pub bytes_uploaded: u64,
    /// Total bytes to upload
    pub total_bytes: u64,
    /// Parts finished so far
    pub completed_parts: u32,
    /// Total number of parts
    pub total_parts: u32,
    /// Percentage within the caller's range, never decreasing
    pub percent: f64,
    /// Average throughput since the start, in bytes per second
    pub bytes_per_sec: f64,
    /// Estimated time remaining
    pub eta: Option<Duration>,
}

impl UploadProgress {
    /// Fraction of bytes done, in `[0, 1]`
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.bytes_uploaded as f64 / self.total_bytes as f64).min(1.0)
    }
}

/// Sub-range of an overall percentage that one phase reports into
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressRange {
    pub start: f64,
    pub end: f64,
}

impl Default for ProgressRange {
    fn default() -> Self {
        Self::FULL
    }
}

impl ProgressRange {
    /// The whole 0 to 100 scale
    pub const FULL: Self = Self {
        start: 0.0,
        end: 100.0,
    };

    /// Create a range, clamped to 0..=100 and ordered
    pub fn new(start: f64, end: f64) -> Self {
        let start = start.clamp(0.0, 100.0);
        let end = end.clamp(start, 100.0);
        Self { start, end }
    }

    /// Map a fraction in `[0, 1]` into this range
    pub fn map(&self, fraction: f64) -> f64 {
        self.start + (self.end - self.start) * fraction.clamp(0.0, 1.0)
    }
}

/// Byte counter behind [`UploadProgress`] snapshots
#[derive(Debug)]
pub struct ProgressTracker {
    started: Instant,
    range: ProgressRange,
    total_bytes: u64,
    total_parts: u32,
    bytes_uploaded: u64,
    completed_parts: u32,
    last_percent: f64,
}

impl ProgressTracker {
    /// Start tracking a run
    pub fn new(total_bytes: u64, total_parts: u32) -> Self {
        Self::with_range(total_bytes, total_parts, ProgressRange::FULL)
    }

    /// Start tracking a run that reports into `range`
    pub fn with_range(total_bytes: u64, total_parts: u32, range: ProgressRange) -> Self {
        Self {
            started: Instant::now(),
            range,
            total_bytes,
            total_parts,
            bytes_uploaded: 0,
            completed_parts: 0,
            last_percent: range.start,
        }
    }

    /// Record a finished part
    pub fn record_part(&mut self, bytes: u64) -> UploadProgress {
        self.completed_parts = (self.completed_parts + 1).min(self.total_parts);
        self.advance_to(self.bytes_uploaded + bytes)
    }

    /// Move the byte counter to an absolute position; it never moves back
    pub fn advance_to(&mut self, bytes_uploaded: u64) -> UploadProgress {
        self.bytes_uploaded = self.bytes_uploaded.max(bytes_uploaded.min(self.total_bytes));
        self.snapshot()
    }

    /// Current progress
    pub fn snapshot(&mut self) -> UploadProgress {
        let fraction = if self.total_bytes == 0 {
            1.0
        } else {
            self.bytes_uploaded as f64 / self.total_bytes as f64
        };
        self.last_percent = self.last_percent.max(self.range.map(fraction));

        let bytes_per_sec = self.average_speed();
        let remaining = self.total_bytes - self.bytes_uploaded;
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if bytes_per_sec > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / bytes_per_sec))
        } else {
            None
        };

        UploadProgress {
            bytes_uploaded: self.bytes_uploaded,
            total_bytes: self.total_bytes,
            completed_parts: self.completed_parts,
            total_parts: self.total_parts,
            percent: self.last_percent,
            bytes_per_sec,
            eta,
        }
    }

    /// Bytes per second since the tracker started
    pub fn average_speed(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.bytes_uploaded as f64 / secs
        }
    }

    /// Time since the tracker started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Bytes counted so far
    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }
}
