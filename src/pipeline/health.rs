//! Running counters shared by every stage task
//!
//! Stages only ever add to these; the controller reads a snapshot on each
//! health tick and once more when the pipeline stops.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
enum Counter {
    Frames,
    Keyframes,
    Bytes,
    Batches,
    Drops,
    StageErrors,
    NetworkErrors,
}

const COUNTERS: usize = 7;

pub struct PipelineHealth {
    started_at: Instant,
    counters: [AtomicU64; COUNTERS],
    /// Micros since `started_at` of the last frame pushed downstream
    last_frame_at: AtomicU64,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            last_frame_at: AtomicU64::new(0),
        }
    }

    fn add(&self, counter: Counter, n: u64) {
        self.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    fn uptime_micros(&self) -> u64 {
        self.started_at.elapsed().as_micros() as u64
    }

    /// A datagram that reached none of its destinations
    pub fn record_frame_drop(&self) {
        self.add(Counter::Drops, 1);
    }

    /// A stage task ended with an error
    pub fn record_stage_error(&self) {
        self.add(Counter::StageErrors, 1);
    }

    /// A single failed send on a network sink
    pub fn record_network_error(&self) {
        self.add(Counter::NetworkErrors, 1);
    }

    pub fn record_batch(&self) {
        self.add(Counter::Batches, 1);
    }

    /// A frame pushed downstream by any stage
    pub fn record_frame(&self, size: usize, is_keyframe: bool) {
        self.last_frame_at.store(self.uptime_micros(), Ordering::Relaxed);
        self.add(Counter::Frames, 1);
        self.add(Counter::Bytes, size as u64);
        if is_keyframe {
            self.add(Counter::Keyframes, 1);
        }
    }

    /// Batches and packets only count towards the byte total
    pub fn record_bytes(&self, size: usize) {
        self.add(Counter::Bytes, size as u64);
    }

    pub fn frame_drops(&self) -> u64 {
        self.get(Counter::Drops)
    }

    pub fn stage_errors(&self) -> u64 {
        self.get(Counter::StageErrors)
    }

    pub fn network_errors(&self) -> u64 {
        self.get(Counter::NetworkErrors)
    }

    pub fn frames_processed(&self) -> u64 {
        self.get(Counter::Frames)
    }

    pub fn batches_formed(&self) -> u64 {
        self.get(Counter::Batches)
    }

    pub fn bytes_processed(&self) -> u64 {
        self.get(Counter::Bytes)
    }

    pub fn keyframes_processed(&self) -> u64 {
        self.get(Counter::Keyframes)
    }

    /// Dropped datagrams per hundred frames
    pub fn frame_drop_rate(&self) -> f64 {
        match self.frames_processed() {
            0 => 0.0,
            frames => self.frame_drops() as f64 * 100.0 / frames as f64,
        }
    }

    /// True when no frame has moved for longer than `threshold`
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let idle = self
            .uptime_micros()
            .saturating_sub(self.last_frame_at.load(Ordering::Relaxed));
        idle > threshold.as_micros() as u64
    }

    pub fn summary(&self) -> HealthSummary {
        let uptime = self.started_at.elapsed();
        let frames = self.frames_processed();
        HealthSummary {
            uptime,
            frames,
            keyframes: self.keyframes_processed(),
            batches: self.batches_formed(),
            bytes: self.bytes_processed(),
            drops: self.frame_drops(),
            drop_rate: self.frame_drop_rate(),
            stage_errors: self.stage_errors(),
            network_errors: self.network_errors(),
            fps: match uptime.as_secs_f64() {
                secs if secs > 0.0 => frames as f64 / secs,
                _ => 0.0,
            },
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub uptime: Duration,
    pub frames: u64,
    pub keyframes: u64,
    pub batches: u64,
    pub bytes: u64,
    pub drops: u64,
    pub drop_rate: f64,
    pub stage_errors: u64,
    pub network_errors: u64,
    /// Frames per second across every stage since start
    pub fps: f64,
}

impl fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "up {}s, {} frames ({:.1}/s, {} key), {} batches, {} KiB, {} drops ({:.2}%), errors: {} stage / {} network",
            self.uptime.as_secs(),
            self.frames,
            self.fps,
            self.keyframes,
            self.batches,
            self.bytes / 1024,
            self.drops,
            self.drop_rate,
            self.stage_errors,
            self.network_errors
        )
    }
}
