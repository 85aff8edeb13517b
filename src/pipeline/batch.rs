//! Time-bounded frame batching

use std::time::Duration;

use tokio::time::Instant;

use super::types::{Batch, Frame};

struct OpenBatch {
    frames: Vec<Frame>,
    opened_at: Instant,
    deadline: Instant,
}

/// Groups frames into batches of at most `batch_size`
///
/// A batch is sealed as soon as it is full, or when `timeout` has elapsed
/// since its first frame arrived. Time is passed in by the caller, so the
/// scheduler itself never sleeps.
pub struct BatchScheduler {
    batch_size: usize,
    timeout: Duration,
    open: Option<OpenBatch>,
    next_id: u64,
}

impl BatchScheduler {
    pub fn new(batch_size: usize, timeout: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            timeout,
            open: None,
            next_id: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of frames waiting in the open batch
    pub fn pending(&self) -> usize {
        self.open.as_ref().map_or(0, |b| b.frames.len())
    }

    /// Deadline of the open batch, if there is one
    pub fn deadline(&self) -> Option<Instant> {
        self.open.as_ref().map(|b| b.deadline)
    }

    /// Add a frame that arrived at `now`, returning any batches it sealed
    ///
    /// If the open batch had already expired it is sealed first, so a late
    /// frame never extends an overdue batch.
    pub fn push(&mut self, frame: Frame, now: Instant) -> Vec<Batch> {
        let mut sealed = Vec::with_capacity(2);
        if let Some(expired) = self.poll_expired(now) {
            sealed.push(expired);
        }

        let timeout = self.timeout;
        let open = self.open.get_or_insert_with(|| OpenBatch {
            frames: Vec::new(),
            opened_at: now,
            deadline: now + timeout,
        });
        open.frames.push(frame);

        if open.frames.len() >= self.batch_size {
            if let Some(batch) = self.seal(now) {
                sealed.push(batch);
            }
        }
        sealed
    }

    /// Seal the open batch if its deadline has passed
    ///
    /// The batch is sealed as of its deadline even if polled later.
    pub fn poll_expired(&mut self, now: Instant) -> Option<Batch> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.seal(deadline)
    }

    /// Seal whatever is pending, at end-of-stream
    pub fn flush(&mut self, now: Instant) -> Option<Batch> {
        let deadline = self.deadline()?;
        self.seal(now.min(deadline))
    }

    fn seal(&mut self, at: Instant) -> Option<Batch> {
        let open = self.open.take()?;
        if open.frames.is_empty() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        Some(Batch {
            id,
            frames: open.frames,
            opened_at: open.opened_at,
            deadline: open.deadline,
            sealed_at: at.max(open.opened_at),
        })
    }
}
