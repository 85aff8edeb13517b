//! Object detector boundary

use anyhow::Result;

use crate::pipeline::types::{Batch, Detection};

/// Runs inference over a batch
///
/// Returns one detection list per frame, in batch order.
pub trait Detector: Send {
    fn detect(&mut self, batch: &Batch) -> Result<Vec<Vec<Detection>>>;
}

/// Detector that never finds anything
#[derive(Debug, Default)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(&mut self, batch: &Batch) -> Result<Vec<Vec<Detection>>> {
        Ok(vec![Vec::new(); batch.len()])
    }
}
