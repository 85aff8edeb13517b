use anyhow::{Result, bail};

use crate::pipeline::caps::{Caps, CapsSet, Format};
use crate::pipeline::stage::{StageKind, Transform};
use crate::pipeline::types::Buffer;

/// Restricts the format of a link without touching the data
///
/// Negotiation does the real work; at runtime the filter only checks that
/// every frame still matches what was agreed.
pub struct CapsFilter {
    caps: CapsSet,
    passed: u64,
}

impl CapsFilter {
    pub fn new(caps: CapsSet) -> Self {
        Self { caps, passed: 0 }
    }

    pub fn caps(&self) -> &CapsSet {
        &self.caps
    }
}

impl Transform for CapsFilter {
    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn sink_caps(&self) -> CapsSet {
        self.caps.clone()
    }

    fn src_caps(&self, input: Option<&Format>) -> CapsSet {
        match input {
            Some(format) => Caps::from_format(format).into(),
            None => self.caps.clone(),
        }
    }

    fn transform(&mut self, buffer: Buffer, out: &mut Vec<Buffer>) -> Result<()> {
        let formats: Vec<&Format> = match &buffer {
            Buffer::Frame(frame) => vec![&frame.format],
            Buffer::Batch(batch) => batch.frames.iter().map(|f| &f.format).collect(),
            Buffer::Packet(_) => Vec::new(),
        };
        if let Some(format) = formats.into_iter().find(|f| !self.caps.accepts(f)) {
            bail!(
                "buffer {} has format [{}] outside [{}]",
                self.passed,
                format,
                self.caps
            );
        }
        self.passed += 1;
        out.push(buffer);
        Ok(())
    }
}
