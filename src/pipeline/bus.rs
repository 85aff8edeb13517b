//! Control bus: stage tasks post events, the lifecycle controller consumes them

use log::debug;
use tokio::sync::mpsc;

use super::state::PipelineState;

/// Events delivered to the lifecycle controller
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// A sink consumed the end-of-stream marker
    EndOfStream { stage: String },

    /// A stage failed while running
    Error { stage: String, message: String },

    /// A stage completed a state change on its own task
    StateChanged {
        stage: String,
        old: PipelineState,
        new: PipelineState,
    },

    /// The process received an interrupt signal
    Interrupted,
}

impl ControlEvent {
    pub fn stage(&self) -> Option<&str> {
        match self {
            ControlEvent::EndOfStream { stage }
            | ControlEvent::Error { stage, .. }
            | ControlEvent::StateChanged { stage, .. } => Some(stage),
            ControlEvent::Interrupted => None,
        }
    }
}

/// Posting side of the control bus
///
/// Unbounded so that posting never blocks a stage task.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

pub type BusReceiver = mpsc::UnboundedReceiver<ControlEvent>;

impl Bus {
    pub fn new() -> (Bus, BusReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Bus { tx }, rx)
    }

    /// Post an event; events posted after the controller is gone are dropped
    pub fn post(&self, event: ControlEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("Bus: controller gone, dropping {:?}", e.0);
        }
    }

    pub fn post_error(&self, stage: &str, error: &anyhow::Error) {
        self.post(ControlEvent::Error {
            stage: stage.to_string(),
            message: format!("{:#}", error),
        });
    }

    pub fn post_eos(&self, stage: &str) {
        self.post(ControlEvent::EndOfStream {
            stage: stage.to_string(),
        });
    }
}
