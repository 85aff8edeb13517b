//! Startup error taxonomy
//!
//! Construction, negotiation and publishing failures are typed so that `main`
//! can report them precisely; failures of a running stage are plain
//! `anyhow::Error`s surfaced through the control bus instead.

use std::net::SocketAddr;

use thiserror::Error;

use crate::pipeline::stage::StageKind;
use crate::pipeline::state::{PipelineState, StateChange};

#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("no factory registered for stage type '{0}'")]
    UnknownFactory(String),

    #[error("factory '{factory}' builds a {actual} stage, not a {expected} stage")]
    KindMismatch {
        factory: String,
        expected: StageKind,
        actual: StageKind,
    },

    #[error("invalid property '{property}' on stage '{stage}': {reason}")]
    InvalidProperty {
        stage: String,
        property: String,
        reason: String,
    },

    #[error("backend '{backend}' for stage '{stage}' is unavailable: {reason}")]
    Unavailable {
        stage: String,
        backend: String,
        reason: String,
    },

    #[error("a stage named '{0}' already exists")]
    DuplicateName(String),

    #[error("stage '{stage}' has no {direction} link")]
    Unlinked {
        stage: String,
        direction: &'static str,
    },
}

impl ConstructionError {
    pub fn invalid(stage: &str, property: &str, reason: impl ToString) -> Self {
        ConstructionError::InvalidProperty {
            stage: stage.to_string(),
            property: property.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("cannot link '{producer}' to '{consumer}': no common format between [{producer_caps}] and [{consumer_caps}]")]
    Incompatible {
        producer: String,
        consumer: String,
        producer_caps: String,
        consumer_caps: String,
    },

    #[error("format [{format}] rejected on link '{producer}' -> '{consumer}'")]
    OverrideRejected {
        producer: String,
        consumer: String,
        format: String,
    },

    #[error("no stage named '{0}'")]
    UnknownStage(String),

    #[error("stage '{0}' is already linked downstream")]
    AlreadyLinked(String),

    #[error("stage '{0}' does not accept more than one upstream link")]
    InputTaken(String),

    #[error("links can only be created in the Null state (pipeline is {0})")]
    PipelineActive(PipelineState),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("address {addr} is already in use")]
    PortInUse { addr: SocketAddr },

    #[error("mount '{0}' is already published")]
    AlreadyMounted(String),

    #[error("mount path '{0}' must start with '/'")]
    InvalidMount(String),

    #[error("invalid relay address '{0}'")]
    InvalidRelay(String),

    #[error("mount '{0}' is not published")]
    NotMounted(String),

    #[error("publisher I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PublishError {
    /// Map a bind failure, singling out address conflicts
    pub fn from_bind(addr: SocketAddr, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            PublishError::PortInUse { addr }
        } else {
            PublishError::Io(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("stage '{stage}' failed {change}: {reason}")]
    StateChange {
        stage: String,
        change: StateChange,
        reason: String,
    },

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("stage '{stage}' failed while starting: {reason}")]
    Startup { stage: String, reason: String },
}
