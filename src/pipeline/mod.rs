//! Pipeline engine for aerocast
//!
//! Stages are typed nodes in a `StageGraph`. Adjacent stages agree on the
//! format their link carries through caps negotiation before anything runs.
//! Once the graph reaches `Playing`:
//! - Each stage runs in its own async task
//! - Buffers flow downstream over bounded channels
//! - Stages report errors, end-of-stream and state acks on the control bus
//! - The `LifecycleController` is the only owner of pipeline state
//! - Health counters are shared by every stage

pub mod batch;
pub mod bus;
pub mod caps;
pub mod controller;
pub mod graph;
pub mod health;
pub mod probe;
pub mod registry;
pub mod stage;
pub mod state;
pub mod types;

pub use batch::BatchScheduler;
pub use bus::{Bus, BusReceiver, ControlEvent};
pub use caps::{Caps, CapsSet, Format, Fraction, MediaType, PixelLayout};
pub use controller::{Lifecycle, LifecycleController, ShutdownReason};
pub use graph::{Link, LinkConfig, StageGraph, StageHandle, Topology};
pub use health::PipelineHealth;
pub use probe::{AnnotationProbe, FrameCounter, LabelStyle, TrackedClass};
pub use registry::{StageConfig, StageRegistry};
pub use stage::{PipelineStage, StageContext, StageKind, Transform, TransformStage};
pub use state::{PipelineState, StateChange};
pub use types::{Batch, Buffer, Detection, Flow, Frame, OverlayDescriptor, Packet, Timestamp};
