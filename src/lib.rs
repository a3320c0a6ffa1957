//! Xvfb Capture Harness
//!
//! Verifies a GStreamer screen-capture pipeline end to end: start a virtual
//! X display, launch a subject on it, pull frames through `ximagesrc` until
//! one carries real content, and save it as PNG.
//!
//! # Flow
//! - **display**: spawn Xvfb, retry-connect with a timeout
//! - **process**: supervised subject process bound to the display
//! - **pipeline**: parse / play / look up the appsink
//! - **sampler**: skip blank frames, bounded wait
//! - **export**: PNG on disk
//!
//! Teardown is ordered: pipeline to Null, then subject, then display server.

pub mod error;
pub mod teardown;

// Resource guards
pub mod display;
pub mod process;

// Capture path
pub mod frame;
pub mod pipeline;
pub mod sampler;
pub mod export;

pub mod config;
pub mod scenario;

pub use config::HarnessConfig;
pub use display::{DisplayConfig, DisplayHandle};
pub use error::{HarnessError, ScenarioError, Stage};
pub use frame::Frame;
pub use pipeline::{CapturePipeline, CropRegion, PlayingPipeline, SinkEndpoint, XImageSrcDescription};
pub use process::{ProcessRole, ProcessSpec, SupervisedProcess};
pub use sampler::{FrameSampler, FrameSource, SamplePolicy};
pub use scenario::{run_scenario, CaptureOutcome, CaptureRequest, HarnessSession, PipelineSource};
pub use teardown::{TeardownEvent, TeardownLog};
