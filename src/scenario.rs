//! Scenario driver
//!
//! A [`HarnessSession`] owns one virtual display and (optionally) one subject
//! process. Each [`HarnessSession::capture`] call builds a pipeline, samples
//! it and exports the accepted frame; the pipeline is dropped, and so set to
//! Null, before the call returns. When the session itself is dropped the
//! subject goes first, then the display server.
//!
//! Every error is tagged with the [`Stage`] it came from.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::config::HarnessConfig;
use crate::display::{DisplayConfig, DisplayHandle};
use crate::error::{Result, ScenarioError, Stage, StageExt};
use crate::export::export_png;
use crate::pipeline::{CapturePipeline, CropRegion, XImageSrcDescription};
use crate::process::{ProcessRole, ProcessSpec, SupervisedProcess};
use crate::sampler::{FrameSampler, SamplePolicy};
use crate::teardown::TeardownLog;

/// What to capture and where to put it
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub name: String,
    pub source: PipelineSource,
    pub output: PathBuf,
    pub policy: SamplePolicy,
}

/// Where a capture's pipeline description comes from
#[derive(Debug, Clone)]
pub enum PipelineSource {
    /// `ximagesrc` on the session display, optionally cropped
    XImage { crop: Option<CropRegion> },
    /// Caller-supplied description with the sink name and frame size it produces
    Custom {
        description: String,
        sink: String,
        width: u32,
        height: u32,
    },
}

impl CaptureRequest {
    pub fn ximage(name: impl Into<String>, crop: Option<CropRegion>, output: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: PipelineSource::XImage { crop },
            output: output.into(),
            policy: SamplePolicy::default(),
        }
    }

    #[must_use]
    pub fn policy(mut self, policy: SamplePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Result of one successful capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub name: String,
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub elapsed: Duration,
}

pub struct HarnessSession {
    // Field order is drop order: subject before the display server
    subject: Option<SupervisedProcess>,
    display: DisplayHandle,
    teardown: Option<TeardownLog>,
}

impl HarnessSession {
    /// Acquire the display, then launch the subject on it
    ///
    /// Blocks on a private runtime, so call it from synchronous code only;
    /// inside a tokio runtime acquisition fails with [`HarnessError::Config`].
    ///
    /// # Errors
    /// [`Stage::Acquisition`] or [`Stage::Launch`] failures. Anything already
    /// started is torn down before the error is returned.
    ///
    /// [`HarnessError::Config`]: crate::error::HarnessError::Config
    pub fn start(
        display: &DisplayConfig,
        subject: Option<&ProcessSpec>,
        teardown: Option<TeardownLog>,
    ) -> Result<Self, ScenarioError> {
        let display = DisplayHandle::acquire_blocking(display, teardown.clone()).stage(Stage::Acquisition)?;

        let subject = subject
            .map(|spec| SupervisedProcess::start(spec, ProcessRole::Subject, display.id(), teardown.clone()))
            .transpose()
            .stage(Stage::Launch)?;

        Ok(Self { subject, display, teardown })
    }

    #[must_use]
    pub fn display(&self) -> &DisplayHandle {
        &self.display
    }

    #[must_use]
    pub fn subject_pid(&self) -> Option<u32> {
        self.subject.as_ref().map(SupervisedProcess::pid)
    }

    /// Run one capture: parse, play, sample, assemble, export
    ///
    /// An ximagesrc crop that does not fit the display is a [`Stage::Parse`]
    /// failure, reported before any pipeline is built.
    pub fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome, ScenarioError> {
        let (description, sink_name, size) =
            resolve(&request.source, self.display.id(), self.display.size()).stage(Stage::Parse)?;
        run_capture(&description, &sink_name, size, request, self.teardown.clone())
    }
}

/// Pipeline description, sink name and frame size for `source`
fn resolve(
    source: &PipelineSource,
    display: &str,
    display_size: (u32, u32),
) -> Result<(String, String, (u32, u32))> {
    match source {
        PipelineSource::XImage { crop } => {
            let desc = XImageSrcDescription::new(display, display_size.0, display_size.1).crop(*crop);
            desc.validate()?;
            Ok((desc.render(), desc.sink_name.clone(), desc.capture_size()))
        }
        PipelineSource::Custom { description, sink, width, height } => {
            Ok((description.clone(), sink.clone(), (*width, *height)))
        }
    }
}

/// The pipeline is set to Null before this returns, on success and on error
fn run_capture(
    description: &str,
    sink_name: &str,
    (width, height): (u32, u32),
    request: &CaptureRequest,
    teardown: Option<TeardownLog>,
) -> Result<CaptureOutcome, ScenarioError> {
    let start = Instant::now();
    log::info!("🎬 Capture `{}` ({}x{})", request.name, width, height);

    let pipeline = CapturePipeline::parse(description, teardown).stage(Stage::Parse)?;
    let playing = pipeline.play().stage(Stage::Playback)?;
    let mut sink = playing.sink(sink_name).stage(Stage::Parse)?;

    let image = FrameSampler::new(request.policy.clone())
        .capture_rgba(&mut sink, width, height)
        .stage(Stage::Sampling)?;

    export_png(&image, &request.output).stage(Stage::Export)?;

    Ok(CaptureOutcome {
        name: request.name.clone(),
        output: request.output.clone(),
        width,
        height,
        elapsed: start.elapsed(),
    })
}

/// Full-frame and cropped captures as configured
#[must_use]
pub fn default_requests(config: &HarnessConfig) -> Vec<CaptureRequest> {
    let policy = config.sample_policy();
    vec![
        CaptureRequest::ximage("full", None, config.output_dir.join("image1.png")).policy(policy.clone()),
        CaptureRequest::ximage("crop", Some(config.crop), config.output_dir.join("image2.png")).policy(policy),
    ]
}

/// Start a session, run every request in order, tear everything down
///
/// Stops at the first failing capture.
pub fn run_scenario(
    config: &HarnessConfig,
    requests: &[CaptureRequest],
    teardown: Option<TeardownLog>,
) -> Result<Vec<CaptureOutcome>, ScenarioError> {
    let session = HarnessSession::start(&config.display, config.subject.as_ref(), teardown)?;
    let outcomes = requests
        .iter()
        .map(|request| session.capture(request))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(outcomes)
}
