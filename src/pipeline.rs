//! GStreamer capture pipeline
//!
//! Lifecycle is encoded in the types: a description is parsed into a
//! [`CapturePipeline`], which [`CapturePipeline::play`] turns into a
//! [`PlayingPipeline`]. Only a playing pipeline hands out [`SinkEndpoint`]s,
//! and endpoints borrow it, so no pull can happen before Playing or after
//! teardown. Whichever wrapper holds the pipeline last forces it to Null
//! exactly once when dropped.

use std::time::Duration;
use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::error::{HarnessError, Result};
use crate::frame::{strip_row_padding, Frame};
use crate::sampler::FrameSource;
use crate::teardown::{TeardownEvent, TeardownLog};

/// Sink name used by [`XImageSrcDescription`] unless overridden
pub const DEFAULT_SINK_NAME: &str = "dst";

/// Sub-rectangle of the display to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Parse `WxH` or `WxH+X+Y`
    pub fn parse(value: &str) -> Result<Self> {
        let bad = || HarnessError::Config(format!("invalid crop region `{value}`, expected WxH[+X+Y]"));
        let mut parts = value.split('+');
        let size = parts.next().ok_or_else(bad)?;
        let (w, h) = size.split_once('x').ok_or_else(bad)?;
        let width = w.trim().parse().map_err(|_| bad())?;
        let height = h.trim().parse().map_err(|_| bad())?;
        let x = parts.next().map_or(Ok(0), str::parse).map_err(|_| bad())?;
        let y = parts.next().map_or(Ok(0), str::parse).map_err(|_| bad())?;
        if parts.next().is_some() || width == 0 || height == 0 {
            return Err(bad());
        }
        Ok(Self { x, y, width, height })
    }

    /// Reject empty regions and regions reaching past a `(width, height)` display
    pub fn check_within(&self, (display_width, display_height): (u32, u32)) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(HarnessError::Config(format!(
                "crop region {}x{} is empty",
                self.width, self.height
            )));
        }
        let fits = |start: u32, len: u32, limit: u32| start.checked_add(len).is_some_and(|end| end <= limit);
        if !fits(self.x, self.width, display_width) || !fits(self.y, self.height, display_height) {
            return Err(HarnessError::Config(format!(
                "crop region {}x{}+{}+{} does not fit the {}x{} display",
                self.width, self.height, self.x, self.y, display_width, display_height
            )));
        }
        Ok(())
    }
}

/// `ximagesrc ! videoconvert ! RGBA ! appsink` against one display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XImageSrcDescription {
    pub display: String,
    pub display_size: (u32, u32),
    pub crop: Option<CropRegion>,
    pub sink_name: String,
}

impl XImageSrcDescription {
    pub fn new(display: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            display: display.into(),
            display_size: (width, height),
            crop: None,
            sink_name: DEFAULT_SINK_NAME.to_string(),
        }
    }

    #[must_use]
    pub fn crop(mut self, crop: Option<CropRegion>) -> Self {
        self.crop = crop;
        self
    }

    /// (width, height) of the frames the sink will produce
    #[must_use]
    pub fn capture_size(&self) -> (u32, u32) {
        self.crop.map_or(self.display_size, |c| (c.width, c.height))
    }

    /// Check the crop against the display before rendering
    ///
    /// # Errors
    /// [`HarnessError::Config`] for an empty or out-of-bounds crop.
    pub fn validate(&self) -> Result<()> {
        self.crop.map_or(Ok(()), |c| c.check_within(self.display_size))
    }

    /// Render the gst-launch description
    ///
    /// Call [`XImageSrcDescription::validate`] first; an invalid crop is
    /// clamped here rather than rejected.
    #[must_use]
    pub fn render(&self) -> String {
        let mut src = format!(
            "ximagesrc name=src display-name={} show-pointer=0 use-damage=0",
            self.display
        );
        // ximagesrc end coordinates are inclusive
        if let Some(c) = self.crop {
            src.push_str(&format!(
                " startx={} starty={} endx={} endy={}",
                c.x,
                c.y,
                c.x.saturating_add(c.width.saturating_sub(1)),
                c.y.saturating_add(c.height.saturating_sub(1))
            ));
        }
        format!(
            "{src} ! videoconvert ! video/x-raw,format=RGBA ! appsink name={}",
            self.sink_name
        )
    }
}

/// Owns the pipeline object and forces it to Null exactly once
struct PipelineGuard {
    pipeline: gst::Pipeline,
    stopped: bool,
    teardown: Option<TeardownLog>,
}

impl PipelineGuard {
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            log::warn!("Failed to set pipeline {} to Null: {}", self.pipeline.name(), e);
        } else {
            log::debug!("Pipeline {} set to Null", self.pipeline.name());
        }
        if let Some(log) = &self.teardown {
            log.record(TeardownEvent::PipelineStopped);
        }
    }
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Parsed pipeline, not yet producing frames
pub struct CapturePipeline {
    guard: PipelineGuard,
    description: String,
}

impl CapturePipeline {
    /// Parse a gst-launch description
    ///
    /// # Errors
    /// [`HarnessError::Parse`] if GStreamer fails to initialize, the
    /// description names unknown elements or properties, or it does not
    /// describe a pipeline.
    pub fn parse(description: &str, teardown: Option<TeardownLog>) -> Result<Self> {
        gst::init().map_err(|e| HarnessError::Parse(format!("GStreamer init failed: {e}")))?;

        let pipeline = gst::parse::launch_full(description, None, gst::ParseFlags::FATAL_ERRORS)
            .map_err(|e| HarnessError::Parse(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| HarnessError::Parse("description does not form a pipeline".to_string()))?;

        log::debug!("Parsed pipeline {}: {}", pipeline.name(), description);

        Ok(Self {
            guard: PipelineGuard { pipeline, stopped: false, teardown },
            description: description.to_string(),
        })
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Set the pipeline to Playing
    ///
    /// # Errors
    /// [`HarnessError::PipelineState`] if the transition is rejected. The
    /// pipeline is forced back to Null before the error is returned.
    pub fn play(self) -> Result<PlayingPipeline> {
        let Self { guard, description } = self;

        if let Err(e) = guard.pipeline.set_state(gst::State::Playing) {
            let detail = bus_error(&guard.pipeline).unwrap_or_else(|| e.to_string());
            return Err(HarnessError::PipelineState(detail));
        }

        log::info!("▶️  Pipeline playing: {}", description);
        Ok(PlayingPipeline { guard, description })
    }
}

/// Pipeline that has been set to Playing
pub struct PlayingPipeline {
    guard: PipelineGuard,
    description: String,
}

impl PlayingPipeline {
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn current_state(&self) -> gst::State {
        self.guard.pipeline.current_state()
    }

    /// Look up a named appsink
    ///
    /// # Errors
    /// [`HarnessError::Lookup`] if no element has that name or it is not an appsink.
    pub fn sink(&self, name: &str) -> Result<SinkEndpoint<'_>> {
        let appsink = self
            .guard
            .pipeline
            .by_name(name)
            .ok_or_else(|| HarnessError::Lookup(format!("no element named `{name}`")))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| HarnessError::Lookup(format!("element `{name}` is not an appsink")))?;

        Ok(SinkEndpoint {
            name: name.to_string(),
            appsink,
            pipeline: &self.guard.pipeline,
        })
    }

    /// Force the pipeline to Null now
    pub fn stop(mut self) {
        self.guard.stop();
    }
}

/// Named appsink of a playing pipeline
pub struct SinkEndpoint<'p> {
    name: String,
    appsink: gst_app::AppSink,
    pipeline: &'p gst::Pipeline,
}

impl SinkEndpoint<'_> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FrameSource for SinkEndpoint<'_> {
    fn pull(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        if let Some(err) = bus_error(self.pipeline) {
            return Err(HarnessError::PipelineState(err));
        }

        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        match self.appsink.try_pull_sample(gst::ClockTime::from_mseconds(millis)) {
            Some(sample) => frame_from_sample(&sample).map(Some),
            None if self.appsink.is_eos() => Err(HarnessError::EndOfStream(self.name.clone())),
            None => Ok(None),
        }
    }
}

/// Copy a sample's buffer into a packed [`Frame`] using the caps geometry
fn frame_from_sample(sample: &gst::Sample) -> Result<Frame> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| HarnessError::PipelineState("sample without buffer".to_string()))?;
    let map = buffer
        .map_readable()
        .map_err(|e| HarnessError::PipelineState(format!("unreadable buffer: {e}")))?;

    let Some(info) = sample.caps().and_then(|caps| gst_video::VideoInfo::from_caps(caps).ok()) else {
        // No usable caps: hand the bytes over as-is, assembly validates them
        return Ok(Frame::new(map.as_slice().to_vec(), 0, 0, gst_video::VideoFormat::Unknown));
    };

    let width = info.width();
    let height = info.height();
    let data = match (info.n_planes(), info.format_info().pixel_stride().first()) {
        (1, Some(&pstride)) if pstride > 0 => {
            let row_bytes = width as usize * pstride as usize;
            let stride = usize::try_from(info.stride()[0]).unwrap_or(row_bytes).max(row_bytes);
            strip_row_padding(map.as_slice(), row_bytes, stride, height as usize)
        }
        _ => map.as_slice().to_vec(),
    };

    Ok(Frame::new(data, width, height, info.format()))
}

/// First error message waiting on the pipeline bus, if any
fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
        gst::MessageView::Error(err) => {
            let src = err
                .src()
                .map_or_else(|| "pipeline".to_string(), |s| s.path_string().to_string());
            Some(match err.debug() {
                Some(debug) => format!("{src}: {} ({debug})", err.error()),
                None => format!("{src}: {}", err.error()),
            })
        }
        _ => None,
    }
}
