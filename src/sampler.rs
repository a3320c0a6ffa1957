//! Frame sampling
//!
//! A virtual display typically emits a run of all-black frames before the
//! subject's window is composited. [`FrameSampler`] keeps pulling until a
//! frame satisfies the acceptance predicate, bounded by a deadline and an
//! optional frame budget, and reports [`HarnessError::NeverAccepted`] instead
//! of blocking forever.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use image::RgbaImage;

use crate::error::{HarnessError, Result};
use crate::frame::Frame;

/// Default upper bound on the whole sampling phase
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

/// Default timeout of a single pull
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_millis(500);

/// Anything frames can be pulled from
pub trait FrameSource {
    /// Wait up to `timeout` for the next frame. `Ok(None)` means nothing arrived in time.
    fn pull(&mut self, timeout: Duration) -> Result<Option<Frame>>;
}

pub type FramePredicate = Arc<dyn Fn(&Frame) -> bool + Send + Sync>;

/// Default acceptance predicate: at least one non-zero byte
#[must_use]
pub fn not_blank(frame: &Frame) -> bool {
    !frame.is_blank()
}

/// Acceptance predicate and wait bounds
#[derive(Clone)]
pub struct SamplePolicy {
    pub predicate: FramePredicate,
    pub max_wait: Duration,
    /// Stop after this many frames were rejected; `None` for no limit
    pub max_frames: Option<usize>,
    pub pull_timeout: Duration,
}

impl Default for SamplePolicy {
    fn default() -> Self {
        Self {
            predicate: Arc::new(not_blank),
            max_wait: DEFAULT_MAX_WAIT,
            max_frames: None,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        }
    }
}

impl SamplePolicy {
    #[must_use]
    pub fn predicate(mut self, predicate: impl Fn(&Frame) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    #[must_use]
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    #[must_use]
    pub fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = Some(max_frames);
        self
    }

    #[must_use]
    pub fn pull_timeout(mut self, pull_timeout: Duration) -> Self {
        self.pull_timeout = pull_timeout;
        self
    }
}

impl fmt::Debug for SamplePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplePolicy")
            .field("max_wait", &self.max_wait)
            .field("max_frames", &self.max_frames)
            .field("pull_timeout", &self.pull_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FrameSampler {
    policy: SamplePolicy,
}

impl FrameSampler {
    #[must_use]
    pub fn new(policy: SamplePolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &SamplePolicy {
        &self.policy
    }

    /// Pull until a frame passes the predicate
    ///
    /// # Errors
    /// - [`HarnessError::NeverAccepted`] when the deadline or frame budget runs out
    /// - any error reported by the source (end of stream, pipeline error)
    pub fn pull_until_accepted(&self, source: &mut dyn FrameSource) -> Result<Frame> {
        let start = Instant::now();
        let deadline = start + self.policy.max_wait;
        let mut frames_seen = 0usize;

        loop {
            let now = Instant::now();
            let budget_spent = self.policy.max_frames.is_some_and(|max| frames_seen >= max);
            if now >= deadline || budget_spent {
                log::warn!("⚠️  No acceptable frame after {} frames in {:?}", frames_seen, start.elapsed());
                return Err(HarnessError::NeverAccepted {
                    frames_seen,
                    waited: start.elapsed(),
                });
            }

            let timeout = self.policy.pull_timeout.min(deadline - now);
            let Some(frame) = source.pull(timeout)? else {
                continue;
            };
            frames_seen += 1;

            if (self.policy.predicate)(&frame) {
                log::info!(
                    "📸 Accepted frame {} ({}x{} {:?}) after {:?}",
                    frames_seen,
                    frame.width(),
                    frame.height(),
                    frame.format(),
                    start.elapsed()
                );
                return Ok(frame);
            }
            log::debug!("Rejected frame {} ({} bytes)", frames_seen, frame.data().len());
        }
    }

    /// Pull an accepted frame and assemble it as a `width` x `height` RGBA image
    ///
    /// # Errors
    /// Sampling errors as in [`FrameSampler::pull_until_accepted`], or
    /// [`HarnessError::SizeMismatch`] if the frame does not fit the geometry.
    pub fn capture_rgba(&self, source: &mut dyn FrameSource, width: u32, height: u32) -> Result<RgbaImage> {
        self.pull_until_accepted(source)?.into_rgba_image(width, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a fixed script; an exhausted script behaves like a silent sink
    struct ScriptedSource {
        script: VecDeque<Result<Option<Frame>>>,
        pulls: usize,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Option<Frame>>>) -> Self {
            Self { script: script.into(), pulls: 0 }
        }
    }

    impl FrameSource for ScriptedSource {
        fn pull(&mut self, timeout: Duration) -> Result<Option<Frame>> {
            self.pulls += 1;
            match self.script.pop_front() {
                Some(step) => step,
                None => {
                    std::thread::sleep(timeout);
                    Ok(None)
                }
            }
        }
    }

    fn blank() -> Frame {
        Frame::rgba(vec![0; 4 * 4 * 4], 4, 4)
    }

    fn painted(value: u8) -> Frame {
        let mut data = vec![0; 4 * 4 * 4];
        data[17] = value;
        Frame::rgba(data, 4, 4)
    }

    #[test]
    fn test_skips_leading_blank_frames() {
        let mut source = ScriptedSource::new(vec![
            Ok(Some(blank())),
            Ok(None),
            Ok(Some(blank())),
            Ok(Some(painted(7))),
            Ok(Some(painted(9))),
        ]);

        let frame = FrameSampler::default().pull_until_accepted(&mut source).unwrap();

        assert_eq!(frame, painted(7));
        assert_eq!(source.pulls, 4);
    }

    #[test]
    fn test_never_returns_rejected_frame() {
        let policy = SamplePolicy::default().predicate(|f| f.data()[17] == 9);
        let mut source = ScriptedSource::new(vec![
            Ok(Some(painted(1))),
            Ok(Some(painted(2))),
            Ok(Some(painted(9))),
        ]);

        let frame = FrameSampler::new(policy).pull_until_accepted(&mut source).unwrap();
        assert_eq!(frame.data()[17], 9);
    }

    #[test]
    fn test_frame_budget_exhausted() {
        let policy = SamplePolicy::default().max_frames(3);
        let mut source = ScriptedSource::new((0..10).map(|_| Ok(Some(blank()))).collect());

        let err = FrameSampler::new(policy).pull_until_accepted(&mut source).unwrap_err();

        assert!(matches!(err, HarnessError::NeverAccepted { frames_seen: 3, .. }), "got {err:?}");
        assert_eq!(source.pulls, 3);
    }

    #[test]
    fn test_silent_source_hits_deadline() {
        let policy = SamplePolicy::default()
            .max_wait(Duration::from_millis(120))
            .pull_timeout(Duration::from_millis(20));
        let mut source = ScriptedSource::new(vec![Ok(Some(blank()))]);

        let start = Instant::now();
        let err = FrameSampler::new(policy).pull_until_accepted(&mut source).unwrap_err();

        assert!(matches!(err, HarnessError::NeverAccepted { frames_seen: 1, .. }), "got {err:?}");
        assert!(start.elapsed() >= Duration::from_millis(120));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_source_error_aborts() {
        let mut source = ScriptedSource::new(vec![
            Ok(Some(blank())),
            Err(HarnessError::EndOfStream("dst".into())),
            Ok(Some(painted(3))),
        ]);

        let err = FrameSampler::default().pull_until_accepted(&mut source).unwrap_err();
        assert!(matches!(err, HarnessError::EndOfStream(_)));
    }

    #[test]
    fn test_capture_rgba_checks_geometry() {
        let mut source = ScriptedSource::new(vec![Ok(Some(painted(5)))]);
        let img = FrameSampler::default().capture_rgba(&mut source, 4, 4).unwrap();
        assert_eq!(img.dimensions(), (4, 4));
        assert_eq!(img.get_pixel(0, 1).0, [0, 5, 0, 0]);

        let mut source = ScriptedSource::new(vec![Ok(Some(painted(5)))]);
        let err = FrameSampler::default().capture_rgba(&mut source, 3, 3).unwrap_err();
        assert!(matches!(err, HarnessError::SizeMismatch { .. }));
    }
}
