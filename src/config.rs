//! Harness configuration
//!
//! Defaults reproduce the stock scenario (`Xvfb :99` at 50x50x24 with `xeyes`).
//! Every field can be overridden through `HARNESS_*` environment variables;
//! binaries load a `.env` file first.

use std::path::PathBuf;
use std::time::Duration;

use crate::display::DisplayConfig;
use crate::error::{HarnessError, Result};
use crate::pipeline::CropRegion;
use crate::process::ProcessSpec;
use crate::sampler::{SamplePolicy, DEFAULT_MAX_WAIT};

pub const ENV_DISPLAY: &str = "HARNESS_DISPLAY";
pub const ENV_SCREEN: &str = "HARNESS_SCREEN";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "HARNESS_CONNECT_TIMEOUT_MS";
pub const ENV_SERVER_BIN: &str = "HARNESS_SERVER_BIN";
pub const ENV_SUBJECT: &str = "HARNESS_SUBJECT";
pub const ENV_SAMPLE_TIMEOUT_MS: &str = "HARNESS_SAMPLE_TIMEOUT_MS";
pub const ENV_OUTPUT_DIR: &str = "HARNESS_OUTPUT_DIR";
pub const ENV_CROP: &str = "HARNESS_CROP";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub display: DisplayConfig,
    /// Program launched on the display; `None` captures the bare root window
    pub subject: Option<ProcessSpec>,
    pub sample_max_wait: Duration,
    pub output_dir: PathBuf,
    /// Sub-rectangle for the second (cropped) capture
    pub crop: CropRegion,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let (width, height) = (50, 50);
        Self {
            display: DisplayConfig::new(":99", width, height, 24),
            subject: Some(
                ProcessSpec::new("xeyes").args(["-geometry".to_string(), format!("{width}x{height}")]),
            ),
            sample_max_wait: DEFAULT_MAX_WAIT,
            output_dir: PathBuf::from("."),
            crop: CropRegion::new(0, 0, 30, 30),
        }
    }
}

impl HarnessConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = lookup(ENV_DISPLAY) {
            config.display.id = id;
        }
        if let Some(screen) = lookup(ENV_SCREEN) {
            let (w, h, d) = parse_screen(&screen)?;
            config.display.width = w;
            config.display.height = h;
            config.display.depth = d;
        }
        if let Some(ms) = lookup(ENV_CONNECT_TIMEOUT_MS) {
            config.display.timeout = parse_millis(ENV_CONNECT_TIMEOUT_MS, &ms)?;
        }
        if let Some(bin) = lookup(ENV_SERVER_BIN) {
            config.display.server_binary = bin;
        }
        if let Some(subject) = lookup(ENV_SUBJECT) {
            config.subject = if subject.trim().is_empty() {
                None
            } else {
                Some(ProcessSpec::parse_command_line(&subject)?)
            };
        }
        if let Some(ms) = lookup(ENV_SAMPLE_TIMEOUT_MS) {
            config.sample_max_wait = parse_millis(ENV_SAMPLE_TIMEOUT_MS, &ms)?;
        }
        if let Some(dir) = lookup(ENV_OUTPUT_DIR) {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(crop) = lookup(ENV_CROP) {
            config.crop = CropRegion::parse(&crop)?;
        }
        config.crop.check_within((config.display.width, config.display.height))?;

        Ok(config)
    }

    #[must_use]
    pub fn sample_policy(&self) -> SamplePolicy {
        SamplePolicy::default().max_wait(self.sample_max_wait)
    }
}

/// `WxHxD`, e.g. `50x50x24`
fn parse_screen(value: &str) -> Result<(u32, u32, u32)> {
    let parts: Vec<u32> = value
        .split('x')
        .map(|p| p.trim().parse())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| HarnessError::Config(format!("{ENV_SCREEN}: expected WxHxD, got `{value}`")))?;
    match parts.as_slice() {
        &[w, h, d] if w > 0 && h > 0 && d > 0 => Ok((w, h, d)),
        _ => Err(HarnessError::Config(format!("{ENV_SCREEN}: expected WxHxD, got `{value}`"))),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse()
        .map(Duration::from_millis)
        .map_err(|_| HarnessError::Config(format!("{key}: expected milliseconds, got `{value}`")))
}
