//! Error taxonomy for the capture harness
//!
//! Every variant is terminal for the scenario that hit it. The only condition
//! that is ever retried (display socket not listening yet) never surfaces here.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the library
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("display {display} not reachable after {timeout:?}")]
    ConnectTimeout { display: String, timeout: Duration },

    #[error("cannot connect to display {display}: {reason}")]
    ConnectFatal { display: String, reason: String },

    #[error("failed to start `{command}`: {source}")]
    ProcessStart {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline description: {0}")]
    Parse(String),

    #[error("pipeline state change rejected: {0}")]
    PipelineState(String),

    #[error("element lookup failed: {0}")]
    Lookup(String),

    #[error("frame holds {actual} bytes but {width}x{height} RGBA needs {expected}")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("no frame accepted after {frames_seen} frames in {waited:?}")]
    NeverAccepted { frames_seen: usize, waited: Duration },

    #[error("sink `{0}` reached end of stream")]
    EndOfStream(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Scenario stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Acquisition,
    Launch,
    Parse,
    Playback,
    Sampling,
    Export,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Acquisition => "acquisition",
            Stage::Launch => "launch",
            Stage::Parse => "parse",
            Stage::Playback => "playback",
            Stage::Sampling => "sampling",
            Stage::Export => "export",
        };
        f.write_str(name)
    }
}

/// A harness error tagged with the stage that produced it
#[derive(Error, Debug)]
#[error("{stage} stage failed: {source}")]
pub struct ScenarioError {
    pub stage: Stage,
    #[source]
    pub source: HarnessError,
}

impl ScenarioError {
    #[must_use]
    pub fn new(stage: Stage, source: HarnessError) -> Self {
        Self { stage, source }
    }
}

/// Attach a stage to a harness result
pub trait StageExt<T> {
    fn stage(self, stage: Stage) -> Result<T, ScenarioError>;
}

impl<T> StageExt<T> for Result<T, HarnessError> {
    fn stage(self, stage: Stage) -> Result<T, ScenarioError> {
        self.map_err(|e| ScenarioError::new(stage, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_error_names_stage() {
        let err: Result<(), _> = Err(HarnessError::Parse("no element \"nosuchsrc\"".into()));
        let err = err.stage(Stage::Parse).unwrap_err();
        assert_eq!(err.stage, Stage::Parse);
        assert_eq!(
            err.to_string(),
            "parse stage failed: invalid pipeline description: no element \"nosuchsrc\""
        );
    }

    #[test]
    fn test_size_mismatch_message() {
        let err = HarnessError::SizeMismatch { width: 2, height: 2, expected: 16, actual: 12 };
        assert_eq!(err.to_string(), "frame holds 12 bytes but 2x2 RGBA needs 16");
    }
}
