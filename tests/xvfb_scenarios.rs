//! End-to-end scenarios against a real Xvfb
//!
//! Each test uses its own display id and self-skips when `Xvfb`, `xeyes` or
//! the `ximagesrc` GStreamer element is not installed.
//!
//! ```bash
//! RUST_LOG=debug cargo test --test xvfb_scenarios -- --nocapture
//! ```

use std::path::Path;
use std::time::Duration;

use gstreamer as gst;
use xvfb_capture_harness::process::is_alive;
use xvfb_capture_harness::scenario::{run_scenario, CaptureRequest, PipelineSource};
use xvfb_capture_harness::{
    CropRegion, DisplayConfig, DisplayHandle, HarnessConfig, HarnessError, ProcessRole, SamplePolicy, Stage,
    TeardownEvent, TeardownLog,
};

fn on_path(binary: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}

fn environment_ready() -> bool {
    let ready = on_path("Xvfb")
        && on_path("xeyes")
        && gst::init().is_ok()
        && gst::ElementFactory::find("ximagesrc").is_some();
    if !ready {
        eprintln!("skipping: Xvfb, xeyes or ximagesrc not available");
    }
    ready
}

fn config_for(display: &str) -> HarnessConfig {
    HarnessConfig {
        display: DisplayConfig::new(display, 50, 50, 24).timeout(Duration::from_secs(5)),
        ..HarnessConfig::default()
    }
}

fn policy() -> SamplePolicy {
    SamplePolicy::default().max_wait(Duration::from_secs(15))
}

fn assert_nothing_left(log: &TeardownLog) {
    for pid in log.killed_pids() {
        assert!(!is_alive(pid), "pid {pid} still running after the scenario");
    }
}

#[test]
fn full_frame_capture_is_50x50_with_content() {
    if !environment_ready() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("image1.png");
    let log = TeardownLog::new();
    let config = config_for(":151");

    let request = CaptureRequest::ximage("full", None, &output).policy(policy());
    let outcomes = run_scenario(&config, &[request], Some(log.clone())).unwrap();

    assert_eq!((outcomes[0].width, outcomes[0].height), (50, 50));
    let image = image::open(&output).unwrap().into_rgba8();
    assert_eq!(image.dimensions(), (50, 50));
    assert!(image.as_raw().iter().any(|&b| b != 0));
    assert_nothing_left(&log);
}

#[test]
fn cropped_capture_is_exactly_30x30() {
    if !environment_ready() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("image2.png");
    let config = config_for(":152");

    let request = CaptureRequest::ximage("crop", Some(CropRegion::new(0, 0, 30, 30)), &output).policy(policy());
    run_scenario(&config, &[request], None).unwrap();

    let image = image::open(&output).unwrap().into_rgba8();
    assert_eq!(image.dimensions(), (30, 30));
}

#[test]
fn pipeline_stops_before_display_server_is_killed() {
    if !environment_ready() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let log = TeardownLog::new();
    let config = config_for(":153");

    let requests = [
        CaptureRequest::ximage("full", None, dir.path().join("a.png")).policy(policy()),
        CaptureRequest::ximage("crop", Some(CropRegion::new(0, 0, 30, 30)), dir.path().join("b.png"))
            .policy(policy()),
    ];
    run_scenario(&config, &requests, Some(log.clone())).unwrap();

    let is_server = |e: &TeardownEvent| {
        matches!(e, TeardownEvent::ProcessKilled { role: ProcessRole::DisplayServer, .. })
    };
    let is_subject =
        |e: &TeardownEvent| matches!(e, TeardownEvent::ProcessKilled { role: ProcessRole::Subject, .. });

    let server_killed = log.first_at(is_server).unwrap();
    let subject_killed = log.first_at(is_subject).unwrap();
    let stops: Vec<_> = log
        .records()
        .into_iter()
        .filter(|r| r.event == TeardownEvent::PipelineStopped)
        .collect();

    assert_eq!(stops.len(), 2);
    for stop in &stops {
        assert!(stop.at <= subject_killed);
        assert!(stop.at <= server_killed);
    }
    assert!(subject_killed <= server_killed);
    assert_nothing_left(&log);
}

#[test]
fn unknown_element_fails_parse_and_cleans_up() {
    if !environment_ready() {
        return;
    }
    let log = TeardownLog::new();
    let config = config_for(":154");
    let request = CaptureRequest {
        name: "broken".to_string(),
        source: PipelineSource::Custom {
            description: "nosuchelement4711 ! videoconvert ! appsink name=dst".to_string(),
            sink: "dst".to_string(),
            width: 50,
            height: 50,
        },
        output: Path::new("never-written.png").to_path_buf(),
        policy: policy(),
    };

    let err = run_scenario(&config, &[request], Some(log.clone())).unwrap_err();

    assert_eq!(err.stage, Stage::Parse);
    assert!(matches!(err.source, HarnessError::Parse(_)));
    assert_eq!(log.killed_pids().len(), 2);
    assert_nothing_left(&log);
    assert!(!Path::new("never-written.png").exists());
}

#[test]
fn display_already_served_is_refused() {
    if !environment_ready() {
        return;
    }
    let log = TeardownLog::new();
    let config = config_for(":155");
    let first = DisplayHandle::acquire_blocking(&config.display, None).unwrap();

    let err = DisplayHandle::acquire_blocking(&config.display, Some(log.clone())).unwrap_err();

    assert!(matches!(err, HarnessError::ConnectFatal { .. }), "got {err:?}");
    // the second server was never started
    assert!(log.killed_pids().is_empty());
    assert!(is_alive(first.server_pid()));
}
