use std::time::Duration;

use binocle::capture::{Eye, TestPattern};
use binocle::display::headless;
use binocle::lifecycle::JoinOutcome;
use binocle::pipeline::PipelineEvent;
use binocle::record::MjpegFileSink;
use binocle::viewer::ThreadReport;
use binocle::{BackendKind, Config, RenderMode, SourceKind, Viewer};

fn pattern_config() -> Config {
    let mut config = Config::default();
    config.capture.source = SourceKind::Pattern;
    config.capture.width = 64;
    config.capture.height = 32;
    config.capture.acquire_interval_ms = 17;
    config.display.backend = BackendKind::Headless;
    config.display.mode = RenderMode::Parallel;
    config.display.surfaces = 2;
    config.display.simulated_gpu_us = 2000;
    config
}

fn start(config: Config) -> Viewer {
    let format = config.capture.frame_format();
    let mut viewer = Viewer::new(config);
    for eye in Eye::BOTH {
        let source = TestPattern::new(eye.name(), format).with_phase(eye.index() as u8 * 128);
        viewer.spawn_capture(eye, Box::new(source)).unwrap();
    }
    viewer
}

#[test]
fn pattern_cameras_reach_every_surface() {
    let config = pattern_config();
    let format = config.capture.frame_format();
    let mut viewer = start(config.clone());
    let events = viewer.events();

    let (backend, probe) = headless::initialize(&config.display, format, viewer.frames()).unwrap();
    let report = viewer.run(backend, Some(Duration::from_millis(100))).unwrap();
    let stats = viewer.stats();
    let outcomes = viewer.shutdown();

    assert!(report.observed[0] >= 5, "{report:?}");
    assert!(report.observed[1] >= 5, "{report:?}");
    assert!(report.submitted >= 1);
    assert_eq!(report.render_failures, 0);
    assert_eq!(stats.submitted_frames, report.submitted);
    assert_eq!(stats.dropped_frames, report.dropped);

    for surface in 0..2 {
        assert_eq!(probe.presents(surface), report.submitted);
    }
    assert_eq!(probe.surfaces_released(), 2);
    assert_eq!(probe.shared_releases(), 1);

    let latencies: Vec<Duration> = events
        .drain()
        .filter_map(|event| match event {
            PipelineEvent::Latency(sample) => sample.submit_to_complete,
            _ => None,
        })
        .collect();
    assert!(!latencies.is_empty());
    assert!(latencies.iter().any(|l| *l < Duration::from_millis(50)));

    assert_eq!(outcomes.len(), 2);
    for (name, outcome) in &outcomes {
        assert!(outcome.is_finished(), "{name} did not stop");
    }
}

#[test]
fn closing_the_window_stops_the_run() {
    let mut config = pattern_config();
    config.display.mode = RenderMode::Serial;
    let format = config.capture.frame_format();
    let mut viewer = start(config.clone());

    let (backend, probe) = headless::initialize(&config.display, format, viewer.frames()).unwrap();
    probe.request_close();
    let report = viewer.run(backend, Some(Duration::from_secs(5))).unwrap();
    viewer.shutdown();

    assert!(report.close_requested);
    assert_eq!(probe.surfaces_released(), 2);
}

#[test]
fn recorder_writes_side_by_side_segments() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = pattern_config();
    config.record.enabled = true;
    config.record.directory = dir.path().to_path_buf();
    config.record.fps = 50;
    let format = config.capture.frame_format();

    let mut viewer = start(config.clone());
    viewer
        .spawn_recorder(Box::new(MjpegFileSink::new(&config.record).unwrap()))
        .unwrap();

    let (backend, _probe) = headless::initialize(&config.display, format, viewer.frames()).unwrap();
    viewer.run(backend, Some(Duration::from_millis(200))).unwrap();
    let outcomes = viewer.shutdown();

    let recorded = outcomes
        .iter()
        .find_map(|(_, outcome)| match outcome {
            JoinOutcome::Finished(ThreadReport::Record(report)) => Some(report.clone()),
            _ => None,
        })
        .expect("recorder report");
    assert!(recorded.frames_written >= 2, "{recorded:?}");
    assert_eq!(recorded.write_failures, 0);

    let segments: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(segments.len(), 1);
    let bytes = std::fs::read(&segments[0]).unwrap();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
}
