use std::sync::Arc;
use std::time::{Duration, Instant};

use binocle::capture::{exchange, Eye, FrameFormat, FramePublisher, StereoIds, StereoReader};
use binocle::display::headless::{self, HeadlessProbe, HeadlessShared, HeadlessSurface};
use binocle::display::WorkerPool;
use binocle::{DisplayConfig, RenderMode};

const FORMAT: FrameFormat = FrameFormat::rgb(16, 8);

fn stereo() -> (FramePublisher, FramePublisher, StereoReader) {
    let (left, left_reader) = exchange(Eye::Left, FORMAT);
    let (right, right_reader) = exchange(Eye::Right, FORMAT);
    (left, right, StereoReader::new(left_reader, right_reader))
}

fn frame(byte: u8) -> Vec<u8> {
    vec![byte; FORMAT.frame_len()]
}

#[test]
fn barrier_completes_every_surface_each_generation() {
    let (mut left, mut right, frames) = stereo();
    left.publish(&frame(1)).unwrap();
    right.publish(&frame(2)).unwrap();

    let probe = HeadlessProbe::new(4);
    let surfaces: Vec<_> = (0..4)
        .map(|i| HeadlessSurface::new(i, FORMAT, Duration::ZERO, probe.clone()))
        .collect();
    let mut pool = WorkerPool::new(surfaces, frames, 1, false)
        .unwrap()
        .with_shared_resources(Arc::new(HeadlessShared::new(probe.clone())));

    for generation in 1..=10 {
        left.publish(&frame(generation as u8)).unwrap();
        let report = pool.render_all_surfaces_parallel().unwrap();
        assert_eq!(report.generation, generation);
        assert_eq!(report.completed, 4);
        assert!(report.rendered.iter().all(|&g| g == generation));
        assert_eq!(report.presented().newest, StereoIds::new(generation + 1, 1));
    }
    for surface in 0..4 {
        assert_eq!(probe.presents(surface), 10);
        assert_eq!(probe.last_uploaded(surface, Eye::Left), 11);
        assert_eq!(probe.last_uploaded(surface, Eye::Right), 1);
    }

    pool.shutdown().unwrap();
    assert_eq!(probe.surfaces_released(), 4);
    assert_eq!(probe.shared_releases(), 1);
}

#[test]
fn serial_and_parallel_modes_present_on_every_surface() {
    for mode in [RenderMode::Parallel, RenderMode::Serial] {
        let (mut left, mut right, frames) = stereo();
        left.publish(&frame(3)).unwrap();
        right.publish(&frame(4)).unwrap();

        let config = DisplayConfig {
            backend: binocle::BackendKind::Headless,
            mode,
            surfaces: 3,
            simulated_gpu_us: 20_000,
            ..Default::default()
        };
        let (mut backend, probe) = headless::initialize(&config, FORMAT, frames).unwrap();

        assert_eq!(backend.surface_count(), 3);
        let presented = backend.render_and_present().unwrap();
        assert_eq!(presented.surfaces, 3);
        assert_eq!(presented.newest, StereoIds::new(1, 1));
        assert_eq!(presented.oldest, StereoIds::new(1, 1));
        assert!(backend.is_saturated());

        // Markers resolve once the simulated GPU time has passed.
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut samples = Vec::new();
        while samples.len() < 3 && Instant::now() < deadline {
            samples.extend(backend.poll_completed());
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(samples.len(), 3, "{mode:?}");
        assert!(samples.iter().all(|s| s.submit_to_complete.is_some()));
        assert!(!backend.is_saturated());

        backend.shutdown().unwrap();
        assert_eq!(probe.surfaces_released(), 3);
        assert_eq!(probe.shared_releases(), 1);
        for surface in 0..3 {
            assert_eq!(probe.presents(surface), 1);
        }
    }
}

#[test]
fn dropping_the_backend_releases_shared_resources_once() {
    let (_left, _right, frames) = stereo();
    let config = DisplayConfig {
        backend: binocle::BackendKind::Headless,
        surfaces: 2,
        ..Default::default()
    };
    let (mut backend, probe) = headless::initialize(&config, FORMAT, frames).unwrap();

    // Not-ready streams still present, showing blank textures.
    assert_eq!(backend.render_and_present().unwrap().surfaces, 2);
    backend.shutdown().unwrap();
    drop(backend);

    assert_eq!(probe.shared_releases(), 1);
    assert_eq!(probe.surfaces_released(), 2);
}
