use std::time::{Duration, Instant};

use num_complex::Complex64;

use framepipe::capture::{PixelFormat, SyntheticCamera};
use framepipe::{
    CaptureConfig, Config, ImageQueue, Pipeline, PipelineConfig, StageError, StorageConfig,
    TransformConfig, WaitStatus,
};

const WIDTH: u32 = 8;
const HEIGHT: u32 = 4;

fn config(storage: Option<StorageConfig>, transform: Option<TransformConfig>) -> Config {
    Config {
        capture: CaptureConfig {
            width: WIDTH,
            height: HEIGHT,
            fps: 200,
            format: PixelFormat::Mono8,
            buffer_count: 4,
            frame_limit: Some(6),
            elevate_priority: false,
            pin_core: None,
        },
        pipeline: PipelineConfig {
            queue_capacity: 64,
            wait_timeout_ms: 20,
            ..Default::default()
        },
        storage,
        transform,
    }
}

fn build(config: &Config) -> Result<Pipeline, StageError> {
    let (control, stream) = SyntheticCamera::open(&config.capture);
    Pipeline::build(config, control, stream)
}

/// Sum of the synthetic test pattern for one frame
fn pattern_sum(sequence: u64) -> f64 {
    let mut sum = 0.0;
    for y in 0..HEIGHT as u64 {
        for x in 0..WIDTH as u64 {
            sum += f64::from((x + y + sequence) as u8);
        }
    }
    sum
}

#[test]
fn test_source_to_disk_to_transform() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frames.bin");
    let config = config(
        Some(StorageConfig {
            path: path.clone(),
            pass_through: true,
        }),
        Some(TransformConfig {
            width: WIDTH as usize,
            height: HEIGHT as usize,
            indices: vec![0, -1],
        }),
    );

    let pipeline = build(&config).unwrap();
    pipeline.start().unwrap();

    let transform = pipeline.transform().unwrap();
    assert_eq!(
        transform.wait_images(6, Duration::from_secs(10)),
        WaitStatus::Satisfied
    );

    let extracts = transform.get_images(6).unwrap();
    for (expected, extract) in extracts.iter().enumerate() {
        assert_eq!(extract.sequence, expected as u64);
        assert_eq!(extract.coefficients.len(), 2);
        let dc = Complex64::new(pattern_sum(extract.sequence), 0.0);
        assert!((extract.coefficients[0] - dc).norm() < 1e-9);
    }
    assert!(extracts.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    let writer = pipeline.writer().unwrap();
    assert_eq!(writer.written_images(), 6);
    assert!(pipeline.errors().is_empty());

    pipeline.stop().unwrap();
    pipeline.shutdown().unwrap();

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), 6 * (WIDTH * HEIGHT) as usize);
    assert_eq!(&written[..WIDTH as usize], &[0, 1, 2, 3, 4, 5, 6, 7]);

    let stats = pipeline.stats();
    assert_eq!(stats.source.pushed, 6);
    assert_eq!(stats.written_images, 6);
    assert_eq!(stats.processed_images, 6);
}

#[test]
fn test_source_only_output() {
    let pipeline = build(&config(None, None)).unwrap();
    pipeline.start().unwrap();

    let output = pipeline.frame_output().unwrap();
    assert_eq!(
        output.wait_images(6, Duration::from_secs(10)),
        WaitStatus::Satisfied
    );

    let last = output.get_last_image().unwrap();
    assert_eq!(last.sequence(), 5);
    assert_eq!(last.len(), (WIDTH * HEIGHT) as usize);
    assert_eq!(output.available_images(), 0);

    pipeline.shutdown().unwrap();
    pipeline.shutdown().unwrap();
}

#[test]
fn test_flush_empties_every_stage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frames.bin");
    let config = config(
        Some(StorageConfig {
            path: path.clone(),
            pass_through: true,
        }),
        None,
    );

    let pipeline = build(&config).unwrap();
    pipeline.start().unwrap();

    let output = pipeline.frame_output().unwrap();
    assert_eq!(
        output.wait_images(6, Duration::from_secs(10)),
        WaitStatus::Satisfied
    );

    pipeline.stop().unwrap();
    pipeline.flush().unwrap();

    let source = pipeline.source();
    assert_eq!(source.available_images(), 0);
    assert_eq!(output.available_images(), 0);
    assert_eq!(pipeline.writer().unwrap().written_images(), 0);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
}

#[test]
fn test_flush_while_frames_are_flowing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(
        Some(StorageConfig {
            path: dir.path().join("frames.bin"),
            pass_through: true,
        }),
        Some(TransformConfig {
            width: WIDTH as usize,
            height: HEIGHT as usize,
            indices: vec![0],
        }),
    );
    config.capture.frame_limit = None;
    config.capture.fps = 1000;

    let pipeline = build(&config).unwrap();
    pipeline.start().unwrap();
    let transform = pipeline.transform().unwrap();

    let mut last = None;
    let mut received = 0;
    for _ in 0..20 {
        let deadline = Instant::now() + Duration::from_millis(20);
        while Instant::now() < deadline {
            if transform.wait_images(1, Duration::from_millis(20)) == WaitStatus::Satisfied {
                let extract = transform
                    .get_image()
                    .expect("satisfied wait left nothing to pop");
                assert!(last.map_or(true, |last| extract.sequence > last));
                last = Some(extract.sequence);
                received += 1;
            }
        }
        pipeline.flush().unwrap();
    }

    pipeline.stop().unwrap();
    pipeline.shutdown().unwrap();

    assert!(received > 0);
    assert_eq!(pipeline.errors(), Vec::<(&str, String)>::new());
}

#[test]
fn test_transform_behind_a_sink_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(
        Some(StorageConfig {
            path: dir.path().join("frames.bin"),
            pass_through: false,
        }),
        Some(TransformConfig {
            width: WIDTH as usize,
            height: HEIGHT as usize,
            indices: vec![0],
        }),
    );

    assert!(matches!(
        build(&config),
        Err(StageError::InvalidPipeline(_))
    ));
}
