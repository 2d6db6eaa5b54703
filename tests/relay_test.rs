//! End-to-end tests of the relay service API

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use futures_util::StreamExt;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageBuffer, Rgb};
use mjpeg_relay::config::RelayConfig;
use mjpeg_relay::{FrameInput, FrameRelay, PumpError, RelayError, StreamOptions};

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Helper to create a gradient JPEG
fn create_test_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90)
        .encode(img.as_raw(), width, height, ExtendedColorType::Rgb8)
        .unwrap();
    out
}

fn jpeg_from_chunk(chunk: &[u8]) -> &[u8] {
    assert!(chunk.starts_with(PART_HEADER), "chunk missing part header");
    assert!(chunk.ends_with(b"\r\n"), "chunk missing trailer");
    &chunk[PART_HEADER.len()..chunk.len() - 2]
}

#[tokio::test]
async fn test_send_base64_then_stream() {
    let relay = FrameRelay::from_config(&RelayConfig::default());
    let jpeg_b64 = STANDARD.encode(create_test_jpeg(800, 600));

    relay.send_frame("cam1", jpeg_b64.into()).await.unwrap();

    let response = relay
        .get_stream("cam1", StreamOptions::default().with_freq(10.0))
        .unwrap();
    assert_eq!(response.status.as_u16(), 206);

    let mut body = response.body;
    // The first tick fires immediately. The 2s bound covers decoding, resizing
    // and re-encoding an 800x600 JPEG in an unoptimised test build; release
    // builds deliver well inside one 100ms period.
    let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .expect("first chunk")
        .unwrap()
        .unwrap();

    let out = image::load_from_memory(jpeg_from_chunk(&chunk)).unwrap();
    assert_eq!(out.width(), 680);
    assert_eq!(out.height(), 510);
}

#[tokio::test]
async fn test_first_chunk_does_not_wait_for_period() {
    let relay = FrameRelay::from_config(&RelayConfig::default());
    relay
        .send_frame("cam1", FrameInput::Raw(Bytes::from(create_test_jpeg(64, 48))))
        .await
        .unwrap();

    // One chunk every 5s; the first must not wait for a full period
    let mut body = relay
        .get_stream("cam1", StreamOptions::default().with_freq(0.2))
        .unwrap()
        .body;
    let started = std::time::Instant::now();
    let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .expect("first chunk before the first period elapses")
        .unwrap()
        .unwrap();

    assert!(chunk.starts_with(PART_HEADER));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_missing_stream_yields_nothing() {
    let relay = FrameRelay::from_config(&RelayConfig::default());

    let response = relay.get_stream("missing", StreamOptions::default()).unwrap();
    let mut body = response.body;

    let result = tokio::time::timeout(Duration::from_millis(200), body.next()).await;
    assert!(result.is_err(), "expected no chunks for a missing stream");
}

#[tokio::test]
async fn test_zero_frequency_fails_fast() {
    let relay = FrameRelay::from_config(&RelayConfig::default());

    let result = relay.get_stream("cam1", StreamOptions::default().with_freq(0.0));
    assert!(matches!(
        result,
        Err(RelayError::Pump(PumpError::InvalidFrequency(f))) if f == 0.0
    ));
}

#[tokio::test]
async fn test_all_input_shapes_share_canonical_form() {
    let relay = FrameRelay::from_config(&RelayConfig::default());
    let jpeg = create_test_jpeg(64, 48);
    let expected = Bytes::from(STANDARD.encode(&jpeg));

    relay
        .send_frame("text", STANDARD.encode(&jpeg).into())
        .await
        .unwrap();
    relay
        .send_frame("raw", FrameInput::Raw(Bytes::from(jpeg.clone())))
        .await
        .unwrap();

    let chunks: Vec<std::io::Result<Bytes>> = jpeg
        .chunks(100)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    relay
        .send_frame(
            "upload",
            FrameInput::Upload(futures_util::stream::iter(chunks).boxed()),
        )
        .await
        .unwrap();

    for id in ["text", "raw", "upload"] {
        assert_eq!(relay.store().get(id).unwrap().payload, expected, "stream {}", id);
    }
}

#[tokio::test]
async fn test_viewer_sees_latest_frame_only() {
    let relay = FrameRelay::from_config(&RelayConfig::default());
    relay
        .send_frame("cam", FrameInput::Raw(Bytes::from(create_test_jpeg(100, 100))))
        .await
        .unwrap();
    relay
        .send_frame("cam", FrameInput::Raw(Bytes::from(create_test_jpeg(200, 100))))
        .await
        .unwrap();

    let mut body = relay
        .get_stream("cam", StreamOptions::default())
        .unwrap()
        .body;
    let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // 200x100 scaled to 680 wide
    let out = image::load_from_memory(jpeg_from_chunk(&chunk)).unwrap();
    assert_eq!((out.width(), out.height()), (680, 340));
}

#[tokio::test]
async fn test_bad_frame_keeps_stream_alive() {
    let relay = FrameRelay::from_config(&RelayConfig::default());
    relay.send_frame("cam", "bm90IGFuIGltYWdl".into()).await.unwrap();

    let mut body = relay
        .get_stream("cam", StreamOptions::default().with_freq(50.0))
        .unwrap()
        .body;

    let idle = tokio::time::timeout(Duration::from_millis(150), body.next()).await;
    assert!(idle.is_err(), "undecodable frame must not produce chunks");

    relay
        .send_frame("cam", FrameInput::Raw(Bytes::from(create_test_jpeg(32, 32))))
        .await
        .unwrap();

    let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .expect("stream resumes after a good frame")
        .unwrap()
        .unwrap();
    assert!(chunk.starts_with(PART_HEADER));
    assert!(relay.stats().snapshot().codec_failures > 0);
}

#[tokio::test]
async fn test_disconnect_releases_pump_and_keeps_record() {
    let relay = FrameRelay::from_config(&RelayConfig::default());
    relay
        .send_frame("cam", FrameInput::Raw(Bytes::from(create_test_jpeg(32, 32))))
        .await
        .unwrap();

    let mut bodies = Vec::new();
    for _ in 0..3 {
        let mut body = relay
            .get_stream("cam", StreamOptions::default().with_freq(100.0))
            .unwrap()
            .body;
        body.next().await.unwrap().unwrap();
        bodies.push(body);
    }
    assert_eq!(relay.stats().active_viewers(), 3);

    drop(bodies);
    for _ in 0..100 {
        if relay.stats().active_viewers() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.stats().active_viewers(), 0);
    assert_eq!(relay.store().get("cam").unwrap().seq, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_and_viewers() {
    let relay = Arc::new(FrameRelay::from_config(&RelayConfig::default()));
    let frames: Vec<Bytes> = (1..=4)
        .map(|i| Bytes::from(create_test_jpeg(16 * i, 16)))
        .collect();
    let allowed: Vec<Bytes> = frames
        .iter()
        .map(|f| Bytes::from(STANDARD.encode(f)))
        .collect();

    let mut producers = Vec::new();
    for frame in frames.clone() {
        let relay = Arc::clone(&relay);
        producers.push(tokio::spawn(async move {
            for _ in 0..50 {
                relay
                    .send_frame("shared", FrameInput::Raw(frame.clone()))
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }

    let mut readers = Vec::new();
    for _ in 0..4 {
        let relay = Arc::clone(&relay);
        let allowed = allowed.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..200 {
                if let Some(frame) = relay.store().get("shared") {
                    assert!(allowed.contains(&frame.payload), "torn or unknown payload");
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for handle in producers.into_iter().chain(readers) {
        handle.await.unwrap();
    }

    assert_eq!(relay.store().get("shared").unwrap().seq, 200);
}
