//! End-to-end tests of the session controller over an in-memory pipe.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use bioamp_rs::bioamp_client::{BioAmpClient, BioAmpConfig};
use bioamp_rs::error::{BioAmpError, Result};
use bioamp_rs::parse::encode_frame;
use bioamp_rs::protocol::{Command, NUM_CHANNELS};
use bioamp_rs::transport::{BoxedPort, SerialBackend, SerialConfig, Unsupported};
use bioamp_rs::types::{DecodedSample, StreamState};

/// Hands out one end of a duplex pipe; the test plays the board on the other.
struct PipeBackend {
    port: Mutex<Option<DuplexStream>>,
}

#[async_trait]
impl SerialBackend for PipeBackend {
    fn is_supported(&self) -> bool {
        true
    }

    async fn request_port(&self, _config: &SerialConfig) -> Result<BoxedPort> {
        match self.port.lock().unwrap().take() {
            Some(p) => Ok(Box::new(p)),
            None => Err(BioAmpError::Connection("no device".into())),
        }
    }
}

fn pipe_client(config: BioAmpConfig) -> (BioAmpClient, DuplexStream) {
    let (host, device) = tokio::io::duplex(64 * 1024);
    let backend = PipeBackend {
        port: Mutex::new(Some(host)),
    };
    (BioAmpClient::with_backend(config, Arc::new(backend)), device)
}

fn quiet_config() -> BioAmpConfig {
    BioAmpConfig {
        identify_timeout: None,
        ..BioAmpConfig::default()
    }
}

fn channels_for(i: usize) -> Vec<u16> {
    (0..NUM_CHANNELS).map(|ch| (i * 100 + ch) as u16).collect()
}

async fn expect_line(device: &mut DuplexStream, line: &[u8]) {
    let mut buf = vec![0u8; line.len()];
    tokio::time::timeout(Duration::from_secs(2), device.read_exact(&mut buf))
        .await
        .expect("command not sent in time")
        .unwrap();
    assert_eq!(buf, line);
}

async fn collect(rx: &mut mpsc::Receiver<DecodedSample>, n: usize) -> Vec<DecodedSample> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let s = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("sample not delivered in time")
            .expect("stream closed early");
        out.push(s);
    }
    out
}

#[tokio::test]
async fn fifty_frames_arrive_in_order() {
    let (mut client, mut device) = pipe_client(quiet_config());
    client.connect().await.unwrap();
    expect_line(&mut device, b"WHORU\n").await;

    let mut rx = client.start_stream().await.unwrap();
    expect_line(&mut device, b"START\n").await;
    assert_eq!(client.state(), StreamState::Streaming);

    let mut wire = Vec::new();
    for i in 0..50 {
        wire.extend(encode_frame(i as u8, &channels_for(i)));
    }
    // Deliver in awkward 7-byte chunks so frames straddle reads.
    for chunk in wire.chunks(7) {
        device.write_all(chunk).await.unwrap();
    }

    let samples = collect(&mut rx, 50).await;
    for (i, s) in samples.iter().enumerate() {
        assert_eq!(s.counter, i as u8);
        assert_eq!(s.channels, channels_for(i));
    }

    let status = client.status();
    assert_eq!(status.total_packets, 50);
    assert_eq!(status.dropped_frames, 0);
    assert_eq!(status.desync_events, 0);
    assert!(status.connected && status.streaming);
}

#[tokio::test]
async fn identification_reply_becomes_device_id() {
    let (mut client, mut device) = pipe_client(BioAmpConfig {
        identify_timeout: Some(Duration::from_secs(1)),
        ..BioAmpConfig::default()
    });
    device.write_all(b"UNO-R4\r\n").await.unwrap();
    client.connect().await.unwrap();
    assert_eq!(client.status().device_id.as_deref(), Some("UNO-R4"));
}

#[tokio::test]
async fn streaming_requires_connection() {
    let (mut client, _device) = pipe_client(quiet_config());
    assert!(matches!(client.start_stream().await, Err(BioAmpError::NotConnected)));
    assert!(matches!(
        client.send_command(Command::Status).await,
        Err(BioAmpError::NotConnected)
    ));
    assert_eq!(client.state(), StreamState::Disconnected);
}

#[tokio::test]
async fn unsupported_platform_fails_connect() {
    let mut client = BioAmpClient::with_backend(quiet_config(), Arc::new(Unsupported));
    assert!(matches!(client.connect().await, Err(BioAmpError::UnsupportedPlatform)));
    assert!(!client.status().connected);
}

#[tokio::test]
async fn second_start_is_rejected() {
    let (mut client, _device) = pipe_client(quiet_config());
    client.connect().await.unwrap();
    let _rx = client.start_stream().await.unwrap();
    assert!(matches!(client.start_stream().await, Err(BioAmpError::AlreadyStreaming)));
}

#[tokio::test]
async fn stop_then_restart() {
    let (mut client, mut device) = pipe_client(quiet_config());
    client.connect().await.unwrap();
    expect_line(&mut device, b"WHORU\n").await;

    let mut rx = client.start_stream().await.unwrap();
    expect_line(&mut device, b"START\n").await;
    device.write_all(&encode_frame(0, &channels_for(0))).await.unwrap();
    collect(&mut rx, 1).await;

    client.stop_stream().await.unwrap();
    expect_line(&mut device, b"STOP\n").await;
    assert_eq!(client.state(), StreamState::Connected);
    // Nothing is delivered once stop_stream has returned.
    assert_eq!(rx.recv().await, None);

    // Stopping twice is harmless.
    client.stop_stream().await.unwrap();

    let mut rx = client.start_stream().await.unwrap();
    expect_line(&mut device, b"START\n").await;
    device.write_all(&encode_frame(1, &channels_for(1))).await.unwrap();
    let s = collect(&mut rx, 1).await;
    assert_eq!(s[0].counter, 1);
    assert_eq!(client.status().total_packets, 2);
    assert_eq!(client.status().dropped_frames, 0);
}

#[tokio::test]
async fn status_query_is_written() {
    let (mut client, mut device) = pipe_client(quiet_config());
    client.connect().await.unwrap();
    expect_line(&mut device, b"WHORU\n").await;
    client.send_command(Command::Status).await.unwrap();
    expect_line(&mut device, b"STATUS\n").await;
}

#[tokio::test]
async fn counter_gaps_are_counted() {
    let (mut client, mut device) = pipe_client(quiet_config());
    client.connect().await.unwrap();
    let mut rx = client.start_stream().await.unwrap();

    for c in [5u8, 6, 9, 10] {
        device.write_all(&encode_frame(c, &[0; NUM_CHANNELS])).await.unwrap();
    }
    collect(&mut rx, 4).await;
    assert_eq!(client.status().dropped_frames, 2);
}

#[tokio::test]
async fn counter_wrap_is_not_loss() {
    let (mut client, mut device) = pipe_client(quiet_config());
    client.connect().await.unwrap();
    let mut rx = client.start_stream().await.unwrap();

    for c in [254u8, 255, 0, 1] {
        device.write_all(&encode_frame(c, &[0; NUM_CHANNELS])).await.unwrap();
    }
    collect(&mut rx, 4).await;
    assert_eq!(client.status().dropped_frames, 0);
    assert_eq!(client.status().total_packets, 4);
}

#[tokio::test]
async fn line_noise_is_skipped() {
    let (mut client, mut device) = pipe_client(quiet_config());
    client.connect().await.unwrap();
    let mut rx = client.start_stream().await.unwrap();

    let mut wire = vec![0xFF, 0x00, 0x13];
    wire.extend(encode_frame(0, &channels_for(0)));
    // A lone sync pair that does not start a valid frame.
    wire.extend([0xC7, 0x7C, 0x02, 0x03]);
    wire.extend(encode_frame(1, &channels_for(1)));
    device.write_all(&wire).await.unwrap();

    let samples = collect(&mut rx, 2).await;
    assert_eq!(samples[0].channels, channels_for(0));
    assert_eq!(samples[1].channels, channels_for(1));
    assert!(client.status().desync_events >= 1);
    assert_eq!(client.status().dropped_frames, 0);
}

#[tokio::test]
async fn device_eof_ends_the_session() {
    let (mut client, device) = pipe_client(quiet_config());
    client.connect().await.unwrap();
    let mut status = client.subscribe_status();
    let mut rx = client.start_stream().await.unwrap();

    drop(device);
    assert_eq!(rx.recv().await, None);
    tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| !s.connected))
        .await
        .expect("status not updated")
        .unwrap();

    assert_eq!(client.state(), StreamState::Disconnected);
    assert!(matches!(client.start_stream().await, Err(BioAmpError::NotConnected)));
}

#[tokio::test]
async fn disconnect_resets_status() {
    let (mut client, mut device) = pipe_client(quiet_config());
    client.connect().await.unwrap();
    let mut rx = client.start_stream().await.unwrap();
    device.write_all(&encode_frame(3, &channels_for(3))).await.unwrap();
    collect(&mut rx, 1).await;

    client.disconnect().await.unwrap();
    client.disconnect().await.unwrap();
    assert_eq!(client.status(), Default::default());
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn simulator_streams_through_the_controller() {
    let mut client = BioAmpClient::with_backend(
        BioAmpConfig::default(),
        Arc::new(bioamp_rs::simulator::SimulatedDevice::default()),
    );
    client.connect().await.unwrap();
    assert_eq!(
        client.status().device_id.as_deref(),
        Some(bioamp_rs::simulator::SIMULATOR_ID)
    );
    let mut rx = client.start_stream().await.unwrap();
    let samples = collect(&mut rx, 25).await;
    assert!(samples.windows(2).all(|w| w[1].counter == w[0].counter.wrapping_add(1)));
    client.disconnect().await.unwrap();
}
