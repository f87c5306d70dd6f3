//! Instrument channel framing tests over simulated duplex links.

use nearfield_scanner::capabilities::SweepSource;
use nearfield_scanner::channels::{InstrumentChannel, InstrumentKind, LinkState};
use nearfield_scanner::error::ScanError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const TIMEOUT: Duration = Duration::from_millis(500);

#[tokio::test]
async fn sweep_sends_request_and_parses_trace() {
    let (mut host, device) = tokio::io::duplex(1024);
    let channel = InstrumentChannel::from_stream(
        InstrumentKind::SpectrumAnalyzer,
        Box::new(device),
        TIMEOUT,
    );

    let analyzer = tokio::spawn(async move {
        let mut buf = vec![0u8; 64];
        let n = host.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"TRAC:DATA? TRACE1\r\n");
        host.write_all(b"1000000:-42.5;2000000:-40.0;3000000:-44.25\n")
            .await
            .unwrap();
        host
    });

    let frame = channel.trigger_sweep().await.unwrap();
    assert_eq!(frame.frequencies_hz, vec![1e6, 2e6, 3e6]);
    assert_eq!(frame.amplitudes, vec![-42.5, -40.0, -44.25]);
    drop(analyzer.await.unwrap());
}

#[tokio::test]
async fn response_split_across_writes_is_buffered() {
    let (mut host, device) = tokio::io::duplex(1024);
    let channel =
        InstrumentChannel::from_stream(InstrumentKind::Vna, Box::new(device), TIMEOUT);

    let analyzer = tokio::spawn(async move {
        let mut buf = vec![0u8; 64];
        let n = host.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"CALC:DATA? FDATA\r\n");
        host.write_all(b"1000000:-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        host.write_all(b"0.5;2000000:").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        host.write_all(b"-11.5\n").await.unwrap();
        host
    });

    let frame = channel.trigger_sweep().await.unwrap();
    assert_eq!(frame.amplitudes, vec![-10.5, -11.5]);
    drop(analyzer.await.unwrap());
}

#[tokio::test]
async fn malformed_trace_is_invalid_trace_data() {
    let (mut host, device) = tokio::io::duplex(1024);
    let channel = InstrumentChannel::from_stream(
        InstrumentKind::SpectrumAnalyzer,
        Box::new(device),
        TIMEOUT,
    );

    let analyzer = tokio::spawn(async move {
        let mut buf = vec![0u8; 64];
        let _ = host.read(&mut buf).await.unwrap();
        host.write_all(b"1000000:minus-forty\n").await.unwrap();
        host
    });

    let err = channel.trigger_sweep().await.unwrap_err();
    assert!(matches!(err, ScanError::InvalidTraceData(_)));
    // The link survives a malformed trace.
    assert_eq!(channel.link_state().await, LinkState::Online);
    drop(analyzer.await.unwrap());
}

#[tokio::test]
async fn peer_close_mid_response_is_link_dropped() {
    let (mut host, device) = tokio::io::duplex(1024);
    let channel = InstrumentChannel::from_stream(
        InstrumentKind::SpectrumAnalyzer,
        Box::new(device),
        TIMEOUT,
    );

    let analyzer = tokio::spawn(async move {
        let mut buf = vec![0u8; 64];
        let _ = host.read(&mut buf).await.unwrap();
        host.write_all(b"1000000:-42.5;200").await.unwrap();
        // Closing here leaves the frame forever incomplete.
        drop(host);
    });

    let err = channel.trigger_sweep().await.unwrap_err();
    assert!(matches!(err, ScanError::LinkDropped { device } if device == "spectrum"));
    assert_eq!(channel.link_state().await, LinkState::Disconnected);
    analyzer.await.unwrap();
}

#[tokio::test]
async fn silent_instrument_is_link_timeout() {
    let (host, device) = tokio::io::duplex(1024);
    let channel = InstrumentChannel::from_stream(
        InstrumentKind::Vna,
        Box::new(device),
        Duration::from_millis(50),
    );

    let err = channel.trigger_sweep().await.unwrap_err();
    assert!(matches!(err, ScanError::LinkTimeout { device } if device == "vna"));
    drop(host);
}
