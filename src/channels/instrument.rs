//! Instrument acquisition channel (spectrum analyzer / VNA).
//!
//! One instance per instrument. A sweep is a single query/response
//! exchange: write the trace request, then buffer incoming bytes until the
//! codec yields a complete frame. Responses routinely arrive split across
//! reads, so decoding is incremental over a [`BytesMut`] that persists for
//! the life of the exchange.

use crate::capabilities::{SweepSource, TraceFrame};
use crate::channels::codec::{AsciiTraceCodec, TraceCodec};
use crate::channels::{wrap_shared, DeviceLink, DynStream, LinkState, SharedStream};
use crate::error::{ScanError, ScanResult};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Which RF instrument a channel talks to.
///
/// The two kinds share framing and differ only in the query command, so the
/// kind picks the shipped codec. Exotic instruments plug in a custom
/// [`TraceCodec`] via [`InstrumentChannel::with_codec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    /// Swept spectrum analyzer.
    SpectrumAnalyzer,
    /// Vector network analyzer.
    Vna,
}

impl InstrumentKind {
    /// Stable identifier used in logs and link errors.
    pub fn id(&self) -> &'static str {
        match self {
            InstrumentKind::SpectrumAnalyzer => "spectrum",
            InstrumentKind::Vna => "vna",
        }
    }

    fn default_codec(&self) -> AsciiTraceCodec {
        match self {
            InstrumentKind::SpectrumAnalyzer => AsciiTraceCodec::new("TRAC:DATA? TRACE1"),
            InstrumentKind::Vna => AsciiTraceCodec::new("CALC:DATA? FDATA"),
        }
    }
}

/// Asynchronous client for one sweep-capable instrument.
pub struct InstrumentChannel {
    kind: InstrumentKind,
    stream: SharedStream,
    link: Arc<Mutex<DeviceLink>>,
    codec: Box<dyn TraceCodec>,
    timeout: Duration,
}

impl InstrumentChannel {
    /// Connect over TCP. Success leaves the link `Online`; failure is
    /// returned to the caller, which decides whether to proceed without the
    /// instrument; there are no automatic retries here.
    pub async fn connect(kind: InstrumentKind, addr: &str, timeout: Duration) -> ScanResult<Self> {
        let stream = super::connect_tcp(addr, timeout).await.map_err(|e| {
            warn!(device = kind.id(), addr, error = %e, "instrument connect failed");
            e
        })?;
        tracing::info!(device = kind.id(), addr, "instrument link online");
        Ok(Self::from_stream(kind, stream, timeout))
    }

    /// Build the channel over an already-open stream (simulated links use
    /// this with `tokio::io::duplex`).
    pub fn from_stream(kind: InstrumentKind, stream: DynStream, timeout: Duration) -> Self {
        Self {
            kind,
            stream: wrap_shared(stream),
            link: Arc::new(Mutex::new(DeviceLink::new(LinkState::Online))),
            codec: Box::new(kind.default_codec()),
            timeout,
        }
    }

    /// Swap in a device-specific trace codec.
    pub fn with_codec(mut self, codec: Box<dyn TraceCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Which instrument this channel drives.
    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    /// Current link state.
    pub async fn link_state(&self) -> LinkState {
        self.link.lock().await.state
    }

    fn dropped(&self) -> ScanError {
        ScanError::LinkDropped {
            device: self.kind.id().to_string(),
        }
    }
}

#[async_trait]
impl SweepSource for InstrumentChannel {
    /// Send the trace request and parse the response incrementally as bytes
    /// arrive.
    #[instrument(skip(self), fields(device = self.kind.id()), err)]
    async fn trigger_sweep(&self) -> ScanResult<TraceFrame> {
        let mut link = self.link.lock().await;
        if link.state != LinkState::Online {
            return Err(ScanError::NotConnected);
        }
        link.enqueue(self.codec.request().to_vec());

        let mut guard = self.stream.lock().await;
        let stream = &mut *guard;

        let request = match link.front() {
            Some(f) => f.to_vec(),
            None => return Err(self.dropped()),
        };
        let writer = stream.get_mut();
        if let Err(e) = async {
            writer.write_all(&request).await?;
            writer.flush().await
        }
        .await
        {
            link.state = LinkState::Disconnected;
            link.clear();
            warn!(error = %e, "instrument write failed");
            return Err(self.dropped());
        }

        let mut buf = BytesMut::with_capacity(4096);
        loop {
            if let Some(frame) = self.codec.decode(&mut buf).map_err(|e| {
                // Malformed frame: the exchange is over, release the command.
                link.ack_front();
                e
            })? {
                link.ack_front();
                debug!(points = frame.amplitudes.len(), "trace received");
                return Ok(frame);
            }

            let read = tokio::time::timeout(self.timeout, stream.read_buf(&mut buf)).await;
            match read {
                Err(_) => {
                    link.clear();
                    return Err(ScanError::LinkTimeout {
                        device: self.kind.id().to_string(),
                    });
                }
                Ok(Err(e)) => {
                    link.state = LinkState::Disconnected;
                    link.clear();
                    warn!(error = %e, "instrument read failed");
                    return Err(self.dropped());
                }
                Ok(Ok(0)) => {
                    link.state = LinkState::Disconnected;
                    link.clear();
                    return Err(self.dropped());
                }
                Ok(Ok(_)) => {}
            }
        }
    }
}
