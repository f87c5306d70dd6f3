//! Wire codecs for the device protocols.
//!
//! Framing is device-specific and kept out of the transport code: the robot
//! speaks a line-oriented ASCII command protocol with explicit
//! acknowledgments, the instruments answer trace queries with a
//! newline-terminated block of `frequency:amplitude` pairs. Both codecs are
//! pure functions over bytes and are unit-tested without any stream.

use crate::capabilities::TraceFrame;
use crate::error::{ScanError, ScanResult};
use bytes::BytesMut;
use nalgebra::{Point3, Vector3};

// =============================================================================
// Robot line protocol
// =============================================================================

/// One command in the robot's line protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RobotCommand {
    /// Search for the mechanical origin on all axes.
    Home,
    /// Absolute move, millimeters.
    MoveAbs(Point3<f64>),
    /// Relative move, millimeters.
    MoveRel(Vector3<f64>),
}

impl RobotCommand {
    /// Encode to the wire form, CRLF terminated.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RobotCommand::Home => b"OR\r\n".to_vec(),
            RobotCommand::MoveAbs(p) => {
                format!("PA X{:.3} Y{:.3} Z{:.3}\r\n", p.x, p.y, p.z).into_bytes()
            }
            RobotCommand::MoveRel(d) => {
                format!("PR X{:.3} Y{:.3} Z{:.3}\r\n", d.x, d.y, d.z).into_bytes()
            }
        }
    }
}

/// One line received from the robot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RobotReply {
    /// Acknowledgment echoing the accepted byte count.
    Ack(usize),
    /// Unsolicited position telemetry, millimeters.
    Position(Point3<f64>),
}

/// Parse one robot reply line. Returns `None` for malformed frames, which
/// the channel logs and discards.
pub fn parse_robot_reply(line: &str) -> Option<RobotReply> {
    let mut parts = line.trim().split_whitespace();
    match parts.next()? {
        "OK" => {
            let len = parts.next()?.parse::<usize>().ok()?;
            if parts.next().is_some() {
                return None;
            }
            Some(RobotReply::Ack(len))
        }
        "POS" => {
            let x = parts.next()?.parse::<f64>().ok()?;
            let y = parts.next()?.parse::<f64>().ok()?;
            let z = parts.next()?.parse::<f64>().ok()?;
            if parts.next().is_some() {
                return None;
            }
            Some(RobotReply::Position(Point3::new(x, y, z)))
        }
        _ => None,
    }
}

// =============================================================================
// Instrument trace framing
// =============================================================================

/// Incremental decoder for one instrument's trace responses.
///
/// `decode` is called whenever bytes arrive; it consumes nothing until a
/// complete frame is buffered, so partial reads simply wait for more data.
pub trait TraceCodec: Send + Sync {
    /// The trace-request command for this instrument.
    fn request(&self) -> &[u8];

    /// Try to extract one complete trace from the buffer.
    ///
    /// Returns `Ok(None)` while the frame is still incomplete. A complete
    /// but malformed frame is consumed from the buffer and reported as
    /// [`ScanError::InvalidTraceData`] so the next sweep starts clean.
    fn decode(&self, buf: &mut BytesMut) -> ScanResult<Option<TraceFrame>>;
}

/// Newline-terminated ASCII trace block: `freq:ampl` pairs joined by `;`.
///
/// This covers both the spectrum analyzer and the VNA, which differ only in
/// the query command they answer.
#[derive(Debug, Clone)]
pub struct AsciiTraceCodec {
    request: Vec<u8>,
}

impl AsciiTraceCodec {
    /// Codec answering to the given query command (CRLF appended).
    pub fn new(request_cmd: &str) -> Self {
        Self {
            request: format!("{request_cmd}\r\n").into_bytes(),
        }
    }

    fn parse_line(line: &str) -> ScanResult<TraceFrame> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ScanError::InvalidTraceData("empty trace block".to_string()));
        }
        let mut frequencies_hz = Vec::new();
        let mut amplitudes = Vec::new();
        for (i, pair) in line.split(';').enumerate() {
            let Some((freq, ampl)) = pair.split_once(':') else {
                return Err(ScanError::InvalidTraceData(format!(
                    "record {i} has no ':' separator"
                )));
            };
            let freq: f64 = freq.trim().parse().map_err(|_| {
                ScanError::InvalidTraceData(format!("record {i}: bad frequency '{freq}'"))
            })?;
            let ampl: f64 = ampl.trim().parse().map_err(|_| {
                ScanError::InvalidTraceData(format!("record {i}: bad amplitude '{ampl}'"))
            })?;
            if !freq.is_finite() || !ampl.is_finite() {
                return Err(ScanError::InvalidTraceData(format!(
                    "record {i} is not finite"
                )));
            }
            frequencies_hz.push(freq);
            amplitudes.push(ampl);
        }
        Ok(TraceFrame {
            frequencies_hz,
            amplitudes,
        })
    }
}

impl TraceCodec for AsciiTraceCodec {
    fn request(&self) -> &[u8] {
        &self.request
    }

    fn decode(&self, buf: &mut BytesMut) -> ScanResult<Option<TraceFrame>> {
        let Some(end) = buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let frame = buf.split_to(end + 1);
        let line = std::str::from_utf8(&frame[..end])
            .map_err(|_| ScanError::InvalidTraceData("trace block is not UTF-8".to_string()))?;
        Self::parse_line(line).map(Some)
    }
}
