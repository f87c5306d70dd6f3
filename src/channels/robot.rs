//! Robot motion channel.
//!
//! Line-oriented ASCII client for the positioning robot with a
//! single-outstanding-command discipline: a queued command is only written
//! once the previous command's acknowledgment has been read back and its
//! echoed byte count verified. Interleaving two commands would corrupt the
//! robot's serial command parser, so the queue is drained strictly one
//! acknowledgment at a time.
//!
//! Unsolicited `POS` lines arriving between command and acknowledgment are
//! parsed into a position telemetry watch; malformed lines are logged and
//! discarded.

use crate::capabilities::Movable;
use crate::channels::codec::{parse_robot_reply, RobotCommand, RobotReply};
use crate::channels::{wrap_shared, DeviceLink, DynStream, LinkState, SharedStream};
use crate::error::{ScanError, ScanResult};
use async_trait::async_trait;
use nalgebra::{Point3, Vector3};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, instrument, warn};

const DEVICE: &str = "robot";

/// Asynchronous client for the robot motion controller.
pub struct RobotChannel {
    stream: SharedStream,
    link: Arc<Mutex<DeviceLink>>,
    timeout: Duration,
    position_tx: watch::Sender<Option<Point3<f64>>>,
}

impl RobotChannel {
    /// Connect over TCP.
    pub async fn connect(addr: &str, timeout: Duration) -> ScanResult<Self> {
        let stream = super::connect_tcp(addr, timeout).await?;
        tracing::info!(addr, "robot link online");
        Ok(Self::from_stream(stream, timeout))
    }

    /// Build the channel over an already-open stream.
    ///
    /// This is the constructor simulated links use: any
    /// `AsyncRead + AsyncWrite` stream (e.g. `tokio::io::duplex`) drives the
    /// exact same protocol path as a TCP link.
    pub fn from_stream(stream: DynStream, timeout: Duration) -> Self {
        let (position_tx, _) = watch::channel(None);
        Self {
            stream: wrap_shared(stream),
            link: Arc::new(Mutex::new(DeviceLink::new(LinkState::Online))),
            timeout,
            position_tx,
        }
    }

    /// Subscribe to unsolicited position telemetry.
    pub fn position_rx(&self) -> watch::Receiver<Option<Point3<f64>>> {
        self.position_tx.subscribe()
    }

    /// Current link state.
    pub async fn link_state(&self) -> LinkState {
        self.link.lock().await.state
    }

    /// Total commands acknowledged over this link.
    pub async fn ack_count(&self) -> u64 {
        self.link.lock().await.ack_count()
    }

    /// Enqueue a command and pump the queue until every queued command has
    /// been acknowledged. Returning `Ok` therefore means "motion settled"
    /// as far as the protocol can tell.
    #[instrument(skip(self), fields(device = DEVICE), err)]
    async fn send(&self, command: RobotCommand) -> ScanResult<()> {
        let mut link = self.link.lock().await;
        if link.state != LinkState::Online {
            return Err(ScanError::NotConnected);
        }
        link.enqueue(command.encode());
        self.pump(&mut link).await
    }

    /// Drain the outbound queue one acknowledgment at a time.
    async fn pump(&self, link: &mut DeviceLink) -> ScanResult<()> {
        let mut guard = self.stream.lock().await;
        let stream = &mut *guard;

        loop {
            let front = match link.front() {
                Some(f) => f.to_vec(),
                None => break,
            };
            let expected_len = front.len();
            let writer = stream.get_mut();
            if let Err(e) = async {
                writer.write_all(&front).await?;
                writer.flush().await
            }
            .await
            {
                link.state = LinkState::Disconnected;
                let discarded = link.clear();
                warn!(error = %e, discarded, "robot write failed");
                return Err(ScanError::LinkDropped {
                    device: DEVICE.to_string(),
                });
            }

            self.await_ack(stream, link, expected_len).await?;
            link.ack_front();
        }
        Ok(())
    }

    /// Read lines until the acknowledgment for the in-flight command
    /// arrives, surfacing telemetry and discarding malformed frames.
    async fn await_ack(
        &self,
        stream: &mut tokio::io::BufReader<DynStream>,
        link: &mut DeviceLink,
        expected_len: usize,
    ) -> ScanResult<()> {
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(self.timeout, stream.read_line(&mut line)).await;
            let n = match read {
                Err(_) => {
                    link.clear();
                    return Err(ScanError::LinkTimeout {
                        device: DEVICE.to_string(),
                    });
                }
                Ok(Err(e)) => {
                    link.state = LinkState::Disconnected;
                    link.clear();
                    warn!(error = %e, "robot read failed");
                    return Err(ScanError::LinkDropped {
                        device: DEVICE.to_string(),
                    });
                }
                Ok(Ok(n)) => n,
            };
            if n == 0 {
                link.state = LinkState::Disconnected;
                link.clear();
                return Err(ScanError::LinkDropped {
                    device: DEVICE.to_string(),
                });
            }

            match parse_robot_reply(&line) {
                Some(RobotReply::Ack(len)) => {
                    if len != expected_len {
                        // A length mismatch means the robot accepted some
                        // other byte count than what we queued; the command
                        // stream can no longer be trusted.
                        link.state = LinkState::Disconnected;
                        link.clear();
                        warn!(expected_len, got = len, "robot ack length mismatch");
                        return Err(ScanError::LinkDropped {
                            device: DEVICE.to_string(),
                        });
                    }
                    debug!(len, "robot ack");
                    return Ok(());
                }
                Some(RobotReply::Position(p)) => {
                    let _ = self.position_tx.send(Some(p));
                }
                None => {
                    warn!(frame = line.trim(), "discarding malformed robot frame");
                }
            }
        }
    }
}

#[async_trait]
impl Movable for RobotChannel {
    async fn home(&self) -> ScanResult<()> {
        self.send(RobotCommand::Home).await
    }

    async fn move_abs(&self, target_mm: Point3<f64>) -> ScanResult<()> {
        self.send(RobotCommand::MoveAbs(target_mm)).await
    }

    async fn move_rel(&self, delta_mm: Vector3<f64>) -> ScanResult<()> {
        self.send(RobotCommand::MoveRel(delta_mm)).await
    }
}
