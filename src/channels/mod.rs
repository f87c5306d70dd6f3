//! Asynchronous byte-stream device channels.
//!
//! Each hardware link (robot, spectrum analyzer, VNA) is an independent
//! client over a type-erased async byte stream. Production links are TCP;
//! tests inject `tokio::io::duplex` streams through the same constructors,
//! so the protocol logic is exercised byte-for-byte without hardware.

pub mod codec;
pub mod instrument;
pub mod robot;

pub use instrument::{InstrumentChannel, InstrumentKind};
pub use robot::RobotChannel;

use crate::error::{ScanError, ScanResult};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Trait alias for async channel I/O.
///
/// Any `AsyncRead + AsyncWrite + Unpin + Send` type works as a device
/// stream: `tokio::net::TcpStream` for real links, `tokio::io::DuplexStream`
/// for simulated ones.
pub trait StreamIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIO for T {}

/// Type-erased boxed device stream.
pub type DynStream = Box<dyn StreamIO>;

/// Shared buffered device stream.
///
/// `BufReader` gives the line-oriented protocols `read_line`/`read_until`;
/// the mutex makes the stream exclusively owned by whichever operation is
/// in flight, which is half of the single-outstanding-command discipline.
pub type SharedStream = Arc<Mutex<BufReader<DynStream>>>;

/// Wrap a raw stream into the shared buffered form the channels use.
pub fn wrap_shared(stream: DynStream) -> SharedStream {
    Arc::new(Mutex::new(BufReader::new(stream)))
}

/// Open a TCP link to `addr` within `timeout`.
pub async fn connect_tcp(addr: &str, timeout: std::time::Duration) -> ScanResult<DynStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ScanError::LinkTimeout {
            device: addr.to_string(),
        })??;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

/// Connection state of one device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No stream attached or the stream failed.
    #[default]
    Disconnected,
    /// Connect in progress.
    Connecting,
    /// Link is up and serving commands.
    Online,
}

/// Bookkeeping for one device link: connection state, the outbound byte
/// queue, and the acknowledgment counter.
///
/// Created when a channel connects, torn down with the channel. The queue
/// holds encoded commands that have not yet been released to the wire; the
/// ack counter records how many commands the device has confirmed.
#[derive(Debug, Default)]
pub struct DeviceLink {
    /// Connection state.
    pub state: LinkState,
    queue: VecDeque<Vec<u8>>,
    acks: u64,
}

impl DeviceLink {
    /// Fresh link in the given state.
    pub fn new(state: LinkState) -> Self {
        Self {
            state,
            queue: VecDeque::new(),
            acks: 0,
        }
    }

    /// Append an encoded command to the outbound queue.
    pub fn enqueue(&mut self, bytes: Vec<u8>) {
        self.queue.push_back(bytes);
    }

    /// The command currently at the head of the queue, if any.
    pub fn front(&self) -> Option<&[u8]> {
        self.queue.front().map(Vec::as_slice)
    }

    /// Record an acknowledgment and release the head command.
    pub fn ack_front(&mut self) -> Option<Vec<u8>> {
        let released = self.queue.pop_front();
        if released.is_some() {
            self.acks += 1;
        }
        released
    }

    /// Number of commands acknowledged over the link's lifetime.
    pub fn ack_count(&self) -> u64 {
        self.acks
    }

    /// Whether any command is still queued or in flight.
    pub fn is_busy(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Drop all queued commands (abort path) and report how many were
    /// discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_releases_in_fifo_order() {
        let mut link = DeviceLink::new(LinkState::Online);
        link.enqueue(b"first\r\n".to_vec());
        link.enqueue(b"second\r\n".to_vec());

        assert_eq!(link.front(), Some(&b"first\r\n"[..]));
        assert_eq!(link.ack_front().as_deref(), Some(&b"first\r\n"[..]));
        assert_eq!(link.ack_count(), 1);
        assert_eq!(link.front(), Some(&b"second\r\n"[..]));
        assert!(link.is_busy());

        link.ack_front();
        assert_eq!(link.ack_count(), 2);
        assert!(!link.is_busy());
    }

    #[test]
    fn clear_discards_without_acking() {
        let mut link = DeviceLink::new(LinkState::Online);
        link.enqueue(b"a".to_vec());
        link.enqueue(b"b".to_vec());
        assert_eq!(link.clear(), 2);
        assert_eq!(link.ack_count(), 0);
        assert!(!link.is_busy());
    }
}
