//! Server links.
//!
//! A transport owns one connection to a server app and the background
//! threads that move its bytes. Everything observable happens on the main
//! thread: connects resolve, frames surface, and teardown runs inside
//! `process()`. Background threads only touch the shared rings and the
//! will-close flag.

mod kcp;
mod tcp;

pub use self::kcp::KcpTransport;
pub use self::tcp::TcpTransport;

use std::io;

use thiserror::Error;

use kbe_shared::{Frame, MessageCatalog, SegmentSink, SendError};

/// Connection lifecycle. `Closing` only exists inside a teardown call;
/// between `process()` calls a transport is never observed in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// What one `process()` pump observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    Idle,
    /// The in-flight connect attempt finished.
    ConnectDone { success: bool },
    /// An established link went down without a local `close()`.
    ConnectionLost,
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("socket i/o failed: {0}")]
    Io(#[from] io::Error),
    /// The server answered the handshake with conversation id 0.
    #[error("handshake refused by {addr}")]
    HandshakeRefused { addr: String },
    #[error("handshake got no answer within {secs}s")]
    HandshakeTimeout { secs: u64 },
}

/// One connection to a server app.
pub trait Transport {
    /// Pumps the link: resolves a pending connect, decodes inbound bytes
    /// into `frames`, and performs deferred teardown.
    fn process(&mut self, catalog: &MessageCatalog, frames: &mut Vec<Frame>) -> TransportSignal;

    fn state(&self) -> ConnState;

    /// Connected and not flagged for teardown.
    fn valid(&self) -> bool;

    /// Queues one wire-ready segment. Refusal flags the link.
    fn send_segment(&mut self, data: &[u8]) -> Result<(), SendError>;

    /// Flags the link for teardown on the next `process()`. Callable from
    /// handler code while frames from this very link are still in flight.
    fn will_close(&self);

    /// Immediate teardown. Returns true when the will-close flag was set
    /// at the time of the call, i.e. the link had already failed.
    fn close(&mut self) -> bool;
}

impl SegmentSink for Box<dyn Transport> {
    fn send_segment(&mut self, data: &[u8]) -> Result<(), SendError> {
        Transport::send_segment(&mut **self, data)
    }
}

impl SegmentSink for TcpTransport {
    fn send_segment(&mut self, data: &[u8]) -> Result<(), SendError> {
        Transport::send_segment(self, data)
    }
}

impl SegmentSink for KcpTransport {
    fn send_segment(&mut self, data: &[u8]) -> Result<(), SendError> {
        Transport::send_segment(self, data)
    }
}
