//! TCP link.
//!
//! One background thread per direction. The receiver reads the socket into
//! the receive ring and the writer drains the send ring into the socket,
//! so the main thread never blocks on the network. Teardown happens on the
//! main thread only: rings close first to unblock ring waits, then the
//! socket shutdown unblocks any thread parked inside a syscall.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};

use kbe_shared::{DecodeProgress, Frame, FrameDecoder, MessageCatalog, SendError};

use crate::ring::{ByteRing, STALL_RETRIES, STALL_WAIT};
use crate::transport::{ConnState, NetError, Transport, TransportSignal};

/// Per-read cap for the receiver thread.
const READ_CHUNK: usize = 65536;

/// Consecutive no-progress decode passes tolerated while the decoder
/// waits for the catalog to learn a message id. One pass is enough for a
/// legitimate in-flight protocol import; more means the stream is off.
const STALL_PASSES_MAX: u8 = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State the socket threads see. Replaced wholesale on every connect so a
/// straggler thread from a previous connection can never poison the new
/// one.
struct Shared {
    will_close: AtomicBool,
    recv_ring: ByteRing,
    send_ring: ByteRing,
}

impl Shared {
    fn new(recv_capacity: usize, send_capacity: usize) -> Shared {
        Shared {
            will_close: AtomicBool::new(false),
            recv_ring: ByteRing::new(recv_capacity),
            send_ring: ByteRing::new(send_capacity),
        }
    }
}

/// A connect attempt in flight. The thread is detached; abandoning the
/// task makes the thread drop whatever it connected to.
struct ConnectTask {
    slot: Arc<Mutex<Option<Result<TcpStream, NetError>>>>,
    done: Arc<AtomicBool>,
}

pub struct TcpTransport {
    state: ConnState,
    recv_capacity: usize,
    send_capacity: usize,
    shared: Arc<Shared>,
    connect: Option<ConnectTask>,
    stream: Option<TcpStream>,
    io_threads: Vec<JoinHandle<()>>,
    decoder: FrameDecoder,
    /// Bytes drained from the receive ring but not yet accepted by the
    /// decoder; non-empty only across a decoder stall.
    pending: Vec<u8>,
    stall_passes: u8,
}

impl TcpTransport {
    pub fn new(recv_capacity: usize, send_capacity: usize) -> TcpTransport {
        TcpTransport {
            state: ConnState::Disconnected,
            recv_capacity,
            send_capacity,
            shared: Arc::new(Shared::new(recv_capacity, send_capacity)),
            connect: None,
            stream: None,
            io_threads: Vec::new(),
            decoder: FrameDecoder::new(),
            pending: Vec::new(),
            stall_passes: 0,
        }
    }

    /// Starts a background connect. The result surfaces as a
    /// `ConnectDone` signal from a later `process()`.
    pub fn connect(&mut self, host: &str, port: u16) {
        if self.state != ConnState::Disconnected {
            self.close();
        }
        self.shared = Arc::new(Shared::new(self.recv_capacity, self.send_capacity));
        self.state = ConnState::Connecting;

        let addr = format!("{host}:{port}");
        debug!("connecting to {addr}");

        let slot: Arc<Mutex<Option<Result<TcpStream, NetError>>>> = Arc::new(Mutex::new(None));
        let done = Arc::new(AtomicBool::new(false));
        let task_slot = Arc::clone(&slot);
        let task_done = Arc::clone(&done);

        let spawned = thread::Builder::new()
            .name("kbe-tcp-connect".to_string())
            .spawn(move || {
                let result = TcpStream::connect(&addr)
                    .map_err(|source| NetError::Connect { addr, source });
                *lock(&task_slot) = Some(result);
                task_done.store(true, Ordering::Release);
            });

        match spawned {
            Ok(_) => self.connect = Some(ConnectTask { slot, done }),
            Err(err) => {
                error!("spawning the connect thread failed: {err}");
                self.connect = None;
            }
        }
    }

    fn poll_connect(&mut self) -> TransportSignal {
        let finished = match &self.connect {
            Some(task) => task.done.load(Ordering::Acquire),
            None => true,
        };
        if !finished {
            return TransportSignal::Idle;
        }

        let result = self.connect.take().and_then(|task| lock(&task.slot).take());
        match result {
            Some(Ok(stream)) => match self.start_io(stream) {
                Ok(()) => {
                    self.state = ConnState::Connected;
                    TransportSignal::ConnectDone { success: true }
                }
                Err(err) => {
                    error!("starting socket threads failed: {err}");
                    self.state = ConnState::Disconnected;
                    TransportSignal::ConnectDone { success: false }
                }
            },
            Some(Err(err)) => {
                error!("{err}");
                self.state = ConnState::Disconnected;
                TransportSignal::ConnectDone { success: false }
            }
            None => {
                self.state = ConnState::Disconnected;
                TransportSignal::ConnectDone { success: false }
            }
        }
    }

    fn start_io(&mut self, stream: TcpStream) -> io::Result<()> {
        if let Err(err) = stream.set_nodelay(true) {
            warn!("set_nodelay failed: {err}");
        }
        let reader_stream = stream.try_clone()?;
        let writer_stream = stream.try_clone()?;
        self.stream = Some(stream);

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("kbe-tcp-recv".to_string())
            .spawn(move || recv_loop(reader_stream, shared))
        {
            Ok(handle) => self.io_threads.push(handle),
            Err(err) => {
                self.close();
                return Err(err);
            }
        }

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("kbe-tcp-send".to_string())
            .spawn(move || send_loop(writer_stream, shared))
        {
            Ok(handle) => self.io_threads.push(handle),
            Err(err) => {
                self.close();
                return Err(err);
            }
        }

        Ok(())
    }

    fn pump_recv(&mut self, catalog: &MessageCatalog, frames: &mut Vec<Frame>) -> TransportSignal {
        self.shared.recv_ring.drain_into(&mut self.pending);
        if self.pending.is_empty() && !self.decoder.is_stalled() {
            return TransportSignal::Idle;
        }

        match self.decoder.process(&self.pending, catalog, frames) {
            DecodeProgress::Consumed => {
                self.pending.clear();
                self.stall_passes = 0;
            }
            DecodeProgress::Stalled { id, used } => {
                self.pending.drain(..used);
                if used > 0 || self.pending.is_empty() {
                    // Fresh stall, or nothing left to decode anyway. The
                    // import that declares the id is usually in `frames`
                    // right now and lands before the next pass.
                    self.stall_passes = 0;
                } else {
                    self.stall_passes += 1;
                    if self.stall_passes >= STALL_PASSES_MAX {
                        error!("message id {id} is not in the client table, closing the link");
                        self.shared.will_close.store(true, Ordering::Release);
                    }
                }
            }
        }
        TransportSignal::Idle
    }

    fn reset(&mut self) {
        self.state = ConnState::Closing;
        self.shared.recv_ring.close();
        self.shared.send_ring.close();
        self.connect = None;
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
        for handle in self.io_threads.drain(..) {
            if handle.join().is_err() {
                warn!("socket thread panicked during teardown");
            }
        }
        self.stream = None;
        self.decoder.reset();
        self.pending.clear();
        self.stall_passes = 0;
        self.shared.will_close.store(false, Ordering::Release);
        self.state = ConnState::Disconnected;
    }
}

impl Transport for TcpTransport {
    fn process(&mut self, catalog: &MessageCatalog, frames: &mut Vec<Frame>) -> TransportSignal {
        if self.shared.will_close.load(Ordering::Acquire) {
            self.close();
            return TransportSignal::ConnectionLost;
        }

        match self.state {
            ConnState::Disconnected | ConnState::Closing => TransportSignal::Idle,
            ConnState::Connecting => self.poll_connect(),
            ConnState::Connected => self.pump_recv(catalog, frames),
        }
    }

    fn state(&self) -> ConnState {
        self.state
    }

    fn valid(&self) -> bool {
        self.state == ConnState::Connected
            && self.stream.is_some()
            && !self.shared.will_close.load(Ordering::Acquire)
    }

    fn send_segment(&mut self, data: &[u8]) -> Result<(), SendError> {
        if !self.valid() {
            return Err(SendError);
        }
        if self.shared.send_ring.push(data).is_err() {
            error!(
                "send ring cannot take a {} byte segment, closing the link",
                data.len()
            );
            self.shared.will_close.store(true, Ordering::Release);
            return Err(SendError);
        }
        Ok(())
    }

    fn will_close(&self) {
        self.shared.will_close.store(true, Ordering::Release);
    }

    fn close(&mut self) -> bool {
        let lost = self.shared.will_close.load(Ordering::Acquire);
        self.reset();
        lost
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reset();
    }
}

fn recv_loop(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let space = shared.recv_ring.wait_space(STALL_RETRIES, STALL_WAIT);
        if space == 0 {
            if !shared.recv_ring.is_closed() {
                error!("receive ring stayed full, dropping the connection");
                shared.will_close.store(true, Ordering::Release);
            }
            return;
        }

        let want = space.min(buf.len());
        match stream.read(&mut buf[..want]) {
            Ok(0) => {
                if !shared.recv_ring.is_closed() {
                    error!("server closed the connection");
                    shared.will_close.store(true, Ordering::Release);
                }
                return;
            }
            Ok(n) => {
                // Space was reserved above; failure here means closed.
                if shared.recv_ring.push(&buf[..n]).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                if !shared.recv_ring.is_closed() {
                    error!("socket read failed: {err}");
                    shared.will_close.store(true, Ordering::Release);
                }
                return;
            }
        }
    }
}

fn send_loop(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut pending = Vec::new();
    while shared.send_ring.wait_data() {
        pending.clear();
        shared.send_ring.peek_into(&mut pending);
        match stream.write(&pending) {
            Ok(0) => {
                if !shared.send_ring.is_closed() {
                    error!("socket write made no progress");
                    shared.will_close.store(true, Ordering::Release);
                }
                return;
            }
            Ok(n) => shared.send_ring.consume(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                if !shared.send_ring.is_closed() {
                    error!("socket write failed: {err}");
                    shared.will_close.store(true, Ordering::Release);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_transport_is_disconnected_and_refuses_sends() {
        let mut transport = TcpTransport::new(64, 64);
        assert_eq!(transport.state(), ConnState::Disconnected);
        assert!(!transport.valid());
        assert!(transport.send_segment(&[1, 2, 3]).is_err());
    }

    #[test]
    fn connect_to_a_dead_port_reports_failure() {
        // Bind-then-drop guarantees nothing listens on the port.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut transport = TcpTransport::new(64, 64);
        transport.connect("127.0.0.1", port);
        assert_eq!(transport.state(), ConnState::Connecting);

        let catalog = MessageCatalog::new();
        let mut frames = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            match transport.process(&catalog, &mut frames) {
                TransportSignal::ConnectDone { success } => {
                    assert!(!success);
                    break;
                }
                TransportSignal::Idle => {
                    assert!(std::time::Instant::now() < deadline, "connect never resolved");
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                other => panic!("unexpected signal {other:?}"),
            }
        }
        assert_eq!(transport.state(), ConnState::Disconnected);
    }
}
