//! Reliable-UDP link.
//!
//! The ARQ core comes from the `kcp` crate; this module supplies the
//! handshake that obtains a conversation id, the datagram pump, and the
//! clock driving retransmission. Outbound data goes straight into the
//! control block from the main thread, so only the receive direction has
//! a background thread.

use std::io::{self, Write};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cfg_if::cfg_if;
use kcp::Kcp;
use log::{debug, error, warn};

use kbe_shared::{ByteStream, DecodeProgress, Frame, FrameDecoder, MessageCatalog, SendError};

use crate::ring::{ByteRing, STALL_RETRIES, STALL_WAIT};
use crate::transport::{ConnState, NetError, Transport, TransportSignal};

/// Consecutive no-progress decode passes tolerated while the decoder
/// waits for the catalog to learn a message id.
const STALL_PASSES_MAX: u8 = 2;

const UDP_HELLO: &str = "62a559f3fa7748bc22f8e0766019d498";
const UDP_HELLO_ACK: &str = "1432ad7c829170a76dd31982c3501eca";
const HANDSHAKE_RETRY: Duration = Duration::from_millis(1500);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
/// Largest datagram the server will ever send.
const UDP_PACKET_MAX: usize = 1472 * 4;

const KCP_MTU: usize = 1400;
const KCP_UPDATE_INTERVAL_MS: i32 = 10;
const KCP_FAST_RESEND: i32 = 2;
const KCP_MIN_RTO: u32 = 10;
/// Receive poll granularity; bounds how long teardown can take.
const RECV_POLL: Duration = Duration::from_millis(100);

cfg_if! {
    if #[cfg(windows)] {
        // Windows reports an ICMP port-unreachable from an earlier send as
        // ConnectionReset on the next recv of a connected UDP socket.
        fn ignorable_recv_error(kind: io::ErrorKind) -> bool {
            matches!(
                kind,
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
            )
        }
    } else {
        fn ignorable_recv_error(kind: io::ErrorKind) -> bool {
            matches!(
                kind,
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            )
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Writes control-block output straight to the connected socket.
struct UdpOutput {
    socket: Arc<UdpSocket>,
}

impl Write for UdpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type KcpCb = Kcp<UdpOutput>;

struct Shared {
    will_close: AtomicBool,
    recv_ring: ByteRing,
}

/// A handshake in flight. The thread is detached; `stop` makes an
/// abandoned handshake wind down instead of running out its full timeout.
struct HandshakeTask {
    slot: Arc<Mutex<Option<Result<(UdpSocket, u32), NetError>>>>,
    done: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

pub struct KcpTransport {
    state: ConnState,
    recv_capacity: usize,
    send_window: u16,
    recv_window: u16,
    shared: Arc<Shared>,
    handshake: Option<HandshakeTask>,
    socket: Option<Arc<UdpSocket>>,
    kcp: Option<Arc<Mutex<KcpCb>>>,
    recv_thread: Option<JoinHandle<()>>,
    /// Connection-local millisecond clock for `update`/`check`.
    clock: Instant,
    next_update: u32,
    decoder: FrameDecoder,
    /// Bytes drained from the receive ring but not yet accepted by the
    /// decoder; non-empty only across a decoder stall.
    pending: Vec<u8>,
    stall_passes: u8,
}

impl KcpTransport {
    /// Window sizes are in packets, per the KCP protocol.
    pub fn new(recv_capacity: usize, send_window: u16, recv_window: u16) -> KcpTransport {
        KcpTransport {
            state: ConnState::Disconnected,
            recv_capacity,
            send_window,
            recv_window,
            shared: Arc::new(Shared {
                will_close: AtomicBool::new(false),
                recv_ring: ByteRing::new(recv_capacity),
            }),
            handshake: None,
            socket: None,
            kcp: None,
            recv_thread: None,
            clock: Instant::now(),
            next_update: 0,
            decoder: FrameDecoder::new(),
            pending: Vec::new(),
            stall_passes: 0,
        }
    }

    /// Starts the handshake in the background. The result surfaces as a
    /// `ConnectDone` signal from a later `process()`.
    pub fn connect(&mut self, host: &str, port: u16) {
        if self.state != ConnState::Disconnected {
            self.close();
        }
        self.shared = Arc::new(Shared {
            will_close: AtomicBool::new(false),
            recv_ring: ByteRing::new(self.recv_capacity),
        });
        self.state = ConnState::Connecting;

        let addr = format!("{host}:{port}");
        debug!("kcp handshake with {addr}");

        let slot: Arc<Mutex<Option<Result<(UdpSocket, u32), NetError>>>> =
            Arc::new(Mutex::new(None));
        let done = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let task_slot = Arc::clone(&slot);
        let task_done = Arc::clone(&done);
        let task_stop = Arc::clone(&stop);

        let spawned = thread::Builder::new()
            .name("kbe-kcp-handshake".to_string())
            .spawn(move || {
                let result = handshake(&addr, &task_stop);
                if task_stop.load(Ordering::Acquire) {
                    return;
                }
                *lock(&task_slot) = Some(result);
                task_done.store(true, Ordering::Release);
            });

        match spawned {
            Ok(_) => self.handshake = Some(HandshakeTask { slot, done, stop }),
            Err(err) => {
                error!("spawning the handshake thread failed: {err}");
                self.handshake = None;
            }
        }
    }

    fn poll_connect(&mut self) -> TransportSignal {
        let finished = match &self.handshake {
            Some(task) => task.done.load(Ordering::Acquire),
            None => true,
        };
        if !finished {
            return TransportSignal::Idle;
        }

        let result = self
            .handshake
            .take()
            .and_then(|task| lock(&task.slot).take());
        match result {
            Some(Ok((socket, conv))) => match self.start_io(socket, conv) {
                Ok(()) => {
                    debug!("kcp conversation {conv} established");
                    self.state = ConnState::Connected;
                    TransportSignal::ConnectDone { success: true }
                }
                Err(err) => {
                    error!("starting the kcp receiver failed: {err}");
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

    fn start_io(&mut self, socket: UdpSocket, conv: u32) -> io::Result<()> {
        socket.set_read_timeout(Some(RECV_POLL))?;
        let socket = Arc::new(socket);

        let mut kcp = Kcp::new(
            conv,
            UdpOutput {
                socket: Arc::clone(&socket),
            },
        );
        if let Err(err) = kcp.set_mtu(KCP_MTU) {
            warn!("kcp rejected mtu {KCP_MTU}: {err:?}");
        }
        kcp.set_wndsize(self.send_window, self.recv_window);
        // Nodelay mode: 10 ms flush interval, fast resend after 2
        // duplicate acks, congestion window off.
        kcp.set_nodelay(true, KCP_UPDATE_INTERVAL_MS, KCP_FAST_RESEND, true);
        kcp.set_rx_minrto(KCP_MIN_RTO);
        let kcp = Arc::new(Mutex::new(kcp));

        let thread_socket = Arc::clone(&socket);
        let thread_kcp = Arc::clone(&kcp);
        let thread_shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("kbe-kcp-recv".to_string())
            .spawn(move || recv_loop(thread_socket, thread_kcp, thread_shared))?;

        self.recv_thread = Some(handle);
        self.socket = Some(socket);
        self.kcp = Some(kcp);
        self.clock = Instant::now();
        self.next_update = 0;
        Ok(())
    }

    fn pump(&mut self, catalog: &MessageCatalog, frames: &mut Vec<Frame>) -> TransportSignal {
        if let Some(kcp) = &self.kcp {
            let now = self.clock.elapsed().as_millis() as u32;
            if now >= self.next_update {
                let mut kcp = lock(kcp);
                if let Err(err) = kcp.update(now) {
                    error!("kcp update failed: {err:?}");
                    self.shared.will_close.store(true, Ordering::Release);
                }
                self.next_update = kcp.check(now);
            }
        }

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
        if let Some(task) = self.handshake.take() {
            task.stop.store(true, Ordering::Release);
        }
        // The receiver notices the closed ring within one poll interval.
        if let Some(handle) = self.recv_thread.take() {
            if handle.join().is_err() {
                warn!("socket thread panicked during teardown");
            }
        }
        self.kcp = None;
        self.socket = None;
        self.decoder.reset();
        self.pending.clear();
        self.stall_passes = 0;
        self.next_update = 0;
        self.shared.will_close.store(false, Ordering::Release);
        self.state = ConnState::Disconnected;
    }
}

impl Transport for KcpTransport {
    fn process(&mut self, catalog: &MessageCatalog, frames: &mut Vec<Frame>) -> TransportSignal {
        if self.shared.will_close.load(Ordering::Acquire) {
            self.close();
            return TransportSignal::ConnectionLost;
        }

        match self.state {
            ConnState::Disconnected | ConnState::Closing => TransportSignal::Idle,
            ConnState::Connecting => self.poll_connect(),
            ConnState::Connected => self.pump(catalog, frames),
        }
    }

    fn state(&self) -> ConnState {
        self.state
    }

    fn valid(&self) -> bool {
        self.state == ConnState::Connected
            && self.kcp.is_some()
            && !self.shared.will_close.load(Ordering::Acquire)
    }

    fn send_segment(&mut self, data: &[u8]) -> Result<(), SendError> {
        if !self.valid() {
            return Err(SendError);
        }
        // Forces an update (and with it a flush) on the next pump.
        self.next_update = 0;
        let kcp = match &self.kcp {
            Some(kcp) => kcp,
            None => return Err(SendError),
        };
        match lock(kcp).send(data) {
            Ok(_) => Ok(()),
            Err(err) => {
                error!("kcp send failed: {err:?}");
                self.shared.will_close.store(true, Ordering::Release);
                Err(SendError)
            }
        }
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

impl Drop for KcpTransport {
    fn drop(&mut self) {
        self.reset();
    }
}

fn handshake(addr: &str, stop: &AtomicBool) -> Result<(UdpSocket, u32), NetError> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(NetError::Io)?;
    socket.connect(addr).map_err(|source| NetError::Connect {
        addr: addr.to_string(),
        source,
    })?;
    socket
        .set_read_timeout(Some(HANDSHAKE_RETRY))
        .map_err(NetError::Io)?;

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut last_hello: Option<Instant> = None;
    let mut reply = [0u8; UDP_PACKET_MAX];

    loop {
        if stop.load(Ordering::Acquire) || Instant::now() >= deadline {
            return Err(NetError::HandshakeTimeout {
                secs: HANDSHAKE_TIMEOUT.as_secs(),
            });
        }

        let due = last_hello.map_or(true, |at| at.elapsed() >= HANDSHAKE_RETRY);
        if due {
            socket.send(UDP_HELLO.as_bytes()).map_err(NetError::Io)?;
            last_hello = Some(Instant::now());
        }

        match socket.recv(&mut reply) {
            Ok(n) => {
                if let Some(conv) = parse_hello_ack(&reply[..n]) {
                    if conv == 0 {
                        return Err(NetError::HandshakeRefused {
                            addr: addr.to_string(),
                        });
                    }
                    return Ok((socket, conv));
                }
                // Not our ack; keep waiting.
            }
            Err(err) if ignorable_recv_error(err.kind()) => {}
            Err(err) => return Err(NetError::Io(err)),
        }
    }
}

/// Returns the conversation id of a well-formed ack, `None` otherwise.
fn parse_hello_ack(datagram: &[u8]) -> Option<u32> {
    let mut s = ByteStream::from_bytes(datagram);
    if s.read_string().ok()? != UDP_HELLO_ACK {
        return None;
    }
    let _version = s.read_string().ok()?;
    s.read_u32().ok()
}

fn recv_loop(socket: Arc<UdpSocket>, kcp: Arc<Mutex<KcpCb>>, shared: Arc<Shared>) {
    let mut datagram = vec![0u8; UDP_PACKET_MAX];
    let mut staged: Vec<Vec<u8>> = Vec::new();
    while !shared.recv_ring.is_closed() {
        match socket.recv(&mut datagram) {
            Ok(n) => {
                staged.clear();
                {
                    let mut kcp = lock(&kcp);
                    if let Err(err) = kcp.input(&datagram[..n]) {
                        warn!("kcp rejected a datagram: {err:?}");
                    }
                    // Stage the reassembled messages so the ring wait
                    // below never holds the control block locked.
                    loop {
                        let size = match kcp.peeksize() {
                            Ok(size) => size,
                            Err(_) => break,
                        };
                        let mut message = vec![0u8; size];
                        match kcp.recv(&mut message) {
                            Ok(n) => {
                                message.truncate(n);
                                staged.push(message);
                            }
                            Err(err) => {
                                warn!("kcp recv failed: {err:?}");
                                break;
                            }
                        }
                    }
                }
                for message in &staged {
                    if !push_all(&shared, message) {
                        return;
                    }
                }
            }
            Err(err) if ignorable_recv_error(err.kind()) => {}
            Err(err) => {
                if !shared.recv_ring.is_closed() {
                    error!("udp read failed: {err}");
                    shared.will_close.store(true, Ordering::Release);
                }
                return;
            }
        }
    }
}

/// Pushes a whole message, chunked to whatever space frees up. False
/// means the connection is done for, flagged or closed.
fn push_all(shared: &Shared, mut bytes: &[u8]) -> bool {
    while !bytes.is_empty() {
        let space = shared.recv_ring.wait_space(STALL_RETRIES, STALL_WAIT);
        if space == 0 {
            if !shared.recv_ring.is_closed() {
                error!("receive ring stayed full, dropping the connection");
                shared.will_close.store(true, Ordering::Release);
            }
            return false;
        }
        let take = space.min(bytes.len());
        if shared.recv_ring.push(&bytes[..take]).is_err() {
            return false;
        }
        bytes = &bytes[take..];
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack_datagram(magic: &str, conv: u32) -> Vec<u8> {
        let mut s = ByteStream::new();
        s.write_string(magic);
        s.write_string("2.5.10");
        s.write_u32(conv);
        s.written().to_vec()
    }

    // ========== Handshake Parsing ==========

    #[test]
    fn well_formed_ack_yields_conversation_id() {
        let ack = ack_datagram(UDP_HELLO_ACK, 0x00C0FFEE);
        assert_eq!(parse_hello_ack(&ack), Some(0x00C0FFEE));
    }

    #[test]
    fn refused_ack_carries_conversation_zero() {
        let ack = ack_datagram(UDP_HELLO_ACK, 0);
        assert_eq!(parse_hello_ack(&ack), Some(0));
    }

    #[test]
    fn foreign_datagrams_are_ignored() {
        assert_eq!(parse_hello_ack(&ack_datagram("not-the-ack", 9)), None);
        assert_eq!(parse_hello_ack(b"raw noise"), None);
        assert_eq!(parse_hello_ack(&[]), None);
    }

    #[test]
    fn truncated_ack_is_ignored() {
        let mut ack = ack_datagram(UDP_HELLO_ACK, 77);
        ack.truncate(ack.len() - 2);
        assert_eq!(parse_hello_ack(&ack), None);
    }

    // ========== Lifecycle ==========

    #[test]
    fn fresh_transport_is_disconnected_and_refuses_sends() {
        let mut transport = KcpTransport::new(256, 128, 128);
        assert_eq!(transport.state(), ConnState::Disconnected);
        assert!(!transport.valid());
        assert!(transport.send_segment(&[1, 2, 3]).is_err());
    }
}
