//! Byte rings bridging the main thread and the socket threads.
//!
//! Each transport direction gets one ring: the receive ring is filled by a
//! reader thread and drained into the frame decoder from `process()`, the
//! send ring is filled by `send_segment` and drained by a writer thread.
//! Capacity never grows. A full ring is back-pressure, and back-pressure
//! that outlives the bounded retries is treated as a dead connection.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How many timed waits a stalled socket thread makes before giving up.
pub const STALL_RETRIES: u32 = 10;
/// Wait per retry.
pub const STALL_WAIT: Duration = Duration::from_millis(100);

/// Push rejected: the ring does not have room for the whole slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

struct State {
    /// Capacity + 1 bytes of storage; the one-byte gap keeps a full ring
    /// distinguishable from an empty one.
    buf: Box<[u8]>,
    rpos: usize,
    wpos: usize,
    closed: bool,
}

impl State {
    fn len(&self) -> usize {
        (self.wpos + self.buf.len() - self.rpos) % self.buf.len()
    }

    fn space(&self) -> usize {
        self.buf.len() - 1 - self.len()
    }

    fn copy_out(&self, out: &mut Vec<u8>) -> usize {
        let n = self.len();
        let end = self.rpos + n;
        if end <= self.buf.len() {
            out.extend_from_slice(&self.buf[self.rpos..end]);
        } else {
            out.extend_from_slice(&self.buf[self.rpos..]);
            out.extend_from_slice(&self.buf[..end % self.buf.len()]);
        }
        n
    }
}

pub struct ByteRing {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
}

impl ByteRing {
    pub fn new(capacity: usize) -> ByteRing {
        ByteRing {
            state: Mutex::new(State {
                buf: vec![0u8; capacity + 1].into_boxed_slice(),
                rpos: 0,
                wpos: 0,
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().buf.len() - 1
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn space(&self) -> usize {
        self.lock().space()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Copies the whole slice in, or nothing. Wakes the reading side.
    pub fn push(&self, bytes: &[u8]) -> Result<(), RingFull> {
        let mut s = self.lock();
        if s.closed || bytes.len() > s.space() {
            return Err(RingFull);
        }

        let storage = s.buf.len();
        let first = bytes.len().min(storage - s.wpos);
        let wpos = s.wpos;
        s.buf[wpos..wpos + first].copy_from_slice(&bytes[..first]);
        s.buf[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        s.wpos = (wpos + bytes.len()) % storage;

        drop(s);
        self.readable.notify_one();
        Ok(())
    }

    /// Blocks until some space frees up, making at most `retries` timed
    /// waits of `wait` each. Returns the free byte count, or 0 when the
    /// ring stayed full through every retry or was closed.
    pub fn wait_space(&self, retries: u32, wait: Duration) -> usize {
        let mut s = self.lock();
        let mut attempts = 0;
        loop {
            if s.closed {
                return 0;
            }
            let space = s.space();
            if space > 0 {
                return space;
            }
            if attempts == retries {
                return 0;
            }
            attempts += 1;
            s = match self.writable.wait_timeout(s, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Blocks until at least one byte is readable. Returns false only when
    /// the ring was closed and fully drained.
    pub fn wait_data(&self) -> bool {
        let mut s = self.lock();
        while s.len() == 0 && !s.closed {
            s = self.readable.wait(s).unwrap_or_else(PoisonError::into_inner);
        }
        s.len() > 0
    }

    /// Appends every readable byte to `out` and consumes it. Wakes the
    /// writing side. Returns the byte count moved.
    pub fn drain_into(&self, out: &mut Vec<u8>) -> usize {
        let mut s = self.lock();
        let n = s.copy_out(out);
        s.rpos = s.wpos;
        drop(s);
        if n > 0 {
            self.writable.notify_one();
        }
        n
    }

    /// Appends every readable byte to `out` without consuming. The caller
    /// acknowledges what it used via `consume`, so the ring never has to
    /// stay locked across a socket write.
    pub fn peek_into(&self, out: &mut Vec<u8>) -> usize {
        self.lock().copy_out(out)
    }

    pub fn consume(&self, n: usize) {
        let mut s = self.lock();
        let n = n.min(s.len());
        s.rpos = (s.rpos + n) % s.buf.len();
        drop(s);
        if n > 0 {
            self.writable.notify_one();
        }
    }

    /// Marks the ring dead and wakes every waiter. Data already inside
    /// stays readable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Capacity And Wrap ==========

    #[test]
    fn holds_exactly_its_capacity() {
        let ring = ByteRing::new(8);
        assert_eq!(ring.capacity(), 8);
        assert!(ring.push(&[1; 8]).is_ok());
        assert_eq!(ring.space(), 0);
        assert_eq!(ring.push(&[9]), Err(RingFull));
    }

    #[test]
    fn wrapped_contents_come_out_in_order() {
        let ring = ByteRing::new(8);
        ring.push(&[1, 2, 3, 4, 5, 6]).unwrap();
        ring.consume(4);

        // Crosses the physical end of the buffer.
        ring.push(&[7, 8, 9, 10, 11]).unwrap();

        let mut out = Vec::new();
        assert_eq!(ring.drain_into(&mut out), 7);
        assert_eq!(out, vec![5, 6, 7, 8, 9, 10, 11]);
        assert!(ring.is_empty());
    }

    #[test]
    fn rejected_push_leaves_the_ring_untouched() {
        let ring = ByteRing::new(4);
        ring.push(&[1, 2]).unwrap();
        assert_eq!(ring.push(&[3, 4, 5]), Err(RingFull));

        let mut out = Vec::new();
        ring.drain_into(&mut out);
        assert_eq!(out, vec![1, 2]);
    }

    // ========== Peek And Consume ==========

    #[test]
    fn peek_does_not_consume() {
        let ring = ByteRing::new(8);
        ring.push(&[1, 2, 3]).unwrap();

        let mut out = Vec::new();
        assert_eq!(ring.peek_into(&mut out), 3);
        assert_eq!(ring.len(), 3);

        ring.consume(2);
        out.clear();
        ring.drain_into(&mut out);
        assert_eq!(out, vec![3]);
    }

    // ========== Close Semantics ==========

    #[test]
    fn closed_ring_refuses_writes_but_drains_leftovers() {
        let ring = ByteRing::new(8);
        ring.push(&[1, 2]).unwrap();
        ring.close();

        assert_eq!(ring.push(&[3]), Err(RingFull));
        assert!(ring.wait_data());

        let mut out = Vec::new();
        ring.drain_into(&mut out);
        assert_eq!(out, vec![1, 2]);
        assert!(!ring.wait_data());
    }

    #[test]
    fn wait_space_gives_up_on_a_full_closed_ring() {
        let ring = ByteRing::new(2);
        ring.push(&[1, 2]).unwrap();
        ring.close();
        assert_eq!(ring.wait_space(3, Duration::from_millis(1)), 0);
    }

    #[test]
    fn wait_space_bounded_retries_fail_while_full() {
        let ring = ByteRing::new(2);
        ring.push(&[1, 2]).unwrap();
        assert_eq!(ring.wait_space(2, Duration::from_millis(1)), 0);

        ring.consume(1);
        assert_eq!(ring.wait_space(2, Duration::from_millis(1)), 1);
    }
}
