//! Keep-alive bookkeeping for a server connection.
//!
//! The server answers every client tick with an app-tick callback. If a
//! whole interval passes without that answer arriving, the link is
//! considered dead even though the socket still looks healthy.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    /// Time to send a tick to the server.
    SendTick,
    /// The previous tick was never answered.
    TimedOut,
}

#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    last_tick: Instant,
    last_reply: Instant,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Heartbeat {
        let now = Instant::now();
        Heartbeat {
            interval,
            last_tick: now,
            last_reply: now,
        }
    }

    /// Call once per `process()`. `SendTick` also arms the reply deadline;
    /// the caller must follow up with `on_reply` when the server answers.
    pub fn poll(&mut self) -> HeartbeatAction {
        if self.interval.is_zero() {
            return HeartbeatAction::Idle;
        }

        let now = Instant::now();
        if now.duration_since(self.last_tick) < self.interval {
            return HeartbeatAction::Idle;
        }

        if self.last_reply < self.last_tick {
            return HeartbeatAction::TimedOut;
        }

        self.last_tick = now;
        HeartbeatAction::SendTick
    }

    pub fn on_reply(&mut self) {
        self.last_reply = Instant::now();
    }

    /// Restarts both clocks, for a fresh connection.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.last_tick = now;
        self.last_reply = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread::sleep;

    #[test]
    fn zero_interval_never_fires() {
        let mut hb = Heartbeat::new(Duration::ZERO);
        sleep(Duration::from_millis(5));
        assert_eq!(hb.poll(), HeartbeatAction::Idle);
    }

    #[test]
    fn answered_ticks_keep_the_link_alive() {
        let mut hb = Heartbeat::new(Duration::from_millis(10));
        assert_eq!(hb.poll(), HeartbeatAction::Idle);

        sleep(Duration::from_millis(12));
        assert_eq!(hb.poll(), HeartbeatAction::SendTick);
        hb.on_reply();

        sleep(Duration::from_millis(12));
        assert_eq!(hb.poll(), HeartbeatAction::SendTick);
    }

    #[test]
    fn unanswered_tick_times_out() {
        let mut hb = Heartbeat::new(Duration::from_millis(10));
        sleep(Duration::from_millis(12));
        assert_eq!(hb.poll(), HeartbeatAction::SendTick);

        // No reply before the next interval elapses.
        sleep(Duration::from_millis(12));
        assert_eq!(hb.poll(), HeartbeatAction::TimedOut);
    }

    #[test]
    fn reset_forgives_a_pending_tick() {
        let mut hb = Heartbeat::new(Duration::from_millis(10));
        sleep(Duration::from_millis(12));
        assert_eq!(hb.poll(), HeartbeatAction::SendTick);

        hb.reset();
        assert_eq!(hb.poll(), HeartbeatAction::Idle);
    }
}
