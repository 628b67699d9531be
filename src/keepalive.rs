//! Liveness tracking
//!
//! A ping goes out every `ping_interval`. Once one is outstanding, any
//! inbound traffic (not only a pong) proves the peer alive; if nothing arrives
//! within `pong_timeout` the connection is considered dead.

use std::time::Duration;

use tokio::time::Instant;

/// What the connection should do on a keepalive tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping and start waiting
    SendPing,
    /// A ping is outstanding and still within its deadline
    Wait,
    /// No traffic since the ping for longer than the deadline
    Timeout(Duration),
}

/// Ping/pong bookkeeping for one connection
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pong_timeout: Duration,
    ping_sent_at: Option<Instant>,
    last_seen: Instant,
}

impl Heartbeat {
    /// Create heartbeat state starting at `now`
    pub fn new(pong_timeout: Duration, now: Instant) -> Self {
        Self {
            pong_timeout,
            ping_sent_at: None,
            last_seen: now,
        }
    }

    /// Reset state for a new connection
    pub fn reset(&mut self, now: Instant) {
        self.ping_sent_at = None;
        self.last_seen = now;
    }

    /// Record inbound traffic of any kind
    pub fn record_traffic(&mut self, now: Instant) {
        self.last_seen = now;
        self.ping_sent_at = None;
    }

    /// Mark that a ping was written
    pub fn mark_ping_sent(&mut self, now: Instant) {
        self.ping_sent_at = Some(now);
    }

    /// Check if we're currently waiting for a pong
    pub fn is_waiting(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// Time of the last inbound traffic
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Decide the next step at time `now`
    pub fn poll(&self, now: Instant) -> HeartbeatAction {
        match self.ping_sent_at {
            None => HeartbeatAction::SendPing,
            Some(sent) => {
                let elapsed = now.saturating_duration_since(sent);
                if elapsed >= self.pong_timeout {
                    HeartbeatAction::Timeout(elapsed)
                } else {
                    HeartbeatAction::Wait
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_then_timeout() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(Duration::from_secs(20), start);

        assert_eq!(hb.poll(start), HeartbeatAction::SendPing);
        hb.mark_ping_sent(start);
        assert!(hb.is_waiting());

        assert_eq!(hb.poll(start + Duration::from_secs(19)), HeartbeatAction::Wait);
        assert_eq!(
            hb.poll(start + Duration::from_secs(20)),
            HeartbeatAction::Timeout(Duration::from_secs(20))
        );
    }

    #[test]
    fn test_any_traffic_clears_wait() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(Duration::from_secs(5), start);

        hb.mark_ping_sent(start);
        hb.record_traffic(start + Duration::from_secs(3));
        assert!(!hb.is_waiting());
        assert_eq!(hb.last_seen(), start + Duration::from_secs(3));
        assert_eq!(hb.poll(start + Duration::from_secs(60)), HeartbeatAction::SendPing);
    }

    #[test]
    fn test_reset() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(Duration::from_secs(1), start);
        hb.mark_ping_sent(start);
        hb.reset(start + Duration::from_secs(10));
        assert!(!hb.is_waiting());
        assert_eq!(hb.last_seen(), start + Duration::from_secs(10));
    }
}
