use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Which limit an inbound envelope ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    /// Too many envelopes in the window.
    Messages,
    /// Too many bytes in the window.
    Bytes,
}

impl Throttle {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Messages => "msg_rate",
            Self::Bytes => "bw_rate",
        }
    }
}

/// Per-connection sliding-window limiter over inbound envelopes.
///
/// Each accepted envelope is remembered with its arrival time and size until
/// it falls out of the trailing one-minute window. The window never holds more
/// than `max_messages` entries because anything beyond that is refused.
#[derive(Debug)]
pub struct InboundLimiter {
    max_messages: u32,
    max_bytes: u64,
    window: VecDeque<(Instant, u64)>,
    bytes_in_window: u64,
}

impl InboundLimiter {
    /// Limiter allowing `max_messages` envelopes and `max_bytes` bytes per minute.
    #[must_use]
    pub fn new(max_messages: u32, max_bytes: u64) -> Self {
        Self {
            max_messages,
            max_bytes,
            window: VecDeque::new(),
            bytes_in_window: 0,
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.window.front() {
            if now.saturating_duration_since(at) < WINDOW {
                break;
            }
            self.bytes_in_window = self.bytes_in_window.saturating_sub(bytes);
            self.window.pop_front();
        }
    }

    /// Record an envelope of `bytes` arriving at `now`, or refuse it.
    ///
    /// Refused envelopes are not recorded.
    ///
    /// # Errors
    ///
    /// Returns the [`Throttle`] that was hit.
    pub fn admit(&mut self, now: Instant, bytes: usize) -> Result<(), Throttle> {
        self.expire(now);

        let bytes = bytes as u64;
        if self.window.len() >= self.max_messages as usize {
            return Err(Throttle::Messages);
        }
        if self.bytes_in_window.saturating_add(bytes) > self.max_bytes {
            return Err(Throttle::Bytes);
        }

        self.window.push_back((now, bytes));
        self.bytes_in_window = self.bytes_in_window.saturating_add(bytes);
        Ok(())
    }

    /// Envelopes currently counted against the limit.
    #[must_use]
    pub fn messages_in_window(&self) -> usize {
        self.window.len()
    }

    /// Bytes currently counted against the limit.
    #[must_use]
    pub fn bytes_in_window(&self) -> u64 {
        self.bytes_in_window
    }
}
