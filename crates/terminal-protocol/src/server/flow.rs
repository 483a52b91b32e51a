use std::time::{Duration, Instant};

/// An interval-reset token bucket.
///
/// Unlike a trickle bucket, tokens do not accumulate over time: each elapsed
/// refill interval snaps `remaining` back to the full capacity. `None`
/// capacity means unlimited.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: Option<u64>,
    remaining: u64,
    refill_interval: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: Option<u64>, refill_interval: Duration) -> Self {
        Self {
            capacity,
            remaining: capacity.unwrap_or(0),
            refill_interval,
            last_refill: Instant::now(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, Duration::from_millis(1000))
    }

    /// Take one token if available. Unlimited buckets always grant.
    pub fn try_take(&mut self) -> bool {
        self.try_take_at(Instant::now())
    }

    /// Whether a token would be granted, without consuming one.
    pub fn peek(&mut self) -> bool {
        self.refill(Instant::now());
        self.capacity.is_none() || self.remaining > 0
    }

    fn try_take_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        match self.capacity {
            None => true,
            Some(_) if self.remaining > 0 => {
                self.remaining -= 1;
                true
            }
            Some(_) => false,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now.duration_since(self.last_refill) >= self.refill_interval {
            self.remaining = self.capacity.unwrap_or(0);
            self.last_refill = now;
        }
    }
}
