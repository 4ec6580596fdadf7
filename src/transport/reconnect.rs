use std::time::Duration;

/// Outcome of a connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait `delay` and try again
    Retry { attempt: u32, delay: Duration },
    /// The attempt budget is spent; reported once
    Exhausted { attempts: u32 },
}

/// Linear reconnect backoff: the n-th reconnect waits `n × base_delay`.
///
/// Attempts count reconnects since the last successful `started` ack.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    base_delay: Duration,
    attempt: u32,
    exhausted: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            attempt: 0,
            exhausted: false,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Record a failed or dropped connection. Returns `None` once exhausted.
    pub fn on_failure(&mut self) -> Option<Backoff> {
        if self.exhausted {
            return None;
        }
        if self.attempt >= self.max_attempts {
            self.exhausted = true;
            return Some(Backoff::Exhausted {
                attempts: self.attempt,
            });
        }
        self.attempt += 1;
        Some(Backoff::Retry {
            attempt: self.attempt,
            delay: self.base_delay * self.attempt,
        })
    }

    /// The server acknowledged a session
    pub fn on_started(&mut self) {
        self.attempt = 0;
    }

    /// Fresh budget, used when the session is restarted
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.exhausted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_delays_then_exhausted_once() {
        let base = Duration::from_secs(2);
        let mut policy = ReconnectPolicy::new(5, base);

        for n in 1..=5u32 {
            assert_eq!(
                policy.on_failure(),
                Some(Backoff::Retry {
                    attempt: n,
                    delay: base * n
                })
            );
        }
        assert_eq!(policy.on_failure(), Some(Backoff::Exhausted { attempts: 5 }));
        assert!(policy.is_exhausted());
        assert_eq!(policy.on_failure(), None);
        assert_eq!(policy.on_failure(), None);
    }

    #[test]
    fn test_started_resets_attempts() {
        let base = Duration::from_millis(100);
        let mut policy = ReconnectPolicy::new(2, base);
        policy.on_failure();
        policy.on_failure();
        policy.on_started();
        assert_eq!(
            policy.on_failure(),
            Some(Backoff::Retry {
                attempt: 1,
                delay: base
            })
        );
    }

    #[test]
    fn test_zero_budget_exhausts_immediately() {
        let mut policy = ReconnectPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.on_failure(), Some(Backoff::Exhausted { attempts: 0 }));
        assert_eq!(policy.on_failure(), None);
    }
}
