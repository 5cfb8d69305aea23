use std::time::Duration;

/// Reconnect delay: starts at `initial`, doubles on every use, no ceiling.
/// Reset to `initial` once a transport opens.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration) -> Self {
        Backoff {
            initial,
            current: initial,
        }
    }

    /// Delay the next reconnect would wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Take the current delay and double it for next time.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.checked_mul(2).unwrap_or(Duration::MAX);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
