use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { since: Instant },
    /// One trial read is allowed through.
    HalfOpen,
}

/// Guards event-log reads: trips after `threshold` consecutive failures and
/// lets a single trial read through once `cooldown` has passed.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open { .. })
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        let trip = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.failures >= self.threshold,
            CircuitState::Open { .. } => false,
        };
        if trip {
            self.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    pub fn allow(&mut self) -> bool {
        if let CircuitState::Open { since } = self.state {
            if since.elapsed() < self.cooldown {
                return false;
            }
            self.state = CircuitState::HalfOpen;
        }
        true
    }
}
