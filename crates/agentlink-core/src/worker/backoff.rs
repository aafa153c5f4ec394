//! Crash accounting and restart delays

use crate::config::RestartPolicy;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after `delay`. `attempt` counts crashes inside the window.
    Restart { attempt: usize, delay: Duration },
    /// Too many crashes inside the window
    GiveUp { crashes: usize },
}

/// Rolling-window crash counter with exponential backoff
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    crashes: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            crashes: VecDeque::new(),
        }
    }

    pub fn record_crash(&mut self, now: Instant) -> RestartDecision {
        self.expire(now);
        self.crashes.push_back(now);

        let crashes = self.crashes.len();
        if crashes > self.policy.max_restarts {
            RestartDecision::GiveUp { crashes }
        } else {
            RestartDecision::Restart {
                attempt: crashes,
                delay: self.delay_for(crashes),
            }
        }
    }

    /// `initial * multiplier^(attempt-1)`, capped at the max delay
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let max = self.policy.max_delay();
        let secs = self.policy.initial_delay().as_secs_f64() * self.policy.multiplier.powi(exponent);
        // Overflow or infinity lands on the cap
        Duration::try_from_secs_f64(secs).map_or(max, |delay| delay.min(max))
    }

    pub fn crashes_in_window(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.crashes.len()
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    fn expire(&mut self, now: Instant) {
        let window = self.policy.window();
        while let Some(oldest) = self.crashes.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
    }
}
