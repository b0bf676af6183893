// Per-connection inbound throttles.
//
// Each socket task owns its limiter, so no locking is needed.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use freemonitor_common::protocol::events::InboundEvent;

pub const DEFAULT_TELEMETRY_PER_MINUTE: usize = 1_000;
pub const DEFAULT_CONTROL_PER_MINUTE: usize = 100;
const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

/// Sliding-window counter: at most `max_requests` inside any `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self { max_requests, window, requests: VecDeque::new() }
    }

    pub fn check(&mut self) -> RateLimitDecision {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> RateLimitDecision {
        while let Some(oldest) = self.requests.front() {
            if now.duration_since(*oldest) < self.window {
                break;
            }
            self.requests.pop_front();
        }

        if self.requests.len() >= self.max_requests {
            let retry_after_secs = self
                .requests
                .front()
                .map(|oldest| {
                    self.window
                        .checked_sub(now.duration_since(*oldest))
                        .unwrap_or_default()
                        .as_secs()
                        .max(1)
                })
                .unwrap_or(1);
            return RateLimitDecision::Limited { retry_after_secs };
        }

        self.requests.push_back(now);
        RateLimitDecision::Allowed
    }
}

/// The two throttles applied to one connection: telemetry gets its own,
/// larger budget, while alert and subscription events share the control
/// budget. `ping` is never throttled.
#[derive(Debug)]
pub struct ConnectionRateLimits {
    telemetry: RateLimiter,
    control: RateLimiter,
}

impl Default for ConnectionRateLimits {
    fn default() -> Self {
        Self::per_minute(DEFAULT_TELEMETRY_PER_MINUTE, DEFAULT_CONTROL_PER_MINUTE)
    }
}

impl ConnectionRateLimits {
    pub fn per_minute(telemetry: usize, control: usize) -> Self {
        Self {
            telemetry: RateLimiter::new(telemetry, WINDOW),
            control: RateLimiter::new(control, WINDOW),
        }
    }

    pub fn check(&mut self, event: &InboundEvent) -> RateLimitDecision {
        self.check_at(event, Instant::now())
    }

    pub fn check_at(&mut self, event: &InboundEvent, now: Instant) -> RateLimitDecision {
        match event {
            InboundEvent::TelemetrySubmit(_) => self.telemetry.check_at(now),
            InboundEvent::AlertTrigger(_)
            | InboundEvent::DeviceSubscribe(_)
            | InboundEvent::DeviceUnsubscribe(_) => self.control.check_at(now),
            InboundEvent::Ping => RateLimitDecision::Allowed,
        }
    }
}
