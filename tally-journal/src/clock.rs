use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;

/// Injected time source. Production code reads wall time through this so
/// tests can pin and advance it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    /// Monotonic elapsed time since the clock was created; used for
    /// deadlines and runtime guardrails.
    fn monotonic(&self) -> Duration;
}

pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Test clock advanced by hand.
pub struct ManualClock {
    state: Mutex<(DateTime<Utc>, Duration)>,
}

impl ManualClock {
    #[must_use]
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new((now, Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.0 += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
            state.1 += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().map(|state| state.0).unwrap_or_else(|_| Utc::now())
    }

    fn monotonic(&self) -> Duration {
        self.state.lock().map(|state| state.1).unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn manual_clock_advances_wall_and_monotonic_time() {
        let start = DateTime::parse_from_rfc3339("2025-10-15T12:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&Utc);
        let clock = ManualClock::at(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.monotonic(), Duration::ZERO);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
        assert_eq!(clock.monotonic(), Duration::from_secs(90));
    }
}
