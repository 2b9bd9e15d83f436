use chrono::{DateTime, Duration, Utc};

/// Gates work to a fixed rhythm on a logical clock. The owner loop may tick as
/// often as it likes; `ready` fires at most once per period. Driven by injected
/// time, so cadences are testable without wall-clock sleeps.
#[derive(Debug)]
pub struct CadenceGate {
    period: Duration,
    last_fired: Option<DateTime<Utc>>,
}

impl CadenceGate {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_fired: None,
        }
    }

    /// True when the period has elapsed since the previous firing, advancing the
    /// gate. An untouched gate fires on the first call.
    pub fn ready(&mut self, now: DateTime<Utc>) -> bool {
        match self.last_fired {
            Some(last) if now - last < self.period => false,
            _ => {
                self.last_fired = Some(now);
                true
            }
        }
    }

    /// Restarts the period without firing.
    pub fn rearm(&mut self, now: DateTime<Utc>) {
        self.last_fired = Some(now);
    }
}
