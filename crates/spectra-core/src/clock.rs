use chrono::{DateTime, Utc};

/// Time source injected into every component that makes cooldown or
/// scheduling decisions, so tests can pin the clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used by the daemon.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests that exercise cooldown and scheduling logic.
#[derive(Debug)]
pub struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(std::sync::Mutex::new(start))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Deterministic jitter in `0..max` derived from the sub-second nanos of
/// the current wall clock. Avoids a rand dependency; callers that need a
/// bounded pseudo-random pick (rotation, invitation delays) share this.
pub fn nano_jitter(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos as u64) % max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nano_jitter_zero_max() {
        assert_eq!(nano_jitter(0), 0);
    }

    #[test]
    fn nano_jitter_bounded() {
        for _ in 0..100 {
            assert!(nano_jitter(7) < 7);
        }
    }
}
