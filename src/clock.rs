use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Wall clock and sleep, behind a trait so tests can simulate waiting
/// without real delays.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn sleep(&self, period: Duration);

    /// Current unix time in whole seconds.
    fn unix_secs(&self) -> i64 {
        self.now().timestamp()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// The real thing: `Utc::now` and `thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, period: Duration) {
        std::thread::sleep(period);
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
