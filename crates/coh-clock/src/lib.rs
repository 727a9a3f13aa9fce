//! A `Clock` abstraction so that phase history, receipts, and the episode
//! executor never call `Utc::now()`/`SystemTime::now()` directly. Only
//! `SystemClock` touches the wall clock; everything else takes a `&dyn
//! Clock` and is otherwise pure.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock, used only at the process boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that always returns the same instant, or advances by a fixed
/// step each call — for deterministic tests.
#[derive(Debug, Clone)]
pub struct FixedClock {
    current: std::sync::Arc<std::sync::Mutex<DateTime<Utc>>>,
    step: chrono::Duration,
}

impl FixedClock {
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self {
            current: std::sync::Arc::new(std::sync::Mutex::new(instant)),
            step: chrono::Duration::zero(),
        }
    }

    pub fn ticking_from(instant: DateTime<Utc>, step: chrono::Duration) -> Self {
        Self {
            current: std::sync::Arc::new(std::sync::Mutex::new(instant)),
            step,
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        let mut guard = self.current.lock().expect("FixedClock mutex poisoned");
        let value = *guard;
        *guard = value + self.step;
        value
    }
}
