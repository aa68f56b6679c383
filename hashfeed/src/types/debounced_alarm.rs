//! Debounced alarm with optional reminders.
//!
//! The watchdog uses this for "all pools down": a brief outage while the
//! scheduler fails over should stay quiet, a sustained one should be logged
//! at error level, and a long one should be logged again every so often so
//! it does not scroll out of view.
//!
//! ```text
//!            raise                  held >= debounce
//!  Clear ───────────► Arming ─────────────────────► Raised ──┐
//!    ▲                  │                             │  ▲    │ held >= repeat
//!    │      clear       │            clear            │  └────┘ (Reminder)
//!    └──────────────────┴─────────────────────────────┘
//! ```

use std::time::Duration;

use tokio::time::Instant;

/// What [`DebouncedAlarm::check`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmStatus {
    /// Condition false, nothing outstanding.
    Idle,
    /// Condition true but not yet for the debounce period.
    Pending,
    /// Condition has now held for the debounce period. Returned once per
    /// episode.
    Triggered,
    /// Still raised; nothing new to report.
    Active,
    /// Still raised and the repeat interval has elapsed since the last
    /// report.
    Reminder,
    /// Condition cleared after the alarm had been raised. Returned once.
    Resolved,
}

#[derive(Debug)]
enum State {
    Clear,
    Arming { since: Instant },
    Raised { last_report: Instant },
}

#[derive(Debug)]
pub struct DebouncedAlarm {
    debounce: Duration,
    repeat: Option<Duration>,
    state: State,
}

impl DebouncedAlarm {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            repeat: None,
            state: State::Clear,
        }
    }

    /// Report [`AlarmStatus::Reminder`] every `interval` while raised.
    pub fn with_repeat(mut self, interval: Duration) -> Self {
        self.repeat = Some(interval);
        self
    }

    /// Feed the current condition and get the resulting status.
    pub fn check(&mut self, condition: bool) -> AlarmStatus {
        let now = Instant::now();
        match (&self.state, condition) {
            (State::Clear, false) => AlarmStatus::Idle,
            (State::Clear, true) => {
                self.state = State::Arming { since: now };
                AlarmStatus::Pending
            }
            (State::Arming { .. }, false) => {
                self.state = State::Clear;
                AlarmStatus::Idle
            }
            (State::Arming { since }, true) => {
                if now.duration_since(*since) >= self.debounce {
                    self.state = State::Raised { last_report: now };
                    AlarmStatus::Triggered
                } else {
                    AlarmStatus::Pending
                }
            }
            (State::Raised { .. }, false) => {
                self.state = State::Clear;
                AlarmStatus::Resolved
            }
            (State::Raised { last_report }, true) => match self.repeat {
                Some(interval) if now.duration_since(*last_report) >= interval => {
                    self.state = State::Raised { last_report: now };
                    AlarmStatus::Reminder
                }
                _ => AlarmStatus::Active,
            },
        }
    }

    pub fn is_raised(&self) -> bool {
        matches!(self.state, State::Raised { .. })
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_transient_condition_stays_quiet() {
        let mut alarm = DebouncedAlarm::new(Duration::from_secs(60));
        assert_eq!(alarm.check(true), AlarmStatus::Pending);

        time::advance(Duration::from_secs(59)).await;
        assert_eq!(alarm.check(true), AlarmStatus::Pending);
        assert_eq!(alarm.check(false), AlarmStatus::Idle);
        assert!(!alarm.is_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_once_then_resolves_once() {
        let mut alarm = DebouncedAlarm::new(Duration::from_secs(60));
        alarm.check(true);

        time::advance(Duration::from_secs(60)).await;
        assert_eq!(alarm.check(true), AlarmStatus::Triggered);
        assert_eq!(alarm.check(true), AlarmStatus::Active);

        time::advance(Duration::from_secs(3600)).await;
        assert_eq!(
            alarm.check(true),
            AlarmStatus::Active,
            "no reminders unless configured"
        );

        assert_eq!(alarm.check(false), AlarmStatus::Resolved);
        assert_eq!(alarm.check(false), AlarmStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reminders_repeat_at_interval() {
        let mut alarm =
            DebouncedAlarm::new(Duration::from_secs(10)).with_repeat(Duration::from_secs(300));
        alarm.check(true);
        time::advance(Duration::from_secs(10)).await;
        assert_eq!(alarm.check(true), AlarmStatus::Triggered);

        time::advance(Duration::from_secs(299)).await;
        assert_eq!(alarm.check(true), AlarmStatus::Active);

        time::advance(Duration::from_secs(1)).await;
        assert_eq!(alarm.check(true), AlarmStatus::Reminder);
        assert_eq!(alarm.check(true), AlarmStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearms_after_resolution() {
        let mut alarm = DebouncedAlarm::new(Duration::from_secs(10));
        alarm.check(true);
        time::advance(Duration::from_secs(10)).await;
        alarm.check(true);
        alarm.check(false);

        assert_eq!(alarm.check(true), AlarmStatus::Pending);
        time::advance(Duration::from_secs(10)).await;
        assert_eq!(alarm.check(true), AlarmStatus::Triggered);
    }
}
