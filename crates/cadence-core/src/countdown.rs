//! Per-occurrence countdown task
//!
//! A [`Countdown`] re-classifies one occurrence on every tick and publishes
//! the result on a watch channel. The task ends on its own once the
//! occurrence reaches a terminal state, and is aborted when the handle is
//! dropped.

use cadence_api::Classification;
use cadence_util::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::JoinPolicy;

/// Default refresh interval
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Handle to a running countdown
pub struct Countdown {
    rx: watch::Receiver<Classification>,
    handle: JoinHandle<()>,
}

impl Countdown {
    /// Start counting down to `scheduled_at`. Must be called from within a
    /// tokio runtime.
    pub fn spawn(
        scheduled_at: DateTime<Utc>,
        policy: JoinPolicy,
        clock: Arc<dyn Clock>,
        tick: Duration,
    ) -> Self {
        let initial = policy.classify(scheduled_at, clock.now());
        let (tx, rx) = watch::channel(initial);

        let handle = tokio::spawn(async move {
            if initial.state.is_terminal() {
                return;
            }

            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let classification = policy.classify(scheduled_at, clock.now());
                if tx.send(classification).is_err() {
                    break;
                }
                if classification.state.is_terminal() {
                    debug!(
                        scheduled_at = %scheduled_at,
                        state = %classification.state,
                        "Countdown finished"
                    );
                    break;
                }
            }
        });

        Self { rx, handle }
    }

    /// Latest classification
    pub fn current(&self) -> Classification {
        *self.rx.borrow()
    }

    /// Independent receiver for the same countdown
    pub fn subscribe(&self) -> watch::Receiver<Classification> {
        self.rx.clone()
    }

    /// Wait for the next update. Returns `None` once the countdown has
    /// finished and every update has been seen.
    pub async fn changed(&mut self) -> Option<Classification> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_api::OccurrenceState;
    use cadence_util::ManualClock;
    use chrono::{TimeDelta, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 8, 55, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn follows_the_clock_to_expiry() {
        let clock = Arc::new(ManualClock::new(start()));
        let scheduled_at = start() + TimeDelta::minutes(5);
        let mut countdown =
            Countdown::spawn(scheduled_at, JoinPolicy::default(), clock.clone(), DEFAULT_TICK);

        assert_eq!(countdown.current().state, OccurrenceState::StartingSoon);

        clock.advance(TimeDelta::minutes(5));
        let ready = countdown.changed().await.unwrap();
        assert_eq!(ready.state, OccurrenceState::Ready);
        assert!(ready.can_join);

        clock.advance(TimeDelta::minutes(60));
        let expired = countdown.changed().await.unwrap();
        assert_eq!(expired.state, OccurrenceState::Expired);

        // Terminal state ends the task
        assert!(countdown.changed().await.is_none());
        for _ in 0..10 {
            if countdown.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(countdown.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn time_remaining_ticks_down() {
        let clock = Arc::new(ManualClock::new(start()));
        let scheduled_at = start() + TimeDelta::minutes(30);
        let mut countdown =
            Countdown::spawn(scheduled_at, JoinPolicy::default(), clock.clone(), DEFAULT_TICK);

        let before = countdown.current().time_remaining;
        clock.advance(TimeDelta::seconds(1));
        let after = countdown.changed().await.unwrap().time_remaining;
        assert_eq!(before - after, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn already_expired_finishes_immediately() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut countdown = Countdown::spawn(
            start() - TimeDelta::hours(3),
            JoinPolicy::default(),
            clock,
            DEFAULT_TICK,
        );
        assert_eq!(countdown.current().state, OccurrenceState::Expired);
        assert!(countdown.changed().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_aborts_the_task() {
        let clock = Arc::new(ManualClock::new(start()));
        let countdown = Countdown::spawn(
            start() + TimeDelta::days(1),
            JoinPolicy::default(),
            clock,
            DEFAULT_TICK,
        );
        let mut rx = countdown.subscribe();
        drop(countdown);

        // Sender goes away with the aborted task
        while rx.changed().await.is_ok() {}
        assert_eq!(rx.borrow().state, OccurrenceState::Upcoming);
    }
}
