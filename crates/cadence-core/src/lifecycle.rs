//! Occurrence lifecycle
//!
//! Time moves an occurrence through `Upcoming -> StartingSoon -> Ready ->
//! Expired`. Joining (from Ready) and cancelling (before Expired) are the
//! only explicit transitions.

use cadence_api::{
    Classification, OccurrenceState, TransitionError, DEFAULT_STARTING_SOON_MINUTES,
    DEFAULT_WINDOW_MINUTES,
};
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// How long an occurrence stays joinable and how early it starts
/// counting down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPolicy {
    /// Joinable for this long after the scheduled start
    pub window: TimeDelta,
    /// StartingSoon for this long before the scheduled start
    pub starting_soon: TimeDelta,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self::from_minutes(DEFAULT_WINDOW_MINUTES, DEFAULT_STARTING_SOON_MINUTES)
    }
}

impl JoinPolicy {
    pub fn from_minutes(window: u32, starting_soon: u32) -> Self {
        Self {
            window: TimeDelta::minutes(i64::from(window)),
            starting_soon: TimeDelta::minutes(i64::from(starting_soon)),
        }
    }

    /// Classify an occurrence scheduled at `scheduled_at` as seen at `now`
    pub fn classify(&self, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Classification {
        let since_start = now - scheduled_at;

        if since_start >= self.window {
            return Classification {
                state: OccurrenceState::Expired,
                time_remaining: Duration::ZERO,
                can_join: false,
            };
        }

        if since_start >= TimeDelta::zero() {
            return Classification {
                state: OccurrenceState::Ready,
                time_remaining: to_std(self.window - since_start),
                can_join: true,
            };
        }

        let until_start = -since_start;
        let state = if until_start <= self.starting_soon {
            OccurrenceState::StartingSoon
        } else {
            OccurrenceState::Upcoming
        };
        Classification {
            state,
            time_remaining: to_std(until_start),
            can_join: false,
        }
    }
}

/// Classify against the default 60 minute window and 10 minute lead
pub fn classify(scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Classification {
    JoinPolicy::default().classify(scheduled_at, now)
}

fn to_std(delta: TimeDelta) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

/// A single occurrence with its explicit transitions applied.
///
/// Until joined or cancelled the state follows the clock; afterwards it
/// stays at the terminal state it reached.
#[derive(Debug, Clone)]
pub struct OccurrenceTracker {
    scheduled_at: DateTime<Utc>,
    terminal: Option<OccurrenceState>,
    policy: JoinPolicy,
}

impl OccurrenceTracker {
    pub fn new(scheduled_at: DateTime<Utc>, policy: JoinPolicy) -> Self {
        Self {
            scheduled_at,
            terminal: None,
            policy,
        }
    }

    /// An occurrence that already reached `state`
    pub fn settled(
        scheduled_at: DateTime<Utc>,
        state: OccurrenceState,
        policy: JoinPolicy,
    ) -> Self {
        Self {
            scheduled_at,
            terminal: Some(state),
            policy,
        }
    }

    /// An instant session: starts now and is already Active
    pub fn instant(now: DateTime<Utc>, policy: JoinPolicy) -> Self {
        Self::settled(now, OccurrenceState::Active, policy)
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    pub fn state(&self, now: DateTime<Utc>) -> OccurrenceState {
        self.classification(now).state
    }

    /// Time-driven classification, or the terminal state with nothing left
    /// to wait for
    pub fn classification(&self, now: DateTime<Utc>) -> Classification {
        match self.terminal {
            Some(state) => Classification {
                state,
                time_remaining: Duration::ZERO,
                can_join: false,
            },
            None => self.policy.classify(self.scheduled_at, now),
        }
    }

    pub fn join(&mut self, now: DateTime<Utc>) -> Result<OccurrenceState, TransitionError> {
        let next = self.state(now).join()?;
        self.terminal = Some(next);
        Ok(next)
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<OccurrenceState, TransitionError> {
        let next = self.state(now).cancel()?;
        self.terminal = Some(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_api::LifecycleAction;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
    }

    fn mins(m: i64) -> TimeDelta {
        TimeDelta::minutes(m)
    }

    #[test]
    fn upcoming_half_hour_out() {
        let c = classify(now() + mins(30), now());
        assert_eq!(c.state, OccurrenceState::Upcoming);
        assert_eq!(c.time_remaining, Duration::from_secs(30 * 60));
        assert!(!c.can_join);
    }

    #[test]
    fn ready_half_hour_in() {
        let c = classify(now() - mins(30), now());
        assert_eq!(c.state, OccurrenceState::Ready);
        assert_eq!(c.time_remaining, Duration::from_secs(30 * 60));
        assert!(c.can_join);
    }

    #[test]
    fn expired_after_window() {
        let c = classify(now() - mins(90), now());
        assert_eq!(c.state, OccurrenceState::Expired);
        assert_eq!(c.time_remaining, Duration::ZERO);
        assert!(!c.can_join);

        let c = classify(now() - TimeDelta::days(2), now());
        assert_eq!(c.state, OccurrenceState::Expired);
    }

    #[test]
    fn starting_soon_within_lead() {
        let c = classify(now() + mins(5), now());
        assert_eq!(c.state, OccurrenceState::StartingSoon);
        assert_eq!(c.time_remaining, Duration::from_secs(5 * 60));
        assert!(!c.can_join);
    }

    #[test]
    fn upcoming_far_out() {
        let c = classify(now() + TimeDelta::days(2), now());
        assert_eq!(c.state, OccurrenceState::Upcoming);
        assert_eq!(c.time_remaining, Duration::from_secs(2 * 24 * 3600));
    }

    #[test]
    fn boundaries() {
        // Exactly at start: Ready with the full window left
        let c = classify(now(), now());
        assert_eq!(c.state, OccurrenceState::Ready);
        assert_eq!(c.time_remaining, Duration::from_secs(3600));

        // Exactly one window later: Expired
        assert_eq!(classify(now() - mins(60), now()).state, OccurrenceState::Expired);

        // Exactly at the lead: StartingSoon, one second before: Upcoming
        assert_eq!(
            classify(now() + mins(10), now()).state,
            OccurrenceState::StartingSoon
        );
        assert_eq!(
            classify(now() + mins(10) + TimeDelta::seconds(1), now()).state,
            OccurrenceState::Upcoming
        );
    }

    #[test]
    fn configured_policy() {
        let policy = JoinPolicy::from_minutes(15, 2);
        assert_eq!(
            policy.classify(now() - mins(20), now()).state,
            OccurrenceState::Expired
        );
        assert_eq!(
            policy.classify(now() + mins(5), now()).state,
            OccurrenceState::Upcoming
        );
    }

    #[test]
    fn tracker_follows_time_until_joined() {
        let start = now();
        let mut tracker = OccurrenceTracker::new(start, JoinPolicy::default());

        assert_eq!(tracker.state(start - mins(20)), OccurrenceState::Upcoming);
        assert_eq!(
            tracker.join(start - mins(5)),
            Err(TransitionError {
                from: OccurrenceState::StartingSoon,
                action: LifecycleAction::Join
            })
        );

        assert_eq!(tracker.join(start + mins(1)), Ok(OccurrenceState::Active));
        // Active sticks even after the window
        assert_eq!(tracker.state(start + mins(600)), OccurrenceState::Active);
        assert!(tracker.cancel(start + mins(2)).is_err());
    }

    #[test]
    fn tracker_cancel() {
        let start = now();
        let mut tracker = OccurrenceTracker::new(start, JoinPolicy::default());
        assert_eq!(tracker.cancel(start - mins(3)), Ok(OccurrenceState::Cancelled));
        assert_eq!(tracker.state(start), OccurrenceState::Cancelled);

        let mut late = OccurrenceTracker::new(start, JoinPolicy::default());
        assert!(late.cancel(start + mins(61)).is_err());
    }

    #[test]
    fn settled_tracker_ignores_the_clock() {
        let tracker =
            OccurrenceTracker::settled(now(), OccurrenceState::Cancelled, JoinPolicy::default());
        let c = tracker.classification(now() + mins(5));
        assert_eq!(c.state, OccurrenceState::Cancelled);
        assert_eq!(c.time_remaining, Duration::ZERO);
        assert!(!c.can_join);

        let mut tracker = tracker;
        assert_eq!(
            tracker.join(now() + mins(5)),
            Err(TransitionError {
                from: OccurrenceState::Cancelled,
                action: LifecycleAction::Join
            })
        );
    }

    #[test]
    fn instant_sessions_start_active() {
        let tracker = OccurrenceTracker::instant(now(), JoinPolicy::default());
        assert_eq!(tracker.state(now()), OccurrenceState::Active);
        assert_eq!(tracker.scheduled_at(), now());
    }
}
