//! Scheduler: admission, join and cancellation

use cadence_api::{
    Classification, LifecycleAction, OccurrenceState, ScheduleInstance, ScheduleRule,
    ScheduleStatus, SessionContext, SessionEnd, SessionKind, SessionOccurrence, TransitionError,
};
use cadence_config::Settings;
use cadence_store::{
    AuditEvent, AuditEventType, ScheduleStore, SessionContextProvider, StoreError,
};
use cadence_util::{Clock, OccurrenceId, ScheduleId, UserId};
use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    compute_next_occurrence, enumerate_occurrences, upcoming, CoreError, CoreEvent, CoreResult,
    JoinPolicy, OccurrenceTracker, RecurrenceOverflow, DEFAULT_ENUMERATION_CAP,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Result of a successful join
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// This call created the session context and advanced the schedule
    Joined {
        context: SessionContext,
        next_occurrence: SessionOccurrence,
    },
    /// The occurrence was already joined; this is its context
    Attached { context: SessionContext },
}

impl JoinOutcome {
    pub fn context(&self) -> &SessionContext {
        match self {
            JoinOutcome::Joined { context, .. } | JoinOutcome::Attached { context } => context,
        }
    }
}

/// What to cancel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelTarget {
    Schedule(ScheduleId),
    Occurrence(OccurrenceId),
}

/// Result of a successful cancellation
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Schedule(ScheduleInstance),
    InstantSession { occurrence_id: OccurrenceId },
}

/// An ad-hoc session started outside any schedule
#[derive(Debug, Clone, PartialEq)]
pub struct InstantSession {
    pub occurrence: SessionOccurrence,
    pub context: SessionContext,
    pub state: OccurrenceState,
}

/// An occurrence id as the store knows it
enum KnownOccurrence {
    /// A session context exists for it, open or closed
    Session(SessionContext),
    /// A schedule's pending occurrence that nobody has joined
    Pending(ScheduleInstance),
}

/// The scheduler.
///
/// All operations take `&self` and keep no state of their own besides
/// configuration; the store enforces the per-user single schedule and the
/// provider makes joins idempotent, so any number of `Scheduler`s, in one
/// process or several, can share a store.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    contexts: Arc<dyn SessionContextProvider>,
    clock: Arc<dyn Clock>,
    policy: JoinPolicy,
    enumeration_cap: usize,
    events: broadcast::Sender<CoreEvent>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        contexts: Arc<dyn SessionContextProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            contexts,
            clock,
            policy: JoinPolicy::default(),
            enumeration_cap: DEFAULT_ENUMERATION_CAP,
            events,
        }
    }

    pub fn with_policy(mut self, policy: JoinPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_enumeration_cap(mut self, cap: usize) -> Self {
        self.enumeration_cap = cap;
        self
    }

    /// Apply the join window and recurrence settings from config
    pub fn with_settings(self, settings: &Settings) -> Self {
        self.with_policy(JoinPolicy::from_minutes(
            settings.join_window.window_minutes,
            settings.join_window.starting_soon_minutes,
        ))
            .with_enumeration_cap(settings.recurrence.enumeration_cap)
    }

    pub fn policy(&self) -> &JoinPolicy {
        &self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Receive scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Create a recurring schedule for `user_id`.
    ///
    /// A monthly rule without an anchor is pinned to today's day-of-month
    /// in the rule's timezone. Fails with [`CoreError::DuplicateSchedule`]
    /// if the user already has a live schedule.
    pub fn create_schedule(
        &self,
        user_id: UserId,
        rule: ScheduleRule,
    ) -> CoreResult<ScheduleInstance> {
        let now = self.clock.now();
        let today = now.with_timezone(&rule.timezone()).day();
        let rule = rule.pin_anchor(today)?;

        let first = compute_next_occurrence(&rule, now, None).ok_or(CoreError::NoNextOccurrence)?;
        let instance = ScheduleInstance::new(
            user_id,
            rule,
            SessionOccurrence::new(first.with_timezone(&Utc)),
            now,
        );

        match self.store.insert_schedule_if_absent(&instance) {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                warn!(user_id = %instance.user_id, "Rejected second schedule for user");
                self.audit(
                    AuditEventType::DuplicateScheduleRejected {
                        user_id: instance.user_id.clone(),
                    },
                    now,
                );
                return Err(CoreError::DuplicateSchedule {
                    user_id: instance.user_id,
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            schedule_id = %instance.id,
            user_id = %instance.user_id,
            frequency = instance.rule.frequency().name(),
            first_occurrence = %instance.next_occurrence.scheduled_at,
            "Schedule created"
        );
        self.audit(
            AuditEventType::ScheduleCreated {
                schedule_id: instance.id.clone(),
                user_id: instance.user_id.clone(),
                first_occurrence: instance.next_occurrence.scheduled_at,
            },
            now,
        );
        self.emit(CoreEvent::ScheduleCreated {
            schedule_id: instance.id.clone(),
            user_id: instance.user_id.clone(),
            first_occurrence: instance.next_occurrence.scheduled_at,
        });

        Ok(instance)
    }

    /// Start an ad-hoc session right now. It is Active immediately and
    /// never touches recurrence bookkeeping.
    pub fn create_instant_session(&self, user_id: UserId) -> CoreResult<InstantSession> {
        let now = self.clock.now();
        let occurrence = SessionOccurrence::new(now);
        let (context, _) = self.contexts.get_or_create_context(
            &occurrence.id,
            &user_id,
            SessionKind::Instant,
            now,
        )?;

        let session = InstantSession {
            occurrence,
            context,
            state: OccurrenceTracker::instant(now, self.policy).state(now),
        };

        info!(
            occurrence_id = %session.occurrence.id,
            user_id = %user_id,
            "Instant session started"
        );
        self.audit(
            AuditEventType::InstantSessionStarted {
                occurrence_id: session.occurrence.id.clone(),
                user_id: user_id.clone(),
            },
            now,
        );
        self.emit(CoreEvent::InstantSessionStarted {
            occurrence_id: session.occurrence.id.clone(),
            user_id,
        });

        Ok(session)
    }

    /// Join an occurrence.
    ///
    /// Idempotent per occurrence id: while a context is open every caller
    /// attaches to it. Otherwise the join window is checked against the
    /// clock now, never against a state the caller saw earlier.
    pub fn join(&self, occurrence_id: &OccurrenceId) -> CoreResult<JoinOutcome> {
        let now = self.clock.now();
        let known = self.locate(occurrence_id)?;
        let tracker = self.tracker(&known);

        let schedule = match known {
            KnownOccurrence::Session(context) if context.is_open() => {
                debug!(occurrence_id = %occurrence_id, "Attaching to existing session");
                return Ok(JoinOutcome::Attached { context });
            }
            KnownOccurrence::Session(_) => {
                return Err(TransitionError {
                    from: tracker.state(now),
                    action: LifecycleAction::Join,
                }
                .into());
            }
            KnownOccurrence::Pending(schedule) => schedule,
        };

        let occurrence = schedule.next_occurrence.clone();
        let classification = tracker.classification(now);
        if !classification.can_join {
            info!(
                occurrence_id = %occurrence_id,
                state = %classification.state,
                "Join denied"
            );
            self.audit(
                AuditEventType::JoinDenied {
                    occurrence_id: occurrence_id.clone(),
                    state: classification.state,
                },
                now,
            );
            return Err(CoreError::JoinWindowClosed {
                occurrence_id: occurrence_id.clone(),
                state: classification.state,
            });
        }

        let (context, created) = self.contexts.get_or_create_context(
            occurrence_id,
            &schedule.user_id,
            SessionKind::Scheduled,
            now,
        )?;
        if !created {
            return Ok(JoinOutcome::Attached { context });
        }

        let next_at = compute_next_occurrence(&schedule.rule, occurrence.scheduled_at, None)
            .ok_or(CoreError::NoNextOccurrence)?;
        let next = SessionOccurrence::new(next_at.with_timezone(&Utc));

        let next_occurrence = if self.store.advance_occurrence(
            &schedule.id,
            occurrence_id,
            &next,
            ScheduleStatus::Active,
            now,
        )? {
            self.record_advance(&schedule.id, occurrence_id, &next, now);
            next
        } else {
            let current = self
                .store
                .get_schedule(&schedule.id)?
                .ok_or_else(|| CoreError::ScheduleNotFound(schedule.id.clone()))?;
            if current.is_cancelled() {
                // Cancelled between the window check and the advance
                self.contexts
                    .close_context(occurrence_id, SessionEnd::Cancelled, now)?;
                info!(
                    occurrence_id = %occurrence_id,
                    schedule_id = %schedule.id,
                    "Join lost to a concurrent cancel"
                );
                return Err(TransitionError {
                    from: OccurrenceState::Cancelled,
                    action: LifecycleAction::Join,
                }
                .into());
            }
            debug!(schedule_id = %schedule.id, "Schedule already advanced by another writer");
            current.next_occurrence
        };

        info!(
            occurrence_id = %occurrence_id,
            context_id = %context.id,
            user_id = %schedule.user_id,
            next_occurrence = %next_occurrence.scheduled_at,
            "Occurrence joined"
        );
        self.audit(
            AuditEventType::OccurrenceJoined {
                occurrence_id: occurrence_id.clone(),
                context_id: context.id.clone(),
                user_id: schedule.user_id.clone(),
            },
            now,
        );
        self.emit(CoreEvent::OccurrenceJoined {
            occurrence_id: occurrence_id.clone(),
            context_id: context.id.clone(),
            user_id: schedule.user_id,
        });

        Ok(JoinOutcome::Joined {
            context,
            next_occurrence,
        })
    }

    /// Cancel a schedule or a single occurrence.
    ///
    /// Cancelling a scheduled occurrence cancels its whole schedule and is
    /// only allowed before it expires. An occurrence that was already
    /// joined cannot be cancelled; instant sessions always can.
    pub fn cancel(&self, target: CancelTarget) -> CoreResult<CancelOutcome> {
        let now = self.clock.now();

        let schedule = match target {
            CancelTarget::Schedule(id) => {
                let schedule = self
                    .store
                    .get_schedule(&id)?
                    .ok_or(CoreError::ScheduleNotFound(id))?;
                if schedule.is_cancelled() {
                    return Err(TransitionError {
                        from: OccurrenceState::Cancelled,
                        action: LifecycleAction::Cancel,
                    }
                    .into());
                }
                self.roll_forward(schedule, now)?
            }
            CancelTarget::Occurrence(occurrence_id) => {
                let known = self.locate(&occurrence_id)?;
                let mut tracker = self.tracker(&known);
                match known {
                    KnownOccurrence::Session(context)
                        if context.kind == SessionKind::Instant && context.is_open() =>
                    {
                        return self.cancel_instant(&context, now);
                    }
                    KnownOccurrence::Session(_) => {
                        return Err(TransitionError {
                            from: tracker.state(now),
                            action: LifecycleAction::Cancel,
                        }
                        .into());
                    }
                    KnownOccurrence::Pending(schedule) => {
                        tracker.cancel(now)?;
                        schedule
                    }
                }
            }
        };

        if !self.store.cancel_schedule(&schedule.id, now)? {
            return Err(TransitionError {
                from: OccurrenceState::Cancelled,
                action: LifecycleAction::Cancel,
            }
            .into());
        }

        info!(
            schedule_id = %schedule.id,
            user_id = %schedule.user_id,
            "Schedule cancelled"
        );
        self.audit(
            AuditEventType::ScheduleCancelled {
                schedule_id: schedule.id.clone(),
                user_id: schedule.user_id.clone(),
            },
            now,
        );
        self.emit(CoreEvent::ScheduleCancelled {
            schedule_id: schedule.id.clone(),
            user_id: schedule.user_id.clone(),
        });

        Ok(CancelOutcome::Schedule(ScheduleInstance {
            status: ScheduleStatus::Cancelled,
            updated_at: now,
            ..schedule
        }))
    }

    fn cancel_instant(
        &self,
        context: &SessionContext,
        now: DateTime<Utc>,
    ) -> CoreResult<CancelOutcome> {
        let occurrence_id = &context.occurrence_id;
        if !self
            .contexts
            .close_context(occurrence_id, SessionEnd::Cancelled, now)?
        {
            // Closed by someone else since we looked
            let state = self
                .contexts
                .find_context(occurrence_id)?
                .map_or(OccurrenceState::Cancelled, |c| c.occurrence_state());
            return Err(TransitionError {
                from: state,
                action: LifecycleAction::Cancel,
            }
            .into());
        }

        info!(occurrence_id = %occurrence_id, "Instant session cancelled");
        self.audit(
            AuditEventType::InstantSessionCancelled {
                occurrence_id: occurrence_id.clone(),
            },
            now,
        );
        self.emit(CoreEvent::InstantSessionCancelled {
            occurrence_id: occurrence_id.clone(),
        });

        Ok(CancelOutcome::InstantSession {
            occurrence_id: occurrence_id.clone(),
        })
    }

    /// The user's live schedule, with an expired pending occurrence
    /// replaced by the next one
    pub fn current_schedule(&self, user_id: &UserId) -> CoreResult<Option<ScheduleInstance>> {
        let now = self.clock.now();
        match self.store.get_active_schedule(user_id)? {
            Some(schedule) => Ok(Some(self.roll_forward(schedule, now)?)),
            None => Ok(None),
        }
    }

    /// Authoritative classification of an occurrence as of now
    pub fn classify_occurrence(&self, occurrence_id: &OccurrenceId) -> CoreResult<Classification> {
        let now = self.clock.now();
        let known = self.locate(occurrence_id)?;
        Ok(self.tracker(&known).classification(now))
    }

    /// Finish a joined session: store its opaque summary on the schedule,
    /// return the schedule to Scheduled and close the context.
    ///
    /// Returns the schedule the summary was recorded on, if any.
    pub fn complete_session(
        &self,
        occurrence_id: &OccurrenceId,
        summary: serde_json::Value,
    ) -> CoreResult<Option<ScheduleId>> {
        let now = self.clock.now();
        let context = self
            .contexts
            .get_context(occurrence_id)?
            .ok_or_else(|| CoreError::OccurrenceNotFound(occurrence_id.clone()))?;

        let schedule_id = match context.kind {
            SessionKind::Instant => None,
            SessionKind::Scheduled => match self.store.get_active_schedule(&context.user_id)? {
                Some(schedule) if schedule.status == ScheduleStatus::Active => {
                    self.store.record_completion(&schedule.id, &summary, now)?;
                    Some(schedule.id)
                }
                _ => None,
            },
        };

        self.contexts
            .close_context(occurrence_id, SessionEnd::Completed, now)?;

        info!(
            occurrence_id = %occurrence_id,
            schedule_id = ?schedule_id,
            "Session completed"
        );
        self.audit(
            AuditEventType::SessionCompleted {
                occurrence_id: occurrence_id.clone(),
                schedule_id: schedule_id.clone(),
            },
            now,
        );
        self.emit(CoreEvent::SessionCompleted {
            occurrence_id: occurrence_id.clone(),
            schedule_id: schedule_id.clone(),
        });

        Ok(schedule_id)
    }

    /// The schedule's pending occurrence followed by the ones after it,
    /// `count` in total
    pub fn upcoming_occurrences(
        &self,
        schedule_id: &ScheduleId,
        count: usize,
    ) -> CoreResult<Vec<DateTime<Tz>>> {
        let schedule = self.live_schedule(schedule_id)?;
        let tz = schedule.rule.timezone();
        let pending = schedule.next_occurrence.scheduled_at;

        let wanted = count.min(self.enumeration_cap);

        let mut occurrences = vec![pending.with_timezone(&tz)];
        occurrences.extend(upcoming(
            &schedule.rule,
            pending,
            wanted.saturating_sub(1),
            self.enumeration_cap,
        ));
        occurrences.truncate(wanted);

        if count > wanted {
            return Err(RecurrenceOverflow {
                cap: self.enumeration_cap,
                partial: occurrences,
            }
            .into());
        }
        Ok(occurrences)
    }

    /// Occurrences of a schedule in `[from, to]`, bounded by the
    /// enumeration cap
    pub fn occurrences_between(
        &self,
        schedule_id: &ScheduleId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<DateTime<Tz>>> {
        let schedule = self
            .store
            .get_schedule(schedule_id)?
            .ok_or_else(|| CoreError::ScheduleNotFound(schedule_id.clone()))?;
        Ok(enumerate_occurrences(
            &schedule.rule,
            from,
            to,
            self.enumeration_cap,
        )?)
    }

    /// Roll every expired pending occurrence forward. Returns how many
    /// schedules moved.
    pub fn sweep(&self) -> CoreResult<usize> {
        let now = self.clock.now();
        let mut advanced = 0;
        for schedule in self.store.list_active_schedules()? {
            let before = schedule.next_occurrence.id.clone();
            let after = self.roll_forward(schedule, now)?;
            if after.next_occurrence.id != before {
                advanced += 1;
            }
        }
        if advanced > 0 {
            info!(advanced, "Sweep rolled expired occurrences forward");
        }
        Ok(advanced)
    }

    fn locate(&self, occurrence_id: &OccurrenceId) -> CoreResult<KnownOccurrence> {
        if let Some(context) = self.contexts.find_context(occurrence_id)? {
            return Ok(KnownOccurrence::Session(context));
        }
        if let Some(schedule) = self.store.find_by_occurrence(occurrence_id)? {
            return Ok(KnownOccurrence::Pending(schedule));
        }
        // Another caller may have joined and advanced in between
        match self.contexts.find_context(occurrence_id)? {
            Some(context) => Ok(KnownOccurrence::Session(context)),
            None => Err(CoreError::OccurrenceNotFound(occurrence_id.clone())),
        }
    }

    fn tracker(&self, known: &KnownOccurrence) -> OccurrenceTracker {
        match known {
            KnownOccurrence::Session(context) => OccurrenceTracker::settled(
                context.created_at,
                context.occurrence_state(),
                self.policy,
            ),
            KnownOccurrence::Pending(schedule) => {
                OccurrenceTracker::new(schedule.next_occurrence.scheduled_at, self.policy)
            }
        }
    }

    fn live_schedule(&self, schedule_id: &ScheduleId) -> CoreResult<ScheduleInstance> {
        let now = self.clock.now();
        let schedule = self
            .store
            .get_schedule(schedule_id)?
            .filter(|s| !s.is_cancelled())
            .ok_or_else(|| CoreError::ScheduleNotFound(schedule_id.clone()))?;
        self.roll_forward(schedule, now)
    }

    /// Replace an expired pending occurrence with the first one whose
    /// window is still open or yet to come
    fn roll_forward(
        &self,
        schedule: ScheduleInstance,
        now: DateTime<Utc>,
    ) -> CoreResult<ScheduleInstance> {
        let expired = schedule.next_occurrence.clone();
        if self.policy.classify(expired.scheduled_at, now).state != OccurrenceState::Expired {
            return Ok(schedule);
        }

        let next_at = compute_next_occurrence(&schedule.rule, now - self.policy.window, None)
            .ok_or(CoreError::NoNextOccurrence)?;
        let next = SessionOccurrence::new(next_at.with_timezone(&Utc));

        if !self.store.advance_occurrence(
            &schedule.id,
            &expired.id,
            &next,
            schedule.status,
            now,
        )? {
            debug!(schedule_id = %schedule.id, "Expired occurrence already rolled forward");
            return self
                .store
                .get_schedule(&schedule.id)?
                .ok_or(CoreError::ScheduleNotFound(schedule.id));
        }

        info!(
            schedule_id = %schedule.id,
            occurrence_id = %expired.id,
            scheduled_at = %expired.scheduled_at,
            "Occurrence expired unjoined"
        );
        self.audit(
            AuditEventType::OccurrenceExpired {
                schedule_id: schedule.id.clone(),
                occurrence_id: expired.id.clone(),
            },
            now,
        );
        self.emit(CoreEvent::OccurrenceExpired {
            schedule_id: schedule.id.clone(),
            occurrence_id: expired.id.clone(),
        });
        self.record_advance(&schedule.id, &expired.id, &next, now);

        Ok(ScheduleInstance {
            next_occurrence: next,
            updated_at: now,
            ..schedule
        })
    }

    fn record_advance(
        &self,
        schedule_id: &ScheduleId,
        from: &OccurrenceId,
        next: &SessionOccurrence,
        now: DateTime<Utc>,
    ) {
        debug!(
            schedule_id = %schedule_id,
            from = %from,
            to = %next.id,
            scheduled_at = %next.scheduled_at,
            "Occurrence advanced"
        );
        self.audit(
            AuditEventType::OccurrenceAdvanced {
                schedule_id: schedule_id.clone(),
                from: from.clone(),
                to: next.id.clone(),
                scheduled_at: next.scheduled_at,
            },
            now,
        );
        self.emit(CoreEvent::OccurrenceAdvanced {
            schedule_id: schedule_id.clone(),
            next_occurrence: next.id.clone(),
            scheduled_at: next.scheduled_at,
        });
    }

    fn audit(&self, event: AuditEventType, now: DateTime<Utc>) {
        if let Err(e) = self.store.append_audit(AuditEvent::new(event, now)) {
            warn!(error = %e, "Failed to append audit event");
        }
    }

    fn emit(&self, event: CoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
