//! Recurrence engine
//!
//! Computes when a [`ScheduleRule`] is next due. Rules are evaluated in
//! their own timezone, so "09:00 Europe/Berlin" stays at 09:00 local time
//! across daylight-saving changes.
//!
//! Local times that a DST change makes ambiguous resolve to the earlier
//! instant. Local times skipped by a spring-forward gap move to the first
//! valid minute after the gap.

use cadence_api::{Frequency, ScheduleRule};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

pub use cadence_api::DEFAULT_ENUMERATION_CAP;

/// Longest DST gap searched when a local time does not exist
const MAX_GAP_MINUTES: i64 = 180;

/// Enumeration hit its cap before reaching the end of the range
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Recurrence enumeration exceeded {cap} occurrences")]
pub struct RecurrenceOverflow {
    pub cap: usize,
    /// Occurrences produced before the cap was reached
    pub partial: Vec<DateTime<Tz>>,
}

/// The first occurrence of `rule` strictly after `after`.
///
/// For monthly rules the anchor day is `anchor`, else the rule's own
/// anchor, else the day-of-month of `after` in the rule's timezone. Days
/// the month lacks clamp to its last day.
///
/// Returns `None` only when no later date is representable.
pub fn compute_next_occurrence(
    rule: &ScheduleRule,
    after: DateTime<Utc>,
    anchor: Option<u32>,
) -> Option<DateTime<Tz>> {
    let tz = rule.timezone();
    let time = rule.time().to_naive_time();
    let local_after = after.with_timezone(&tz);
    let start = local_after.date_naive();

    let candidate = |date: NaiveDate| {
        at_local_time(tz, date, time).filter(|dt| dt.with_timezone(&Utc) > after)
    };

    match rule.frequency() {
        // Today or tomorrow, a DST shift can't push past that
        Frequency::Daily => start.iter_days().take(3).find_map(candidate),
        // Eight days covers a same-weekday slot that has already passed
        Frequency::Weekly { days } => start
            .iter_days()
            .take(8)
            .filter(|date| days.contains(date.weekday()))
            .find_map(candidate),
        Frequency::Monthly { anchor_day } => {
            let anchor = anchor.or(*anchor_day).unwrap_or_else(|| local_after.day());
            let (mut year, mut month) = (start.year(), start.month());
            for _ in 0..3 {
                let day = anchor.min(days_in_month(year, month)?);
                if let Some(found) = NaiveDate::from_ymd_opt(year, month, day).and_then(&candidate)
                {
                    return Some(found);
                }
                (year, month) = if month == 12 {
                    (year + 1, 1)
                } else {
                    (year, month + 1)
                };
            }
            None
        }
    }
}

/// Resolve a local date and time in `tz`, applying the DST policy
pub fn at_local_time(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
    let naive = date.and_time(time);
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return Some(dt);
    }
    (1..=MAX_GAP_MINUTES).find_map(|minutes| {
        let shifted = naive.checked_add_signed(TimeDelta::minutes(minutes))?;
        tz.from_local_datetime(&shifted).earliest()
    })
}

/// Number of days in a month
pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|last| last.day())
}

/// Lazy, strictly increasing sequence of occurrences.
///
/// Cloning or calling [`Occurrences::restart`] replays the sequence from
/// its start. The iterator stops after `cap` items; [`Occurrences::overflowed`]
/// reports whether more were due within the range.
#[derive(Debug, Clone)]
pub struct Occurrences {
    rule: ScheduleRule,
    anchor: u32,
    start: DateTime<Utc>,
    until: Option<DateTime<Utc>>,
    cap: usize,
    cursor: DateTime<Utc>,
    produced: usize,
    overflowed: bool,
    done: bool,
}

impl Occurrences {
    /// Occurrences in `[from, to]`
    pub fn between(rule: &ScheduleRule, from: DateTime<Utc>, to: DateTime<Utc>, cap: usize) -> Self {
        // Step back one tick so an occurrence exactly at `from` is included
        let start = from - TimeDelta::nanoseconds(1);
        Self::new(rule, from, start, Some(to), cap)
    }

    /// Occurrences strictly after `after`, without an upper bound
    pub fn after(rule: &ScheduleRule, after: DateTime<Utc>, cap: usize) -> Self {
        Self::new(rule, after, after, None, cap)
    }

    fn new(
        rule: &ScheduleRule,
        anchor_from: DateTime<Utc>,
        start: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        cap: usize,
    ) -> Self {
        // Pin the anchor once so it cannot drift with the cursor
        let anchor = rule
            .anchor_day()
            .unwrap_or_else(|| anchor_from.with_timezone(&rule.timezone()).day());
        Self {
            rule: *rule,
            anchor,
            start,
            until,
            cap,
            cursor: start,
            produced: 0,
            overflowed: false,
            done: false,
        }
    }

    /// Rewind to the first occurrence
    pub fn restart(&mut self) {
        self.cursor = self.start;
        self.produced = 0;
        self.overflowed = false;
        self.done = false;
    }

    /// True if the cap stopped the sequence before the range was exhausted
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    fn next_in_range(&self) -> Option<DateTime<Tz>> {
        let next = compute_next_occurrence(&self.rule, self.cursor, Some(self.anchor))?;
        match self.until {
            Some(until) if next.with_timezone(&Utc) > until => None,
            _ => Some(next),
        }
    }
}

impl Iterator for Occurrences {
    type Item = DateTime<Tz>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.produced >= self.cap {
            self.done = true;
            self.overflowed = self.next_in_range().is_some();
            return None;
        }
        match self.next_in_range() {
            Some(next) => {
                self.cursor = next.with_timezone(&Utc);
                self.produced += 1;
                Some(next)
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// All occurrences in `[from, to]`, at most `cap` of them.
///
/// When the range holds more than `cap`, the first `cap` are returned
/// inside the error.
pub fn enumerate_occurrences(
    rule: &ScheduleRule,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    cap: usize,
) -> Result<Vec<DateTime<Tz>>, RecurrenceOverflow> {
    let mut occurrences = Occurrences::between(rule, from, to, cap);
    let partial: Vec<_> = occurrences.by_ref().collect();
    if occurrences.overflowed() {
        Err(RecurrenceOverflow { cap, partial })
    } else {
        Ok(partial)
    }
}

/// The next `count` occurrences after `after`, never more than `cap`
pub fn upcoming(
    rule: &ScheduleRule,
    after: DateTime<Utc>,
    count: usize,
    cap: usize,
) -> Vec<DateTime<Tz>> {
    Occurrences::after(rule, after, cap).take(count).collect()
}
