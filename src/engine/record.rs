use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Longest continuous focused span credited from a single anchor. Defends against
/// clock jumps, not a business limit.
pub const MAX_FOCUS_SPAN: Duration = Duration::hours(8);

/// Upper bound on the total duration a single record will report.
pub const MAX_TOTAL_DURATION: Duration = Duration::hours(16);

/// Focus deltas beyond this are assumed to come from a suspended clock and are
/// dropped instead of credited.
const MAX_CREDIBLE_DELTA: Duration = Duration::days(1);

/// Caps applied when reporting a record's duration. Defaults to the module
/// constants; callers that need a different policy can carry their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualLimits {
    pub max_focus_span: Duration,
    pub max_total: Duration,
}

impl Default for AccrualLimits {
    fn default() -> Self {
        Self {
            max_focus_span: MAX_FOCUS_SPAN,
            max_total: MAX_TOTAL_DURATION,
        }
    }
}

/// One application's tracked focus time within a single day.
///
/// While the record is focused its duration keeps growing from `focus_anchor`
/// without any mutation. Accumulation only happens on transitions, which keeps the
/// per-second tick free of writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub process_identity: Arc<str>,
    pub display_title: String,
    pub date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    accumulated: Duration,
    is_focused: bool,
    focus_anchor: DateTime<Utc>,
    pub source_id: Option<i64>,
}

impl UsageRecord {
    /// A record for a window that just gained focus.
    pub fn started(
        process_identity: Arc<str>,
        display_title: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            process_identity,
            display_title: display_title.into(),
            date: now.date_naive(),
            start_time: now,
            end_time: None,
            accumulated: Duration::zero(),
            is_focused: true,
            focus_anchor: now,
            source_id: None,
        }
    }

    /// Rebuilds a record from its persisted parts. The result is not focused, live
    /// accrual belongs to the tracking session alone.
    pub fn restored(
        process_identity: Arc<str>,
        display_title: impl Into<String>,
        date: NaiveDate,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        accumulated: Duration,
        source_id: Option<i64>,
    ) -> Self {
        Self {
            process_identity,
            display_title: display_title.into(),
            date,
            start_time,
            end_time,
            accumulated: accumulated.max(Duration::zero()),
            is_focused: false,
            focus_anchor: start_time,
            source_id,
        }
    }

    pub fn is_focused(&self) -> bool {
        self.is_focused
    }

    pub fn accumulated(&self) -> Duration {
        self.accumulated
    }

    /// Reported duration at `now` with the default caps applied.
    pub fn duration_at(&self, now: DateTime<Utc>) -> Duration {
        self.duration_limited(now, &AccrualLimits::default())
    }

    /// Reported duration at `now`: the accumulated time plus, while focused, the
    /// live span since the anchor. The live span and the total are capped
    /// separately.
    pub fn duration_limited(&self, now: DateTime<Utc>, limits: &AccrualLimits) -> Duration {
        let mut total = self.accumulated;
        if self.is_focused {
            let live = now - self.focus_anchor;
            if live > Duration::zero() {
                total = total + live.min(limits.max_focus_span);
            }
        }
        total.min(limits.max_total)
    }

    /// Applies a focus transition. Losing focus credits the span since the anchor,
    /// unless the span is non-positive or longer than a day, which only happens
    /// when the host clock jumped. Repeated calls with the same state do nothing.
    pub fn set_focus(&mut self, focused: bool, now: DateTime<Utc>) {
        if focused == self.is_focused {
            return;
        }
        if focused {
            self.focus_anchor = now;
            self.end_time = None;
        } else {
            let delta = now - self.focus_anchor;
            if delta > Duration::zero() && delta < MAX_CREDIBLE_DELTA {
                self.accumulated = self.accumulated + delta;
            }
            self.end_time = Some(now);
        }
        self.is_focused = focused;
    }

    /// Re-bases the anchor without crediting anything. Called when the system was
    /// idle or asleep, so that the skipped span is never counted as focus time.
    pub fn set_idle_anchor(&mut self, at: DateTime<Utc>) {
        self.focus_anchor = at;
    }

    /// Absorbs another observation of the same application into this record.
    /// `other` is treated as the more recent one: its non-empty title and an
    /// active focus state replace this record's.
    pub fn merge_with(&mut self, other: &UsageRecord, now: DateTime<Utc>) {
        let other_elapsed = other.duration_at(now);
        if other_elapsed > Duration::zero() {
            self.accumulated = self.accumulated + other_elapsed;
        }
        if other.start_time < self.start_time {
            self.start_time = other.start_time;
        }
        match (self.end_time, other.end_time) {
            (Some(current), Some(new)) if new > current => self.end_time = Some(new),
            (None, Some(new)) if !self.is_focused => self.end_time = Some(new),
            _ => {}
        }
        if !other.display_title.is_empty() {
            self.display_title = other.display_title.clone();
        }
        if other.is_focused {
            self.is_focused = true;
            self.focus_anchor = now;
            self.end_time = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

    use super::{AccrualLimits, UsageRecord};

    const TEST_START_DATE: NaiveDateTime = NaiveDateTime::new(
        NaiveDate::from_ymd_opt(2024, 4, 29).unwrap(),
        NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
    );

    fn start_moment() -> DateTime<Utc> {
        Utc.from_utc_datetime(&TEST_START_DATE)
    }

    fn focused_record() -> UsageRecord {
        UsageRecord::started("editor".into(), "main.rs - editor", start_moment())
    }

    #[test]
    fn duration_grows_while_focused() {
        let record = focused_record();
        let mut previous = Duration::zero();
        for minutes in [0, 1, 5, 30, 120] {
            let duration = record.duration_at(start_moment() + Duration::minutes(minutes));
            assert!(duration >= previous);
            previous = duration;
        }
        assert_eq!(previous, Duration::minutes(120));
    }

    #[test]
    fn losing_focus_credits_exact_delta() {
        let mut record = focused_record();
        record.set_focus(false, start_moment() + Duration::seconds(731));
        assert_eq!(record.accumulated(), Duration::seconds(731));
        assert_eq!(
            record.end_time,
            Some(start_moment() + Duration::seconds(731))
        );
        // unfocused records do not keep growing
        assert_eq!(
            record.duration_at(start_moment() + Duration::hours(3)),
            Duration::seconds(731)
        );
    }

    #[test]
    fn redundant_transition_is_a_no_op() {
        let mut record = focused_record();
        record.set_focus(true, start_moment() + Duration::minutes(10));
        assert_eq!(
            record.duration_at(start_moment() + Duration::minutes(20)),
            Duration::minutes(20)
        );
    }

    #[test]
    fn negative_delta_is_not_credited() {
        let mut record = focused_record();
        // clock went backwards between anchor and transition
        record.set_focus(false, start_moment() - Duration::minutes(5));
        assert_eq!(record.accumulated(), Duration::zero());
    }

    #[test]
    fn day_long_delta_is_not_credited() {
        let mut record = focused_record();
        record.set_focus(false, start_moment() + Duration::days(2));
        assert_eq!(record.accumulated(), Duration::zero());
    }

    #[test]
    fn idle_anchor_discards_live_delta() {
        let mut record = focused_record();
        record.set_focus(false, start_moment() + Duration::minutes(10));
        record.set_focus(true, start_moment() + Duration::minutes(10));
        let resumed = start_moment() + Duration::hours(4);
        record.set_idle_anchor(resumed);
        assert_eq!(record.duration_at(resumed), record.accumulated());
        assert_eq!(record.accumulated(), Duration::minutes(10));
    }

    #[test]
    fn live_span_is_capped_at_eight_hours() {
        let record = focused_record();
        assert_eq!(
            record.duration_at(start_moment() + Duration::hours(11)),
            Duration::hours(8)
        );
    }

    #[test]
    fn total_is_capped_at_sixteen_hours() {
        let mut record = UsageRecord::restored(
            "editor".into(),
            "editor",
            TEST_START_DATE.date(),
            start_moment(),
            None,
            Duration::hours(13),
            None,
        );
        record.set_focus(true, start_moment());
        assert_eq!(
            record.duration_at(start_moment() + Duration::hours(7)),
            Duration::hours(16)
        );
    }

    #[test]
    fn custom_limits_override_the_defaults() {
        let record = focused_record();
        let limits = AccrualLimits {
            max_focus_span: Duration::minutes(30),
            max_total: Duration::hours(1),
        };
        assert_eq!(
            record.duration_limited(start_moment() + Duration::hours(2), &limits),
            Duration::minutes(30)
        );
    }

    #[test]
    fn merge_sums_durations_and_keeps_earliest_start() {
        let now = start_moment() + Duration::minutes(30);
        let mut first = UsageRecord::restored(
            "chrome".into(),
            "",
            TEST_START_DATE.date(),
            start_moment() + Duration::minutes(10),
            Some(start_moment() + Duration::minutes(15)),
            Duration::seconds(300),
            Some(1),
        );
        let second = UsageRecord::restored(
            "chrome".into(),
            "Inbox - Chrome",
            TEST_START_DATE.date(),
            start_moment(),
            Some(start_moment() + Duration::minutes(20)),
            Duration::seconds(450),
            Some(2),
        );
        first.merge_with(&second, now);
        assert_eq!(first.accumulated(), Duration::seconds(750));
        assert_eq!(first.start_time, start_moment());
        assert_eq!(first.end_time, Some(start_moment() + Duration::minutes(20)));
        assert_eq!(first.display_title, "Inbox - Chrome");
    }

    #[test]
    fn merging_a_live_record_adopts_its_focus() {
        let now = start_moment() + Duration::minutes(15);
        let mut persisted = UsageRecord::restored(
            "editor".into(),
            "editor",
            TEST_START_DATE.date(),
            start_moment(),
            Some(start_moment() + Duration::minutes(10)),
            Duration::seconds(600),
            Some(1),
        );
        let live = UsageRecord::started(
            "editor".into(),
            "main.rs - editor",
            start_moment() + Duration::minutes(10),
        );
        persisted.merge_with(&live, now);
        assert!(persisted.is_focused());
        assert_eq!(persisted.end_time, None);
        assert_eq!(persisted.duration_at(now), Duration::seconds(900));
    }
}
