//! The reconciliation and aggregation engine. Combines persisted history with the
//! live tracking session into de-duplicated per-application views without double
//! counting, and computes true wall-clock active time.

pub mod identity;
pub mod intervals;
pub mod record;
pub mod rules;

use std::{
    cmp::Reverse,
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
};

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::warn;

use crate::{
    store::UsageStore,
    tracker::TrackingSession,
    utils::{clock::Clock, time::dates_inclusive},
};

use self::{
    identity::IdentityResolver,
    intervals::merged_active_time,
    record::{AccrualLimits, UsageRecord},
    rules::NoiseTier,
};

/// Most entries the lenient fallback will return.
pub const DEFAULT_FALLBACK_LIMIT: usize = 5;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub accrual: AccrualLimits,
    pub fallback_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            accrual: AccrualLimits::default(),
            fallback_limit: DEFAULT_FALLBACK_LIMIT,
        }
    }
}

/// One application's total over a queried range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppUsage {
    pub process_identity: Arc<str>,
    pub display_title: String,
    pub duration: Duration,
}

/// Whether noise filtering ran strictly or had to relax to avoid an empty result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Strict,
    Lenient,
}

#[derive(Debug, Clone)]
pub struct RangeSummary {
    pub entries: Vec<AppUsage>,
    pub filter: FilterOutcome,
}

/// The engine itself. Holds no mutable state; every operation is a transformation
/// over whatever the store and the live session return at call time.
pub struct AggregationEngine<S> {
    store: S,
    resolver: Arc<IdentityResolver>,
    clock: Box<dyn Clock>,
    session: Option<Arc<dyn TrackingSession>>,
    config: EngineConfig,
}

impl<S: UsageStore> AggregationEngine<S> {
    pub fn new(
        store: S,
        resolver: Arc<IdentityResolver>,
        clock: Box<dyn Clock>,
        session: Option<Arc<dyn TrackingSession>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            clock,
            session,
            config,
        }
    }

    /// Per-application records for one day, persisted rows reconciled with the
    /// live session when the day is today. Persisted rows are folded first so the
    /// live record's more current title and focus state win ties.
    pub async fn detail_view_for_date(&self, date: NaiveDate) -> Result<Vec<UsageRecord>> {
        let now = self.clock.time();
        let today = now.date_naive();
        // a future date means the host clock is misconfigured somewhere
        let date = date.min(today);

        let mut sources = Vec::new();
        if self.store.is_initialized() {
            match self.store.records_for_date(date).await {
                Ok(rows) => sources.extend(rows),
                Err(e) => {
                    warn!("Store read for {date} failed, continuing with live data: {e:?}")
                }
            }
        } else {
            warn!("Store is not initialized, serving live data only");
        }
        if date == today {
            if let Some(session) = &self.session {
                sources.extend(session.live_records());
            }
        }

        let mut folded = self.fold_by_identity(sources, now);
        folded.retain(|record| !self.resolver.is_noise(&record.process_identity));
        self.sort_records(&mut folded, now);
        Ok(folded)
    }

    /// One roll-up entry per application over an inclusive date range. When strict
    /// noise filtering would return nothing at all, the contextual noise tier is
    /// readmitted and the result capped, so a shell-only session still gets an
    /// answer; the outcome marks which path was taken.
    pub async fn aggregated_view_for_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        include_live: bool,
    ) -> Result<RangeSummary> {
        let now = self.clock.time();
        let today = now.date_naive();
        let (start, end) = normalize_range(start, end, today);

        let mut totals = HashMap::<Arc<str>, AppUsage>::new();
        if self.store.is_initialized() {
            match self.store.usage_report_for_range(start, end).await {
                Ok(report) => {
                    for (identity, duration) in report {
                        let identity = self.resolver.normalize(&identity);
                        let entry = totals.entry(identity.clone()).or_insert_with(|| AppUsage {
                            process_identity: identity,
                            display_title: String::new(),
                            duration: Duration::zero(),
                        });
                        entry.duration = entry.duration + duration;
                    }
                }
                Err(e) => warn!("Usage report for {start}..{end} failed: {e:?}"),
            }
        } else {
            warn!("Store is not initialized, serving live data only");
        }

        if include_live && end == today {
            if let Some(session) = &self.session {
                for record in session.live_records() {
                    let identity = self.resolver.normalize(&record.process_identity);
                    let duration = record.duration_limited(now, &self.config.accrual);
                    let entry = totals.entry(identity.clone()).or_insert_with(|| AppUsage {
                        process_identity: identity,
                        display_title: String::new(),
                        duration: Duration::zero(),
                    });
                    entry.duration = entry.duration + duration;
                    if entry.display_title.is_empty() && !record.display_title.is_empty() {
                        entry.display_title = record.display_title.clone();
                    }
                }
            }
        }

        let every_app = totals.into_values().collect::<Vec<_>>();
        let mut strict = every_app
            .iter()
            .filter(|usage| !self.resolver.is_noise(&usage.process_identity))
            .cloned()
            .collect::<Vec<_>>();

        if strict.is_empty() && !every_app.is_empty() {
            let mut lenient = every_app
                .into_iter()
                .filter(|usage| {
                    self.resolver.noise_tier(&usage.process_identity) != Some(NoiseTier::Core)
                })
                .collect::<Vec<_>>();
            sort_usages(&mut lenient);
            lenient.truncate(self.config.fallback_limit);
            return Ok(RangeSummary {
                entries: lenient,
                filter: FilterOutcome::Lenient,
            });
        }

        sort_usages(&mut strict);
        Ok(RangeSummary {
            entries: strict,
            filter: FilterOutcome::Strict,
        })
    }

    /// Like the detail view but spanning every day of the range. Entries are not
    /// folded across days, callers that want one entry per application use
    /// [Self::aggregated_view_for_range].
    pub async fn detail_records_for_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<UsageRecord>> {
        let today = self.clock.today();
        let (start, end) = normalize_range(start, end, today);

        let mut records = Vec::new();
        for date in dates_inclusive(start, end) {
            records.extend(self.detail_view_for_date(date).await?);
        }
        Ok(records)
    }

    /// True wall-clock time spent at the computer: per-record spans are interval
    /// merged, so genuinely overlapping records are only counted once. Distinct
    /// from the sum of per-application durations.
    pub fn total_active_time(&self, records: &[UsageRecord]) -> Duration {
        let now = self.clock.time();
        let spans = records
            .iter()
            .map(|record| {
                let duration = record.duration_limited(now, &self.config.accrual);
                (record.start_time, record.start_time + duration)
            })
            .collect();
        merged_active_time(spans)
    }

    fn fold_by_identity(
        &self,
        records: Vec<UsageRecord>,
        now: DateTime<Utc>,
    ) -> Vec<UsageRecord> {
        let mut map = HashMap::<Arc<str>, UsageRecord>::new();
        for record in records {
            let identity = self.resolver.normalize(&record.process_identity);
            match map.entry(identity.clone()) {
                Entry::Occupied(mut existing) => existing.get_mut().merge_with(&record, now),
                Entry::Vacant(slot) => {
                    let mut record = record;
                    record.process_identity = identity;
                    slot.insert(record);
                }
            }
        }
        map.into_values().collect()
    }

    fn sort_records(&self, records: &mut [UsageRecord], now: DateTime<Utc>) {
        records
            .sort_by_key(|record| Reverse(record.duration_limited(now, &self.config.accrual)));
    }
}

fn sort_usages(usages: &mut [AppUsage]) {
    usages.sort_by_key(|usage| Reverse(usage.duration));
}

fn normalize_range(start: NaiveDate, end: NaiveDate, today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let (start, end) = if start <= end { (start, end) } else { (end, start) };
    (start.min(today), end.min(today))
}
