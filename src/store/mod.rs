use std::{future::Future, ops::Deref, sync::Arc};

use anyhow::Result;
use chrono::{Duration, NaiveDate};

use crate::engine::record::UsageRecord;

pub mod day_file;
pub mod entities;

/// Interface for abstracting durable storage of usage records. The aggregation
/// engine only reads through this; all writes come from the flush worker, which is
/// the single component allowed to persist.
pub trait UsageStore {
    fn records_for_date(
        &self,
        date: NaiveDate,
    ) -> impl Future<Output = Result<Vec<UsageRecord>>> + Send;

    fn records_for_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Future<Output = Result<Vec<UsageRecord>>> + Send;

    /// Pre-aggregated per-identity totals for a whole range, one pair per process
    /// rather than one per day.
    fn usage_report_for_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Future<Output = Result<Vec<(Arc<str>, Duration)>>> + Send;

    /// Persists a new record and assigns its id, also written back into the
    /// record.
    fn save_record(
        &self,
        record: &mut UsageRecord,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Idempotent upsert keyed by the record's assigned id.
    fn update_record(&self, record: &UsageRecord) -> impl Future<Output = Result<()>> + Send;

    /// Whether the store is ready to serve reads. When false, callers degrade to
    /// live-only data instead of failing.
    fn is_initialized(&self) -> bool;

    fn perform_maintenance(&self) -> impl Future<Output = Result<MaintenanceReport>> + Send;
}

impl<T: Deref> UsageStore for T
where
    T::Target: UsageStore,
{
    fn records_for_date(
        &self,
        date: NaiveDate,
    ) -> impl Future<Output = Result<Vec<UsageRecord>>> + Send {
        self.deref().records_for_date(date)
    }

    fn records_for_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Future<Output = Result<Vec<UsageRecord>>> + Send {
        self.deref().records_for_range(start, end)
    }

    fn usage_report_for_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Future<Output = Result<Vec<(Arc<str>, Duration)>>> + Send {
        self.deref().usage_report_for_range(start, end)
    }

    fn save_record(
        &self,
        record: &mut UsageRecord,
    ) -> impl Future<Output = Result<i64>> + Send {
        self.deref().save_record(record)
    }

    fn update_record(&self, record: &UsageRecord) -> impl Future<Output = Result<()>> + Send {
        self.deref().update_record(record)
    }

    fn is_initialized(&self) -> bool {
        self.deref().is_initialized()
    }

    fn perform_maintenance(&self) -> impl Future<Output = Result<MaintenanceReport>> + Send {
        self.deref().perform_maintenance()
    }
}

/// Outcome of a maintenance pass, for logging and the `maintain` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub files_compacted: usize,
    pub rows_removed: usize,
}
