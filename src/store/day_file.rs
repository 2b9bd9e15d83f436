use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use chrono::{Duration, NaiveDate};
use fs4::tokio::AsyncFileExt;
use futures::{stream, StreamExt};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader},
};
use tracing::{debug, warn};

use crate::{
    engine::record::UsageRecord,
    utils::{
        clock::Clock,
        time::{date_to_record_name, dates_inclusive},
    },
};

use super::{entities::PersistedRecord, MaintenanceReport, UsageStore};

const READ_CONCURRENCY: usize = 4;

/// The main realization of [UsageStore]. Keeps one append-only JSONL file per day;
/// upserts append a new line and readers keep the last line per id, so writes stay
/// cheap and a torn write can only affect the final line.
///
/// Id assignment assumes a single writer, which the flush worker guarantees.
pub struct DayFileStore {
    record_dir: PathBuf,
    clock: Box<dyn Clock>,
    next_ids: Mutex<HashMap<NaiveDate, i64>>,
}

impl DayFileStore {
    pub fn new(record_dir: PathBuf, clock: Box<dyn Clock>) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&record_dir)?;

        Ok(Self {
            record_dir,
            clock,
            next_ids: Mutex::new(HashMap::new()),
        })
    }

    fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.record_dir.join(date_to_record_name(date))
    }

    /// Rows for one day after last-write-wins resolution, in first-seen order.
    async fn read_day_rows(&self, date: NaiveDate) -> Result<Vec<PersistedRecord>> {
        async fn extract(path: &Path) -> std::result::Result<Vec<PersistedRecord>, std::io::Error> {
            debug!("Extracting {path:?}");
            let file = File::open(path).await?;
            file.lock_shared()?;
            let buffer = BufReader::new(file);
            let mut lines = buffer.lines();
            let mut rows = vec![];
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<PersistedRecord>(&line) {
                    Ok(row) => rows.push(row),
                    Err(e) => {
                        // ignore illegal values. Might happen after shutdowns
                        warn!(
                            "During parsing in path {:?} found illegal json string {}:  {e}",
                            path, &line
                        )
                    }
                }
            }

            lines.into_inner().into_inner().unlock_async().await?;

            Ok(rows)
        }

        let path = self.day_path(date);
        match extract(&path).await {
            Ok(rows) => Ok(latest_by_id(rows)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e)?,
        }
    }

    async fn append_row(&self, row: &PersistedRecord) -> Result<()> {
        let path = self.day_path(row.date);
        let mut file = File::options()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        // Semi-safe acquire-release for a file
        file.lock_exclusive()?;
        let result = Self::append_with_file(&mut file, row).await;
        file.unlock_async().await?;
        result
    }

    async fn append_with_file(file: &mut File, row: &PersistedRecord) -> Result<()> {
        let mut buffer = serde_json::to_vec(row)?;
        buffer.push(b'\n');
        file.write_all(&buffer).await?;
        file.flush().await?;
        Ok(())
    }

    async fn compact_file(path: &Path) -> Result<usize> {
        let mut file = File::options().read(true).write(true).open(path).await?;
        file.lock_exclusive()?;
        let result = Self::compact_with_file(&mut file).await;
        file.unlock_async().await?;
        result
    }

    /// Rewrites a day file keeping only the winning row per id. Returns how many
    /// lines were dropped.
    async fn compact_with_file(file: &mut File) -> Result<usize> {
        let mut raw = String::new();
        file.read_to_string(&mut raw).await?;

        let mut total_lines = 0usize;
        let mut parsed = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            total_lines += 1;
            match serde_json::from_str::<PersistedRecord>(line) {
                Ok(row) => parsed.push(row),
                Err(e) => warn!("Dropping corrupted row during maintenance: {e}"),
            }
        }

        let surviving = latest_by_id(parsed);
        let removed = total_lines - surviving.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut buffer = Vec::<u8>::new();
        for row in &surviving {
            serde_json::to_writer(&mut buffer, row)?;
            buffer.push(b'\n');
        }

        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(&buffer).await?;
        file.flush().await?;
        Ok(removed)
    }
}

impl UsageStore for DayFileStore {
    async fn records_for_date(&self, date: NaiveDate) -> Result<Vec<UsageRecord>> {
        let rows = self.read_day_rows(date).await?;
        Ok(rows.into_iter().map(PersistedRecord::into_record).collect())
    }

    async fn records_for_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<UsageRecord>> {
        let mut days = stream::iter(dates_inclusive(start, end))
            .map(|date| self.read_day_rows(date))
            .buffered(READ_CONCURRENCY);

        let mut records = Vec::new();
        while let Some(day) = days.next().await {
            records.extend(day?.into_iter().map(PersistedRecord::into_record));
        }
        Ok(records)
    }

    async fn usage_report_for_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<(Arc<str>, Duration)>> {
        let mut days = stream::iter(dates_inclusive(start, end))
            .map(|date| self.read_day_rows(date))
            .buffered(READ_CONCURRENCY);

        let mut totals = HashMap::<Arc<str>, Duration>::new();
        while let Some(day) = days.next().await {
            for row in day? {
                let total = totals.entry(row.process_identity).or_insert(Duration::zero());
                *total = *total + row.duration;
            }
        }

        let mut report = totals.into_iter().collect::<Vec<_>>();
        report.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(report)
    }

    async fn save_record(&self, record: &mut UsageRecord) -> Result<i64> {
        let date = record.date;
        let cached = self
            .next_ids
            .lock()
            .expect("id cache lock poisoned")
            .get(&date)
            .copied();
        let id = match cached {
            Some(id) => id,
            None => {
                let rows = self.read_day_rows(date).await?;
                rows.iter().map(|row| row.id).max().unwrap_or(0) + 1
            }
        };

        let row = PersistedRecord::snapshot(record, id, self.clock.time());
        self.append_row(&row).await?;

        record.source_id = Some(id);
        self.next_ids
            .lock()
            .expect("id cache lock poisoned")
            .insert(date, id + 1);
        Ok(id)
    }

    async fn update_record(&self, record: &UsageRecord) -> Result<()> {
        let Some(id) = record.source_id else {
            bail!("can't update a record that was never saved");
        };
        let row = PersistedRecord::snapshot(record, id, self.clock.time());
        self.append_row(&row).await
    }

    fn is_initialized(&self) -> bool {
        self.record_dir.is_dir()
    }

    async fn perform_maintenance(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        let mut entries = tokio::fs::read_dir(&self.record_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |extension| extension != "jsonl") {
                continue;
            }
            match Self::compact_file(&path).await {
                Ok(0) => {}
                Ok(removed) => {
                    report.files_compacted += 1;
                    report.rows_removed += removed;
                }
                Err(e) => warn!("Failed to compact {path:?}: {e}"),
            }
        }
        Ok(report)
    }
}

/// Keeps the last row seen for each id, preserving first-seen order.
fn latest_by_id(rows: Vec<PersistedRecord>) -> Vec<PersistedRecord> {
    let mut order = Vec::new();
    let mut latest = HashMap::<i64, PersistedRecord>::new();
    for row in rows {
        if !latest.contains_key(&row.id) {
            order.push(row.id);
        }
        latest.insert(row.id, row);
    }
    order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
    use tempfile::tempdir;
    use tokio::time::Instant;

    use super::DayFileStore;
    use crate::{
        engine::record::UsageRecord,
        store::UsageStore,
        utils::clock::Clock,
    };

    const TEST_START_DATE: NaiveDateTime = NaiveDateTime::new(
        NaiveDate::from_ymd_opt(2024, 4, 29).unwrap(),
        NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
    );

    struct FixedClock(DateTime<Utc>);

    #[async_trait]
    impl Clock for FixedClock {
        fn time(&self) -> DateTime<Utc> {
            self.0
        }

        fn instant(&self) -> Instant {
            Instant::now()
        }

        async fn sleep(&self, _duration: StdDuration) {}

        async fn sleep_until(&self, _instant: Instant) {}
    }

    fn start_moment() -> DateTime<Utc> {
        Utc.from_utc_datetime(&TEST_START_DATE)
    }

    fn test_store(dir: &std::path::Path, now: DateTime<Utc>) -> DayFileStore {
        DayFileStore::new(dir.to_path_buf(), Box::new(FixedClock(now))).unwrap()
    }

    fn closed_record(identity: &str, offset_minutes: i64, seconds: i64) -> UsageRecord {
        let start = start_moment() + Duration::minutes(offset_minutes);
        UsageRecord::restored(
            identity.into(),
            identity,
            start.date_naive(),
            start,
            Some(start + Duration::seconds(seconds)),
            Duration::seconds(seconds),
            None,
        )
    }

    #[tokio::test]
    async fn save_assigns_sequential_ids() -> Result<()> {
        let dir = tempdir()?;
        let store = test_store(dir.path(), start_moment());

        let mut first = closed_record("editor", 0, 300);
        let mut second = closed_record("chrome", 10, 120);
        assert_eq!(store.save_record(&mut first).await?, 1);
        assert_eq!(store.save_record(&mut second).await?, 2);
        assert_eq!(first.source_id, Some(1));

        let records = store.records_for_date(TEST_START_DATE.date()).await?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].process_identity, "editor".into());
        Ok(())
    }

    #[tokio::test]
    async fn id_assignment_continues_across_store_instances() -> Result<()> {
        let dir = tempdir()?;
        {
            let store = test_store(dir.path(), start_moment());
            store.save_record(&mut closed_record("editor", 0, 300)).await?;
        }

        let reopened = test_store(dir.path(), start_moment());
        let id = reopened
            .save_record(&mut closed_record("chrome", 10, 120))
            .await?;
        assert_eq!(id, 2);
        Ok(())
    }

    #[tokio::test]
    async fn update_wins_over_earlier_rows() -> Result<()> {
        let dir = tempdir()?;
        let store = test_store(dir.path(), start_moment());

        let mut record = closed_record("editor", 0, 300);
        store.save_record(&mut record).await?;

        let grown = UsageRecord::restored(
            "editor".into(),
            "main.rs - editor",
            record.date,
            record.start_time,
            record.end_time,
            Duration::seconds(540),
            record.source_id,
        );
        store.update_record(&grown).await?;

        let records = store.records_for_date(TEST_START_DATE.date()).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].accumulated(), Duration::seconds(540));
        assert_eq!(records[0].display_title, "main.rs - editor");
        Ok(())
    }

    #[tokio::test]
    async fn update_without_id_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let store = test_store(dir.path(), start_moment());
        let record = closed_record("editor", 0, 300);
        assert!(store.update_record(&record).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn flushed_record_round_trips_with_at_least_saved_duration() -> Result<()> {
        let dir = tempdir()?;
        let store = test_store(dir.path(), start_moment() + Duration::seconds(600));

        // focused record, accrual snapshot happens at save time
        let mut live = UsageRecord::started("editor".into(), "editor", start_moment());
        let saved_duration = live.duration_at(store.clock.time());
        store.save_record(&mut live).await?;
        store.update_record(&live).await?;

        let records = store.records_for_date(TEST_START_DATE.date()).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].process_identity, live.process_identity);
        assert!(records[0].accumulated() >= saved_duration);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped_on_read() -> Result<()> {
        let dir = tempdir()?;
        let store = test_store(dir.path(), start_moment());
        store.save_record(&mut closed_record("editor", 0, 300)).await?;

        let path = dir
            .path()
            .join(crate::utils::time::date_to_record_name(TEST_START_DATE.date()));
        let mut raw = std::fs::read_to_string(&path)?;
        raw.push_str("{\"id\": 99, \"trunc");
        std::fs::write(&path, raw)?;

        let records = store.records_for_date(TEST_START_DATE.date()).await?;
        assert_eq!(records.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn range_reads_cover_every_day() -> Result<()> {
        let dir = tempdir()?;
        let store = test_store(dir.path(), start_moment());

        let mut monday = closed_record("editor", 0, 300);
        store.save_record(&mut monday).await?;

        let tuesday_start = start_moment() + Duration::days(1);
        let mut tuesday = UsageRecord::restored(
            "chrome".into(),
            "chrome",
            tuesday_start.date_naive(),
            tuesday_start,
            Some(tuesday_start + Duration::seconds(450)),
            Duration::seconds(450),
            None,
        );
        store.save_record(&mut tuesday).await?;

        let records = store
            .records_for_range(TEST_START_DATE.date(), TEST_START_DATE.date() + Duration::days(1))
            .await?;
        assert_eq!(records.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn usage_report_sums_per_identity_across_days() -> Result<()> {
        let dir = tempdir()?;
        let store = test_store(dir.path(), start_moment());

        store.save_record(&mut closed_record("editor", 0, 300)).await?;
        store.save_record(&mut closed_record("chrome", 10, 100)).await?;

        let tuesday_start = start_moment() + Duration::days(1);
        let mut tuesday = UsageRecord::restored(
            "editor".into(),
            "editor",
            tuesday_start.date_naive(),
            tuesday_start,
            Some(tuesday_start + Duration::seconds(150)),
            Duration::seconds(150),
            None,
        );
        store.save_record(&mut tuesday).await?;

        let report = store
            .usage_report_for_range(TEST_START_DATE.date(), TEST_START_DATE.date() + Duration::days(1))
            .await?;
        assert_eq!(
            report,
            vec![
                ("chrome".into(), Duration::seconds(100)),
                ("editor".into(), Duration::seconds(450)),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn maintenance_compacts_superseded_rows() -> Result<()> {
        let dir = tempdir()?;
        let store = test_store(dir.path(), start_moment());

        let mut record = closed_record("editor", 0, 300);
        store.save_record(&mut record).await?;
        for seconds in [360, 420, 480] {
            let grown = UsageRecord::restored(
                "editor".into(),
                "editor",
                record.date,
                record.start_time,
                record.end_time,
                Duration::seconds(seconds),
                record.source_id,
            );
            store.update_record(&grown).await?;
        }

        let report = store.perform_maintenance().await?;
        assert_eq!(report.files_compacted, 1);
        assert_eq!(report.rows_removed, 3);

        let records = store.records_for_date(TEST_START_DATE.date()).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].accumulated(), Duration::seconds(480));

        // a second pass finds nothing left to do
        let report = store.perform_maintenance().await?;
        assert_eq!(report.files_compacted, 0);
        Ok(())
    }
}
