use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::record::UsageRecord;

/// The row shape written to a day file. Each upsert appends one line; readers keep
/// the last line seen for an id, so a crashed write never corrupts earlier data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: i64,
    pub process_identity: Arc<str>,
    pub display_title: String,
    pub date: NaiveDate,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start_time: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(with = "duration_ser")]
    pub duration: Duration,
}

impl PersistedRecord {
    /// Snapshot of a record at `now`. Live accrual is folded into the stored
    /// duration so the row is self-contained.
    pub fn snapshot(record: &UsageRecord, id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            process_identity: record.process_identity.clone(),
            display_title: record.display_title.clone(),
            date: record.date,
            start_time: record.start_time,
            end_time: record.end_time,
            duration: record.duration_at(now),
        }
    }

    pub fn into_record(self) -> UsageRecord {
        UsageRecord::restored(
            self.process_identity,
            self.display_title,
            self.date,
            self.start_time,
            self.end_time,
            self.duration,
            Some(self.id),
        )
    }
}

mod duration_ser {
    use chrono::Duration;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(duration.num_seconds())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = i64::deserialize(deserializer)?;
        Ok(Duration::seconds(s))
    }
}
