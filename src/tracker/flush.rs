use std::{collections::HashMap, sync::Arc, time::Duration as StdDuration};

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info, warn};

use crate::{engine::record::UsageRecord, store::UsageStore, utils::clock::Clock};

use super::{cadence::CadenceGate, TrackerEvent};

const MAINTENANCE_PERIOD: Duration = Duration::hours(1);
const MAINTENANCE_POLL: StdDuration = StdDuration::from_secs(60);

/// Worker-side module draining tracker events into the store. This is the only
/// component that performs durable writes, which keeps the live working set free
/// of persistence concerns and makes id assignment race-free.
///
/// The tracker sends snapshots without knowing about persisted ids; the worker
/// remembers which (date, identity) pair got which id and turns repeated
/// snapshots into upserts.
pub struct FlushModule<S> {
    receiver: Receiver<TrackerEvent>,
    store: S,
    clock: Box<dyn Clock>,
    assigned_ids: HashMap<(NaiveDate, Arc<str>), i64>,
    maintenance_gate: CadenceGate,
}

impl<S: UsageStore> FlushModule<S> {
    pub fn new(receiver: Receiver<TrackerEvent>, store: S, clock: Box<dyn Clock>) -> Self {
        Self {
            receiver,
            store,
            clock,
            assigned_ids: HashMap::new(),
            maintenance_gate: CadenceGate::new(MAINTENANCE_PERIOD),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.maintenance_gate.rearm(self.clock.time());
        loop {
            let received = tokio::select! {
                event = self.receiver.recv() => Some(event),
                _ = self.clock.sleep(MAINTENANCE_POLL) => None,
            };
            match received {
                Some(Some(TrackerEvent::ReadyForSave(record))) => {
                    debug!("Persisting {:?}", record);
                    if let Err(e) = self.persist(record).await {
                        error!("Error persisting record: {e:?}");
                    }
                }
                // presentation-side events, nothing to store
                Some(Some(TrackerEvent::WindowChanged { .. }))
                | Some(Some(TrackerEvent::RecordUpdated(_))) => {}
                // sender dropped, tracking is over
                Some(None) => break,
                None => self.maybe_run_maintenance().await,
            }
        }
        self.receiver.close();
        Ok(())
    }

    async fn persist(&mut self, mut record: UsageRecord) -> Result<()> {
        let key = (record.date, record.process_identity.clone());
        let known_id = record
            .source_id
            .or_else(|| self.assigned_ids.get(&key).copied());
        match known_id {
            Some(id) => {
                record.source_id = Some(id);
                self.store.update_record(&record).await
            }
            None => {
                let id = self.store.save_record(&mut record).await?;
                self.assigned_ids.insert(key, id);
                Ok(())
            }
        }
    }

    /// Maintenance runs on its own slow cadence so compaction cost never stalls
    /// record persistence.
    async fn maybe_run_maintenance(&mut self) {
        if !self.maintenance_gate.ready(self.clock.time()) {
            return;
        }
        match self.store.perform_maintenance().await {
            Ok(report) => info!(
                "Store maintenance removed {} rows across {} files",
                report.rows_removed, report.files_compacted
            ),
            Err(e) => warn!("Store maintenance failed: {e:?}"),
        }
    }
}
