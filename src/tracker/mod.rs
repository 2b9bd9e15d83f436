//! The tracking session: owns the live working set of [UsageRecord]s and turns
//! raw focus samples into focus transitions, idle handling and flush events. All
//! mutation happens on the owner loop; the flush worker only ever sees snapshots.

pub mod cadence;
pub mod flush;
pub mod idle;
pub mod probe;

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Duration as StdDuration,
};

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    engine::{identity::IdentityResolver, record::UsageRecord, rules::ResolverRules},
    store::day_file::DayFileStore,
    utils::clock::{Clock, SystemClock},
};

use self::{
    cadence::CadenceGate,
    flush::FlushModule,
    idle::IdleEvaluator,
    probe::{FocusProbe, FocusSample},
};

const DEFAULT_TICK_INTERVAL: StdDuration = StdDuration::from_secs(1);
const DEFAULT_FLUSH_PERIOD: Duration = Duration::minutes(3);
const DEFAULT_IDLE_THRESHOLD_S: u64 = 60 * 2;

/// A gap between ticks this large means the host slept rather than lagged.
const SUSPEND_GAP: Duration = Duration::minutes(2);

/// Read side of the live working set, consumed by the aggregation engine.
pub trait TrackingSession: Send + Sync {
    /// The record currently holding focus, if any.
    fn current_record(&self) -> Option<UsageRecord>;

    /// Snapshot of today's live records.
    fn live_records(&self) -> Vec<UsageRecord>;
}

/// Events emitted by the tracker. Save requests go to the flush worker, the rest
/// exist for a presentation layer to subscribe to.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    WindowChanged {
        process_identity: Arc<str>,
        window_title: Arc<str>,
    },
    RecordUpdated(UsageRecord),
    ReadyForSave(UsageRecord),
}

#[derive(Default)]
struct WorkingSet {
    records: HashMap<Arc<str>, UsageRecord>,
    focused: Option<Arc<str>>,
    date: Option<NaiveDate>,
}

fn focused_record_mut(set: &mut WorkingSet) -> Option<&mut UsageRecord> {
    let key = set.focused.clone()?;
    set.records.get_mut(&key)
}

/// Cloneable read handle over the working set. The tracker is the only writer.
#[derive(Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<WorkingSet>>,
}

impl TrackingSession for SessionHandle {
    fn current_record(&self) -> Option<UsageRecord> {
        let set = self.inner.read().expect("working set lock poisoned");
        set.focused
            .as_ref()
            .and_then(|key| set.records.get(key))
            .cloned()
    }

    fn live_records(&self) -> Vec<UsageRecord> {
        let set = self.inner.read().expect("working set lock poisoned");
        set.records.values().cloned().collect()
    }
}

pub struct FocusTracker {
    session: SessionHandle,
    probe: Box<dyn FocusProbe>,
    resolver: Arc<IdentityResolver>,
    events: mpsc::Sender<TrackerEvent>,
    shutdown: CancellationToken,
    idle: IdleEvaluator,
    tick_interval: StdDuration,
    flush_gate: CadenceGate,
    clock: Box<dyn Clock>,
    last_tick: Option<DateTime<Utc>>,
    suspended: bool,
}

impl FocusTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        probe: Box<dyn FocusProbe>,
        resolver: Arc<IdentityResolver>,
        events: mpsc::Sender<TrackerEvent>,
        shutdown: CancellationToken,
        idle: IdleEvaluator,
        tick_interval: StdDuration,
        flush_period: Duration,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            session: SessionHandle::default(),
            probe,
            resolver,
            events,
            shutdown,
            idle,
            tick_interval,
            flush_gate: CadenceGate::new(flush_period),
            clock,
            last_tick: None,
            suspended: false,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.session.clone()
    }

    /// Executes the tracking event loop until the shutdown token fires, then
    /// performs the final teardown.
    pub async fn run(mut self) -> Result<()> {
        let mut tick_point = self.clock.instant();
        self.flush_gate.rearm(self.clock.time());
        loop {
            tick_point += self.tick_interval;

            if let Err(e) = self.tick().await {
                error!("Encountered an error during tracking {:?}", e);
            }

            let cancelled = tokio::select! {
                _ = self.shutdown.cancelled() => true,
                _ = self.clock.sleep_until(tick_point) => false,
            };
            // Cancellation stops the loop. Teardown credits every live record's
            // tail before the last flush, and dropping the sender afterwards is
            // what lets the flush worker finish.
            if cancelled {
                return self.stop().await;
            }
        }
    }

    async fn tick(&mut self) -> Result<()> {
        if self.suspended {
            return Ok(());
        }
        let now = self.clock.time();
        self.detect_sleep_gap(now);
        self.roll_over_day(now).await?;

        let sample = self.probe.sample()?;
        let idle_ms = self.probe.idle_time_ms()?;
        if self.idle.is_idle(idle_ms) {
            self.enter_idle(now).await?;
        } else {
            self.observe(sample, now).await?;
        }

        if self.flush_gate.ready(now) {
            self.flush_live().await?;
        }
        Ok(())
    }

    /// An unannounced gap between ticks means the host was asleep. Re-basing the
    /// focused record's anchor keeps the gap out of its accrual.
    fn detect_sleep_gap(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_tick {
            if now - last > SUSPEND_GAP {
                info!(
                    "Detected a {}s tick gap, re-anchoring",
                    (now - last).num_seconds()
                );
                let mut set = self.session.inner.write().expect("working set lock poisoned");
                if let Some(record) = focused_record_mut(&mut set) {
                    record.set_idle_anchor(now);
                }
            }
        }
        self.last_tick = Some(now);
    }

    /// Closes out yesterday's working set once the date changes, handing every
    /// record to the flush worker.
    async fn roll_over_day(&mut self, now: DateTime<Utc>) -> Result<()> {
        let today = now.date_naive();
        let finished = {
            let mut set = self.session.inner.write().expect("working set lock poisoned");
            match set.date {
                Some(date) if date != today => {
                    set.date = Some(today);
                    set.focused = None;
                    let mut finished = std::mem::take(&mut set.records);
                    for record in finished.values_mut() {
                        record.set_focus(false, now);
                    }
                    Some(finished)
                }
                Some(_) => None,
                None => {
                    set.date = Some(today);
                    None
                }
            }
        };
        if let Some(finished) = finished {
            info!("Day rolled over, flushing {} records", finished.len());
            for (_, record) in finished {
                self.events.send(TrackerEvent::ReadyForSave(record)).await?;
            }
        }
        Ok(())
    }

    async fn observe(&mut self, sample: FocusSample, now: DateTime<Utc>) -> Result<()> {
        let identity = self.resolver.normalize(&sample.process_name);

        let mut updated = Vec::new();
        let mut window_changed = false;
        {
            let mut set = self.session.inner.write().expect("working set lock poisoned");

            let same_app = match &set.focused {
                Some(current) if *current == identity => true,
                Some(current) => {
                    let current_title = set
                        .records
                        .get(current)
                        .map(|record| record.display_title.clone())
                        .unwrap_or_default();
                    self.resolver.should_consolidate(
                        current,
                        &identity,
                        &current_title,
                        &sample.window_title,
                    )
                }
                None => false,
            };

            if same_app {
                if let Some(record) = focused_record_mut(&mut set) {
                    if !sample.window_title.is_empty()
                        && record.display_title != *sample.window_title
                    {
                        record.display_title = sample.window_title.to_string();
                        updated.push(record.clone());
                    }
                }
            } else {
                if let Some(previous_key) = set.focused.take() {
                    if let Some(previous) = set.records.get_mut(&previous_key) {
                        previous.set_focus(false, now);
                        updated.push(previous.clone());
                    }
                }

                let record = set.records.entry(identity.clone()).or_insert_with(|| {
                    UsageRecord::started(identity.clone(), sample.window_title.to_string(), now)
                });
                record.set_focus(true, now);
                if !sample.window_title.is_empty() {
                    record.display_title = sample.window_title.to_string();
                }
                updated.push(record.clone());
                set.focused = Some(identity.clone());
                window_changed = true;
            }
        }

        if window_changed {
            debug!("Focus moved to {identity}");
            self.events
                .send(TrackerEvent::WindowChanged {
                    process_identity: identity,
                    window_title: sample.window_title,
                })
                .await?;
        }
        for record in updated {
            self.events.send(TrackerEvent::RecordUpdated(record)).await?;
        }
        Ok(())
    }

    /// The user stopped interacting; the focused record stops accruing until the
    /// next active sample refocuses it.
    async fn enter_idle(&mut self, now: DateTime<Utc>) -> Result<()> {
        let unfocused = {
            let mut set = self.session.inner.write().expect("working set lock poisoned");
            let key = set.focused.take();
            match key {
                Some(key) => set.records.get_mut(&key).map(|record| {
                    record.set_focus(false, now);
                    record.clone()
                }),
                None => None,
            }
        };
        if let Some(record) = unfocused {
            debug!("Idle threshold crossed, unfocusing {}", record.process_identity);
            self.events.send(TrackerEvent::RecordUpdated(record)).await?;
        }
        Ok(())
    }

    async fn flush_live(&mut self) -> Result<()> {
        let snapshot = self.session.live_records();
        debug!("Flushing {} live records", snapshot.len());
        for record in snapshot {
            self.events.send(TrackerEvent::ReadyForSave(record)).await?;
        }
        Ok(())
    }

    /// Banks the focused record's accrual ahead of system sleep without giving up
    /// focus. The sleep interval itself is discarded on resume.
    pub fn pause_for_suspend(&mut self) {
        let now = self.clock.time();
        let mut set = self.session.inner.write().expect("working set lock poisoned");
        if let Some(record) = focused_record_mut(&mut set) {
            record.set_focus(false, now);
            record.set_focus(true, now);
        }
        self.suspended = true;
    }

    pub fn resume_after_suspend(&mut self) {
        let now = self.clock.time();
        {
            let mut set = self.session.inner.write().expect("working set lock poisoned");
            if let Some(record) = focused_record_mut(&mut set) {
                record.set_idle_anchor(now);
            }
        }
        self.flush_gate.rearm(now);
        self.last_tick = Some(now);
        self.suspended = false;
    }

    /// Final teardown: force focus off every live record so the tail accrual is
    /// credited, then hand everything to the flush worker.
    async fn stop(self) -> Result<()> {
        let now = self.clock.time();
        let records = {
            let mut set = self.session.inner.write().expect("working set lock poisoned");
            set.focused = None;
            set.records
                .values_mut()
                .map(|record| {
                    record.set_focus(false, now);
                    record.clone()
                })
                .collect::<Vec<_>>()
        };
        for record in records {
            self.events.send(TrackerEvent::ReadyForSave(record)).await?;
        }
        Ok(())
    }
}

/// Represents the starting point for a tracking session: wires the tracker to a
/// flush worker over a channel and runs both until a shutdown signal.
pub async fn run_tracking(data_dir: PathBuf, probe: Box<dyn FocusProbe>) -> Result<()> {
    let (sender, receiver) = mpsc::channel::<TrackerEvent>(10);
    let shutdown = CancellationToken::new();

    let resolver = Arc::new(IdentityResolver::new(ResolverRules::default()));
    let tracker = create_tracker(probe, resolver, sender, &shutdown, SystemClock);
    let flusher = create_flusher(data_dir.join("records"), receiver, SystemClock)?;

    let (_, tracking_result, flush_result) = tokio::join!(
        detect_shutdown(shutdown.clone()),
        tracker.run(),
        flusher.run(),
    );

    if let Err(tracking_result) = tracking_result {
        error!("Tracking module got an error {:?}", tracking_result);
    }

    if let Err(flush_result) = flush_result {
        error!("Flush module got an error {:?}", flush_result);
    }

    Ok(())
}

fn create_tracker(
    probe: Box<dyn FocusProbe>,
    resolver: Arc<IdentityResolver>,
    sender: mpsc::Sender<TrackerEvent>,
    shutdown: &CancellationToken,
    clock: impl Clock,
) -> FocusTracker {
    FocusTracker::new(
        probe,
        resolver,
        sender,
        shutdown.clone(),
        IdleEvaluator::from_seconds(DEFAULT_IDLE_THRESHOLD_S),
        DEFAULT_TICK_INTERVAL,
        DEFAULT_FLUSH_PERIOD,
        Box::new(clock),
    )
}

fn create_flusher(
    record_dir: PathBuf,
    receiver: mpsc::Receiver<TrackerEvent>,
    clock: impl Clock + Clone,
) -> Result<FlushModule<DayFileStore>> {
    let store = DayFileStore::new(record_dir, Box::new(clock.clone()))?;
    Ok(FlushModule::new(receiver, store, Box::new(clock)))
}

async fn detect_shutdown(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal {e:?}");
    }
    shutdown.cancel();
}
