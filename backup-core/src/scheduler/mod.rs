//! Recurring backups.
//!
//! Every schedule entry gets its own loop. A loop arms the next fire time,
//! sleeps until it, runs the backup and waits for it to finish before arming
//! again, so runs of one entry never overlap while different entries run
//! independently. Runs are tracked separately from loops: removing or
//! disabling an entry stops its loop but lets a run in flight complete.

pub mod cadence;

use crate::health::NextRun;
use crate::manager::{BackupManager, CreateRequest};
use crate::metadata::BackupType;
use crate::utils::errors::{BackupError, Result};
use cadence::{next_fire_after, Cadence};
use chrono::{DateTime, Local, NaiveTime, Utc, Weekday};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on a single sleep, so wall-clock jumps are noticed.
const MAX_NAP: Duration = Duration::from_secs(60);

fn default_backup_type() -> BackupType {
    BackupType::Automatic
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    /// Generated when left empty
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub cadence: Cadence,
    #[serde(default = "default_backup_type")]
    pub backup_type: BackupType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ScheduleEntry {
    pub fn new(id: impl Into<String>, cadence: Cadence) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            cadence,
            backup_type: BackupType::Automatic,
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Daily at `daily_at`, weekly on Sunday at 02:00, monthly on the 1st at 01:00.
pub fn default_schedules(daily_at: NaiveTime) -> Vec<ScheduleEntry> {
    let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default();
    vec![
        ScheduleEntry::new("daily", Cadence::Daily { time: daily_at })
            .with_description("Daily automatic backup"),
        ScheduleEntry::new(
            "weekly",
            Cadence::Weekly {
                weekday: Weekday::Sun,
                time: hm(2, 0),
            },
        )
        .with_description("Weekly automatic backup"),
        ScheduleEntry::new("monthly", Cadence::Monthly { day: 1, time: hm(1, 0) })
            .with_description("Monthly automatic backup"),
    ]
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    #[serde(flatten)]
    pub entry: ScheduleEntry,
    pub next_fire: Option<DateTime<Utc>>,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
}

struct Slot {
    entry: RwLock<ScheduleEntry>,
    cancel: CancellationToken,
    wake: Notify,
    trigger: AtomicBool,
    running: AtomicBool,
    next_fire: RwLock<Option<DateTime<Utc>>>,
    last_run: RwLock<Option<DateTime<Utc>>>,
}

impl Slot {
    fn entry(&self) -> ScheduleEntry {
        self.entry.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn next_fire(&self) -> Option<DateTime<Utc>> {
        *self.next_fire.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_next_fire(&self, at: Option<DateTime<Utc>>) {
        *self.next_fire.write().unwrap_or_else(|e| e.into_inner()) = at;
    }

    fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.read().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> ScheduleStatus {
        let entry = self.entry();
        let running = self.running.load(Ordering::SeqCst);
        let next_fire = match self.next_fire() {
            Some(at) => Some(at),
            None if entry.enabled && !running => next_fire_utc(&entry.cadence),
            None => None,
        };
        ScheduleStatus {
            entry,
            next_fire,
            running,
            last_run: self.last_run(),
        }
    }
}

fn next_fire_utc(cadence: &Cadence) -> Option<DateTime<Utc>> {
    next_fire_after(cadence, &Local::now()).map(|at| at.with_timezone(&Utc))
}

pub struct Scheduler {
    manager: Arc<BackupManager>,
    slots: DashMap<String, Arc<Slot>>,
    /// Parent of every loop's token
    root: CancellationToken,
    /// Handed to runs; only cancelled when shutdown runs out of patience
    run_token: CancellationToken,
    loops: TaskTracker,
    runs: TaskTracker,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(manager: Arc<BackupManager>) -> Self {
        Self {
            manager,
            slots: DashMap::new(),
            root: CancellationToken::new(),
            run_token: CancellationToken::new(),
            loops: TaskTracker::new(),
            runs: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Register `entry`, returning its id. Ids are unique.
    pub fn add_schedule(&self, mut entry: ScheduleEntry) -> Result<String> {
        entry.cadence.validate().map_err(BackupError::ValidationFailed)?;
        if entry.id.trim().is_empty() {
            entry.id = Uuid::new_v4().simple().to_string();
        }
        let id = entry.id.clone();

        let slot = match self.slots.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BackupError::ScheduleExists(id));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let slot = Arc::new(Slot {
                    entry: RwLock::new(entry),
                    cancel: self.root.child_token(),
                    wake: Notify::new(),
                    trigger: AtomicBool::new(false),
                    running: AtomicBool::new(false),
                    next_fire: RwLock::new(None),
                    last_run: RwLock::new(None),
                });
                vacant.insert(Arc::clone(&slot));
                slot
            }
        };

        info!(schedule_id = %id, cadence = %slot.entry().cadence, "Schedule added");
        if self.started.load(Ordering::SeqCst) {
            self.spawn_loop(slot);
        }
        Ok(id)
    }

    /// Stop scheduling `id`. A run already in progress finishes normally.
    pub fn remove_schedule(&self, id: &str) -> Result<ScheduleEntry> {
        let (_, slot) = self
            .slots
            .remove(id)
            .ok_or_else(|| BackupError::NotFound(format!("schedule {}", id)))?;
        slot.cancel.cancel();
        info!(schedule_id = %id, "Schedule removed");
        Ok(slot.entry())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<ScheduleEntry> {
        let slot = self.slot(id)?;
        let entry = {
            let mut entry = slot.entry.write().unwrap_or_else(|e| e.into_inner());
            entry.enabled = enabled;
            entry.clone()
        };
        slot.wake.notify_one();
        info!(schedule_id = %id, enabled, "Schedule updated");
        Ok(entry)
    }

    /// Fire `id` now, or right after its current run finishes.
    pub fn trigger(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        slot.trigger.store(true, Ordering::SeqCst);
        slot.wake.notify_one();
        Ok(())
    }

    fn slot(&self, id: &str) -> Result<Arc<Slot>> {
        self.slots
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| BackupError::NotFound(format!("schedule {}", id)))
    }

    pub fn get(&self, id: &str) -> Result<ScheduleStatus> {
        Ok(self.slot(id)?.status())
    }

    /// All entries, ordered by id.
    pub fn entries(&self) -> Vec<ScheduleStatus> {
        let mut entries: Vec<ScheduleStatus> = self.slots.iter().map(|s| s.value().status()).collect();
        entries.sort_by(|a, b| a.entry.id.cmp(&b.entry.id));
        entries
    }

    /// Next fire time of every enabled entry that is not currently running.
    pub fn next_fire_times(&self) -> HashMap<String, DateTime<Utc>> {
        self.entries()
            .into_iter()
            .filter_map(|s| s.next_fire.map(|at| (s.entry.id, at)))
            .collect()
    }

    pub fn next_run(&self) -> Option<NextRun> {
        self.next_fire_times()
            .into_iter()
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
            .map(|(schedule_id, at)| NextRun { schedule_id, at })
    }

    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let slots: Vec<Arc<Slot>> = self.slots.iter().map(|s| Arc::clone(s.value())).collect();
        info!(schedules = slots.len(), "Scheduler started");
        for slot in slots {
            self.spawn_loop(slot);
        }
    }

    fn spawn_loop(&self, slot: Arc<Slot>) {
        let manager = Arc::clone(&self.manager);
        let runs = self.runs.clone();
        let run_token = self.run_token.clone();
        self.loops.spawn(schedule_loop(slot, manager, runs, run_token));
    }

    /// Stop all loops, give running backups `grace` to finish, then cancel them.
    pub async fn shutdown(&self, grace: Duration) {
        self.root.cancel();
        self.runs.close();
        if tokio::time::timeout(grace, self.runs.wait()).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "Scheduled backups still running, cancelling");
            self.run_token.cancel();
            self.runs.wait().await;
        }
        self.loops.close();
        self.loops.wait().await;
        info!("Scheduler stopped");
    }
}

async fn nap(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn schedule_loop(
    slot: Arc<Slot>,
    manager: Arc<BackupManager>,
    runs: TaskTracker,
    run_token: CancellationToken,
) {
    let mut armed: Option<DateTime<Utc>> = None;

    loop {
        if armed.is_none() {
            let entry = slot.entry();
            armed = if entry.enabled {
                next_fire_utc(&entry.cadence)
            } else {
                None
            };
            slot.set_next_fire(armed);
            debug!(schedule_id = %entry.id, next_fire = ?armed, "Schedule armed");
        }

        let wait = armed.map(|at| (at - Utc::now()).to_std().unwrap_or_default().min(MAX_NAP));
        let fire = tokio::select! {
            _ = slot.cancel.cancelled() => break,
            _ = slot.wake.notified() => {
                if slot.trigger.swap(false, Ordering::SeqCst) {
                    true
                } else {
                    // Entry changed; re-arm from scratch.
                    armed = None;
                    false
                }
            }
            _ = nap(wait) => armed.map(|at| Utc::now() >= at).unwrap_or(false),
        };
        if !fire {
            continue;
        }

        slot.set_next_fire(None);
        slot.running.store(true, Ordering::SeqCst);
        let entry = slot.entry();
        let run = runs.spawn(run_scheduled(entry, Arc::clone(&manager), run_token.clone()));
        if let Err(e) = run.await {
            warn!(error = %e, "Scheduled run task panicked");
        }
        slot.running.store(false, Ordering::SeqCst);
        *slot.last_run.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        armed = None;
    }

    slot.set_next_fire(None);
}

/// One scheduled backup. Failures are logged, never propagated.
async fn run_scheduled(entry: ScheduleEntry, manager: Arc<BackupManager>, cancel: CancellationToken) {
    let description = if entry.description.is_empty() {
        format!("Scheduled backup ({})", entry.id)
    } else {
        entry.description.clone()
    };
    let request = CreateRequest {
        schedule_id: Some(entry.id.clone()),
        ..CreateRequest::new(description, entry.backup_type)
    };

    match manager.create_backup(request, &cancel).await {
        Ok(outcome) => info!(
            schedule_id = %entry.id,
            filename = %outcome.metadata.filename,
            "Scheduled backup finished"
        ),
        Err(e) => warn!(schedule_id = %entry.id, error = %e, "Scheduled backup failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metadata::SortKey;
    use crate::testing::FakeDatabase;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<FakeDatabase>, Arc<BackupManager>, Scheduler) {
        let mut config = Config::default();
        config.backup.dir = dir.path().to_path_buf();
        config.backup.retry_wait = Duration::from_millis(5);
        let db = Arc::new(FakeDatabase::default());
        let manager = Arc::new(BackupManager::new(&config, db.clone(), db.clone()));
        let scheduler = Scheduler::new(Arc::clone(&manager));
        (db, manager, scheduler)
    }

    fn daily(id: &str) -> ScheduleEntry {
        ScheduleEntry::new(id, "daily 03:00".parse().unwrap())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_add_remove_and_unique_ids() {
        let dir = TempDir::new().unwrap();
        let (_db, _manager, scheduler) = setup(&dir);

        assert_eq!(scheduler.add_schedule(daily("a")).unwrap(), "a");
        assert!(matches!(
            scheduler.add_schedule(daily("a")),
            Err(BackupError::ScheduleExists(_))
        ));

        let generated = scheduler.add_schedule(daily("")).unwrap();
        assert!(!generated.is_empty());
        assert_eq!(scheduler.entries().len(), 2);

        scheduler.remove_schedule("a").unwrap();
        assert!(matches!(
            scheduler.remove_schedule("a"),
            Err(BackupError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_next_fire_times_skip_disabled() {
        let dir = TempDir::new().unwrap();
        let (_db, _manager, scheduler) = setup(&dir);
        for entry in default_schedules(NaiveTime::from_hms_opt(3, 0, 0).unwrap()) {
            scheduler.add_schedule(entry).unwrap();
        }
        scheduler.set_enabled("weekly", false).unwrap();

        let times = scheduler.next_fire_times();
        assert!(times.contains_key("daily"));
        assert!(times.contains_key("monthly"));
        assert!(!times.contains_key("weekly"));
        assert!(times.values().all(|at| *at > Utc::now()));

        let next = scheduler.next_run().unwrap();
        assert_eq!(Some(&next.at), times.values().min());
    }

    #[tokio::test]
    async fn test_runs_of_one_schedule_never_overlap() {
        let dir = TempDir::new().unwrap();
        let (db, manager, scheduler) = setup(&dir);
        db.set_delay(Duration::from_millis(200));
        scheduler.add_schedule(daily("nightly")).unwrap();
        scheduler.start();

        scheduler.trigger("nightly").unwrap();
        wait_until(|| scheduler.get("nightly").unwrap().running).await;
        scheduler.trigger("nightly").unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(db.dump_calls(), 1);
        assert!(scheduler.next_fire_times().get("nightly").is_none());

        wait_until(|| manager.history().counts().succeeded == 2).await;
        assert_eq!(db.dump_calls(), 2);
        scheduler.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_remove_does_not_abort_run_in_flight() {
        let dir = TempDir::new().unwrap();
        let (db, manager, scheduler) = setup(&dir);
        db.set_delay(Duration::from_millis(200));
        scheduler.add_schedule(daily("nightly")).unwrap();
        scheduler.start();

        scheduler.trigger("nightly").unwrap();
        wait_until(|| db.dump_calls() == 1).await;
        scheduler.remove_schedule("nightly").unwrap();

        wait_until(|| manager.history().counts().total == 1).await;
        assert_eq!(manager.history().counts().succeeded, 1);
        scheduler.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_simultaneous_schedules_both_record() {
        let dir = TempDir::new().unwrap();
        let (_db, manager, scheduler) = setup(&dir);
        scheduler.add_schedule(daily("first")).unwrap();
        scheduler.add_schedule(daily("second")).unwrap();
        scheduler.start();

        scheduler.trigger("first").unwrap();
        scheduler.trigger("second").unwrap();
        wait_until(|| manager.history().counts().succeeded == 2).await;

        let records = manager.list_backups(SortKey::Name, None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_ne!(records[0].filename, records[1].filename);
        for record in &records {
            let path = manager.store().artifact_path(&record.filename);
            assert!(crate::checksum::verify(&path, &record.checksum).await.unwrap());
        }
        scheduler.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_failures_are_contained() {
        let dir = TempDir::new().unwrap();
        let (db, manager, scheduler) = setup(&dir);
        db.set_broken(true);
        scheduler.add_schedule(daily("nightly")).unwrap();
        scheduler.start();

        scheduler.trigger("nightly").unwrap();
        wait_until(|| manager.history().counts().failed == 1).await;

        db.set_broken(false);
        scheduler.trigger("nightly").unwrap();
        wait_until(|| manager.history().counts().succeeded == 1).await;
        scheduler.shutdown(Duration::from_secs(5)).await;
    }
}
