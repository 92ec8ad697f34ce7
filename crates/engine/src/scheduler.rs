use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dbvault_core::{BackupRecord, CancelFlag, EngineError, ScheduleDefinition, ScheduleState};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::collaborators::{Audience, Priority};
use crate::context::EngineContext;
use crate::creator::{BackupCreator, CreateOptions};
use crate::retention::RetentionManager;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

type RunningSet = Arc<Mutex<HashSet<Uuid>>>;

/// Marks a definition as running until dropped.
struct RunningGuard {
    running: RunningSet,
    id: Uuid,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    ctx: Arc<EngineContext>,
    creator: BackupCreator,
    retention: RetentionManager,
    clock: Arc<dyn Clock>,
    running: RunningSet,
    retention_days: Option<u32>,
}

impl Scheduler {
    pub fn new(ctx: Arc<EngineContext>, clock: Arc<dyn Clock>) -> Self {
        Self {
            creator: BackupCreator::new(Arc::clone(&ctx)),
            retention: RetentionManager::new(Arc::clone(&ctx)),
            ctx,
            clock,
            running: Arc::default(),
            retention_days: None,
        }
    }

    /// Age-based pruning after every loop tick.
    pub fn with_retention_days(mut self, days: Option<u32>) -> Self {
        self.retention_days = days;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    fn claim(&self, id: Uuid) -> Option<RunningGuard> {
        let inserted = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        inserted.then(|| RunningGuard {
            running: Arc::clone(&self.running),
            id,
        })
    }

    /// Starts every due definition on its own task and returns their handles.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
        let now = self.clock.now();
        let mut spawned = Vec::new();
        for mut def in self.ctx.catalog.list_schedules().await? {
            if !def.is_active {
                continue;
            }
            if def.next_run.is_none() {
                def.next_run = Some(def.next_run_after(now));
                self.ctx.catalog.update_schedule(&def).await?;
                continue;
            }
            if def.state(now, self.is_running(def.id)) != ScheduleState::Due {
                continue;
            }
            let Some(guard) = self.claim(def.id) else {
                continue;
            };
            let this = self.clone();
            spawned.push(tokio::spawn(async move {
                let id = def.id;
                if let Err(err) = this.execute(def, guard).await {
                    tracing::warn!(schedule_id = %id, error = %format!("{err:#}"), "scheduled run failed");
                }
            }));
        }
        Ok(spawned)
    }

    /// Runs a definition immediately, refusing if it is already running.
    pub async fn run_now(&self, id: Uuid) -> Result<BackupRecord> {
        let def = self
            .ctx
            .catalog
            .get_schedule(id)
            .await?
            .ok_or_else(|| EngineError::not_found("schedule", id))?;
        let guard = self
            .claim(id)
            .ok_or(EngineError::SchedulingConflict(id))?;
        self.execute(def, guard).await
    }

    async fn execute(&self, def: ScheduleDefinition, _guard: RunningGuard) -> Result<BackupRecord> {
        tracing::info!(schedule_id = %def.id, target = %def.target_id, kind = %def.kind, "scheduled backup started");
        let outcome = self
            .creator
            .create(
                &def.target_id,
                def.kind,
                CreateOptions {
                    is_scheduled: true,
                    created_by: Some("scheduler".to_owned()),
                    ..CreateOptions::default()
                },
            )
            .await;

        if outcome.is_ok() {
            if let Err(err) = self.retention.enforce(&def.target_id, def.kind).await {
                tracing::warn!(schedule_id = %def.id, error = %format!("{err:#}"), "retention failed");
            }
        }
        if let Err(err) = self.advance(def.id).await {
            tracing::warn!(schedule_id = %def.id, error = %format!("{err:#}"), "failed to advance schedule");
        }

        match &outcome {
            Ok(record) => {
                self.ctx
                    .notifier
                    .notify(
                        "Scheduled backup completed",
                        &format!("{} backup of {} saved as {}", def.kind, def.target_id, record.name),
                        Priority::Low,
                        Audience::Operators,
                    )
                    .await
            }
            Err(err) => {
                self.ctx
                    .notifier
                    .notify(
                        "Scheduled backup failed",
                        &format!("{} backup of {} failed: {err:#}", def.kind, def.target_id),
                        Priority::High,
                        Audience::Admins,
                    )
                    .await
            }
        }
        outcome
    }

    /// Records the run and moves `next_run` past now. The definition is
    /// reloaded so a toggle made during the run is kept.
    async fn advance(&self, id: Uuid) -> Result<()> {
        let Some(mut def) = self.ctx.catalog.get_schedule(id).await? else {
            return Ok(());
        };
        let now = self.clock.now();
        def.last_run = Some(now);
        def.next_run = def.is_active.then(|| def.next_run_after(now));
        self.ctx.catalog.update_schedule(&def).await
    }

    /// Ticks every `interval` until `cancel` is raised.
    pub async fn run_loop(&self, interval: Duration, cancel: CancelFlag) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if cancel.is_cancelled() {
                break;
            }
            if let Err(err) = self.tick().await {
                tracing::error!(error = %format!("{err:#}"), "scheduler tick failed");
            }
            if let Some(days) = self.retention_days {
                if let Err(err) = self.retention.prune_older_than(days).await {
                    tracing::error!(error = %format!("{err:#}"), "age-based pruning failed");
                }
            }
        }
        tracing::info!("scheduler stopped");
    }
}
