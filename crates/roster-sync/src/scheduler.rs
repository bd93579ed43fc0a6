//! Run scheduler: a single owned task that serializes triggers, keeps at most
//! one sync in flight and publishes status snapshots over a watch channel.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use roster_core::{SyncRun, SyncSettings};
use roster_storage::{RunLogStore, SettingsStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::{BackoffPolicy, Clock, SyncEngine, MAX_INTERVAL_MINUTES};

#[derive(Clone)]
pub struct SchedulerDeps {
    pub engine: Arc<SyncEngine>,
    pub logs: Arc<dyn RunLogStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub clock: Arc<dyn Clock>,
}

/// Startup defaults, used until a settings row exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub interval_minutes: u32,
    pub enabled: bool,
    pub backoff: BackoffPolicy,
    pub overlap_buffer: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
            enabled: true,
            backoff: BackoffPolicy::default(),
            overlap_buffer: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SchedulerPhase {
    #[default]
    Idle,
    Running,
    WaitingNextRun {
        at: DateTime<Utc>,
    },
    Retrying {
        attempt: u32,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub running: bool,
    pub phase: SchedulerPhase,
    pub interval_minutes: u32,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub retrying: bool,
    pub retry_count: u32,
    pub last_run: Option<SyncRun>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunNowReply {
    /// False when a run was already in flight or a recent run covered the interval.
    pub started: bool,
    pub last_run: Option<SyncRun>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReply {
    pub interval_minutes: u32,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("intervalMinutes must be a positive number no greater than {max}, got {0}", max = MAX_INTERVAL_MINUTES)]
    InvalidInterval(i64),
    #[error("failed to persist sync settings: {0}")]
    Persist(#[from] StoreError),
    #[error("sync scheduler is not running")]
    Stopped,
}

/// True when a run at `last_run_at` still covers `now`, i.e. less than
/// `interval - buffer` has elapsed since it.
pub fn overlap_covers(
    last_run_at: DateTime<Utc>,
    now: DateTime<Utc>,
    interval_minutes: u32,
    buffer: Duration,
) -> bool {
    let buffer = chrono::Duration::from_std(buffer).unwrap_or_else(|_| chrono::Duration::zero());
    let window = chrono::Duration::minutes(i64::from(interval_minutes)) - buffer;
    now - last_run_at < window
}

enum Command {
    RunNow(oneshot::Sender<RunNowReply>),
    Configure {
        interval_minutes: i64,
        enabled: bool,
        reply: oneshot::Sender<Result<ConfigReply, SchedulerError>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the scheduler task. Cheap to clone; status reads never wait on
/// a run in progress.
#[derive(Clone)]
pub struct SyncScheduler {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SyncStatus>,
}

impl SyncScheduler {
    pub async fn start(deps: SchedulerDeps, options: SchedulerOptions) -> Self {
        if let Err(err) = deps.logs.ensure_schema().await {
            warn!(error = %err, "could not prepare run log table");
        }

        let defaults = SyncSettings {
            enabled: options.enabled,
            interval_minutes: options.interval_minutes.max(1),
            updated_at: deps.clock.now(),
        };
        let settings = match deps.settings.load_or_init(&defaults).await {
            Ok(settings) => settings,
            Err(err) => {
                warn!(error = %err, "could not load sync settings; using defaults");
                defaults
            }
        };
        let last_run = match deps.logs.latest().await {
            Ok(latest) => latest.map(|entry| entry.run),
            Err(err) => {
                warn!(error = %err, "could not read last sync run");
                None
            }
        };

        let (status_tx, status_rx) = watch::channel(SyncStatus::default());
        let (command_tx, command_rx) = mpsc::channel(32);
        let mut task = SchedulerTask {
            deps,
            options,
            settings,
            last_run,
            retrying: false,
            retry_count: 0,
            next: None,
            in_flight: None,
            status: status_tx,
        };
        if task.settings.enabled {
            task.arm_interval();
        }
        task.publish();
        info!(
            enabled = task.settings.enabled,
            interval_minutes = task.settings.interval_minutes,
            "sync scheduler started"
        );
        tokio::spawn(task.run(command_rx));

        Self {
            commands: command_tx,
            status: status_rx,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Triggers a run and waits for it. Returns at once with `started: false`
    /// when a run is already in flight.
    pub async fn run_now(&self) -> Result<RunNowReply, SchedulerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::RunNow(reply))
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        response.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Persists new settings, then applies them and reschedules from now.
    pub async fn configure(
        &self,
        interval_minutes: i64,
        enabled: bool,
    ) -> Result<ConfigReply, SchedulerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Configure {
                interval_minutes,
                enabled,
                reply,
            })
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        response.await.map_err(|_| SchedulerError::Stopped)?
    }

    /// Stops the task after any in-flight run has finished and been recorded.
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply)).await.is_ok() {
            let _ = response.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Retry,
    Manual,
}

struct NextTrigger {
    deadline: Instant,
    at: DateTime<Utc>,
}

struct InFlight {
    handle: JoinHandle<SyncRun>,
    trigger: Trigger,
    reply: Option<oneshot::Sender<RunNowReply>>,
}

struct SchedulerTask {
    deps: SchedulerDeps,
    options: SchedulerOptions,
    settings: SyncSettings,
    last_run: Option<SyncRun>,
    retrying: bool,
    retry_count: u32,
    next: Option<NextTrigger>,
    in_flight: Option<InFlight>,
    status: watch::Sender<SyncStatus>,
}

impl SchedulerTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let timer = match self.in_flight {
                Some(_) => None,
                None => self.next.as_ref().map(|next| next.deadline),
            };
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::RunNow(reply)) => self.on_run_now(reply).await,
                    Some(Command::Configure { interval_minutes, enabled, reply }) => {
                        let result = self.on_configure(interval_minutes, enabled).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.drain().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.drain().await;
                        break;
                    }
                },
                () = wait_until(timer) => self.on_timer().await,
                joined = join_run(&mut self.in_flight) => self.on_run_finished(joined).await,
            }
        }
        info!("sync scheduler stopped");
    }

    async fn on_timer(&mut self) {
        self.next = None;
        if self.retrying {
            info!(attempt = self.retry_count, "retrying failed sync");
            self.start_run(Trigger::Retry, None);
            return;
        }
        if self.covered_by_recent_run().await {
            self.arm_interval();
            self.publish();
            return;
        }
        self.start_run(Trigger::Timer, None);
    }

    async fn on_run_now(&mut self, reply: oneshot::Sender<RunNowReply>) {
        if self.in_flight.is_some() {
            debug!("sync already running; manual trigger ignored");
            let _ = reply.send(self.not_started());
            return;
        }
        if !self.retrying && self.covered_by_recent_run().await {
            let _ = reply.send(self.not_started());
            return;
        }
        self.start_run(Trigger::Manual, Some(reply));
    }

    async fn on_configure(
        &mut self,
        interval_minutes: i64,
        enabled: bool,
    ) -> Result<ConfigReply, SchedulerError> {
        let interval = u32::try_from(interval_minutes)
            .ok()
            .filter(|minutes| (1..=MAX_INTERVAL_MINUTES).contains(minutes))
            .ok_or(SchedulerError::InvalidInterval(interval_minutes))?;

        let settings = SyncSettings {
            enabled,
            interval_minutes: interval,
            updated_at: self.deps.clock.now(),
        };
        self.deps.settings.save(&settings).await?;
        self.settings = settings;

        self.next = None;
        if enabled {
            self.arm_interval();
        }
        let next_run_at = self.next.as_ref().map(|next| next.at);
        info!(interval_minutes = interval, enabled, ?next_run_at, "sync settings updated");
        self.publish();
        Ok(ConfigReply {
            interval_minutes: interval,
            enabled,
            next_run_at,
        })
    }

    async fn on_run_finished(&mut self, joined: Result<SyncRun, JoinError>) {
        let Some(InFlight { trigger, reply, .. }) = self.in_flight.take() else {
            return;
        };
        let run = match joined {
            Ok(run) => run,
            Err(err) => {
                error!(error = %err, "sync task ended abnormally");
                let run = SyncRun::failed(
                    self.deps.clock.now(),
                    format!("sync task ended abnormally: {err}"),
                );
                record(self.deps.logs.as_ref(), &run).await;
                run
            }
        };

        if run.success {
            self.retrying = false;
            self.retry_count = 0;
        } else {
            self.retrying = true;
            self.retry_count = self.retry_count.saturating_add(1);
        }
        self.last_run = Some(run.clone());

        self.next = None;
        if self.settings.enabled {
            if run.success {
                self.arm_interval();
            } else {
                let delay = self.options.backoff.delay_for_retry(self.retry_count);
                warn!(
                    retry_count = self.retry_count,
                    delay_secs = delay.as_secs(),
                    "sync failed; scheduling retry"
                );
                self.arm_after(delay);
            }
        }
        info!(?trigger, run_id = %run.run_id, success = run.success, "sync run finished");
        self.publish();

        if let Some(reply) = reply {
            let _ = reply.send(RunNowReply {
                started: true,
                last_run: Some(run),
            });
        }
    }

    async fn drain(&mut self) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            info!("waiting for in-flight sync before stopping");
            let joined = (&mut in_flight.handle).await;
            self.on_run_finished(joined).await;
        }
        self.next = None;
        self.publish();
    }

    /// Overlap guard against runs by this or another instance sharing the log.
    async fn covered_by_recent_run(&self) -> bool {
        if !self.settings.enabled {
            return false;
        }
        let latest = match self.deps.logs.latest().await {
            Ok(Some(latest)) => latest,
            Ok(None) => return false,
            Err(err) => {
                warn!(error = %err, "could not read last run time; proceeding");
                return false;
            }
        };
        let now = self.deps.clock.now();
        let covered = overlap_covers(
            latest.run.timestamp,
            now,
            self.settings.interval_minutes,
            self.options.overlap_buffer,
        );
        if covered {
            info!(
                elapsed_secs = (now - latest.run.timestamp).num_seconds(),
                interval_minutes = self.settings.interval_minutes,
                "skipping sync; last run is within the interval"
            );
        }
        covered
    }

    fn start_run(&mut self, trigger: Trigger, reply: Option<oneshot::Sender<RunNowReply>>) {
        let engine = Arc::clone(&self.deps.engine);
        let logs = Arc::clone(&self.deps.logs);
        let handle = tokio::spawn(async move { execute_and_record(&engine, logs.as_ref()).await });
        self.in_flight = Some(InFlight {
            handle,
            trigger,
            reply,
        });
        info!(?trigger, "sync run started");
        self.publish();
    }

    fn not_started(&self) -> RunNowReply {
        RunNowReply {
            started: false,
            last_run: self.last_run.clone(),
        }
    }

    fn arm_interval(&mut self) {
        let minutes = u64::from(self.settings.interval_minutes.max(1));
        self.arm_after(Duration::from_secs(minutes * 60));
    }

    fn arm_after(&mut self, delay: Duration) {
        let now = self.deps.clock.now();
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(now);
        self.next = Some(NextTrigger {
            deadline: Instant::now() + delay,
            at,
        });
    }

    fn snapshot(&self) -> SyncStatus {
        let next_run_at = self.next.as_ref().map(|next| next.at);
        let phase = match (&self.in_flight, &self.next) {
            (Some(_), _) => SchedulerPhase::Running,
            (None, Some(next)) if self.retrying => SchedulerPhase::Retrying {
                attempt: self.retry_count,
                at: next.at,
            },
            (None, Some(next)) => SchedulerPhase::WaitingNextRun { at: next.at },
            (None, None) => SchedulerPhase::Idle,
        };
        SyncStatus {
            running: self.in_flight.is_some(),
            phase,
            interval_minutes: self.settings.interval_minutes,
            enabled: self.settings.enabled,
            next_run_at,
            retrying: self.retrying,
            retry_count: self.retry_count,
            last_run: self.last_run.clone(),
        }
    }

    fn publish(&self) {
        self.status.send_replace(self.snapshot());
    }
}

/// Runs the engine and records the outcome. Engine errors become failed runs;
/// a log write failure is reported but does not change the outcome.
async fn execute_and_record(engine: &SyncEngine, logs: &dyn RunLogStore) -> SyncRun {
    let run = match engine.run_schedule_sync().await {
        Ok(run) => run,
        Err(err) => {
            error!(error = %err, "schedule sync failed");
            SyncRun::failed(engine.now(), err.to_string())
        }
    };
    record(logs, &run).await;
    run
}

async fn record(logs: &dyn RunLogStore, run: &SyncRun) {
    if let Err(err) = logs.append(run).await {
        error!(run_id = %run.run_id, error = %err, "failed to record sync run");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn join_run(in_flight: &mut Option<InFlight>) -> Result<SyncRun, JoinError> {
    match in_flight {
        Some(run) => (&mut run.handle).await,
        None => pending().await,
    }
}
