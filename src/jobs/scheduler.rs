//! Cron-driven job scheduling with overlap prevention.
//!
//! One timer task per scheduled job sleeps until the next fire time and
//! triggers the job. A job type never runs twice at once: a trigger that
//! finds the previous run still going is skipped and reported.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{ConfigError, JobError};
use crate::events::EventEmitter;
use crate::jobs::config::{JobConfig, JobConfigSource, JobSettings, parse_schedule};
use crate::jobs::registry::JobResult;
use crate::jobs::runner::JobRunner;

pub const SKIP_REASON_IN_PROGRESS: &str = "previous run still in progress";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Scheduled {
        job_type: String,
        cron_expression: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_run: Option<DateTime<Utc>>,
    },
    Started {
        job_count: usize,
        job_types: Vec<String>,
    },
    Skipped {
        job_type: String,
        reason: String,
    },
    JobCompleted {
        job_type: String,
        summary: String,
    },
    JobFailed {
        job_type: String,
        error: String,
    },
    Stopped,
    Reloaded {
        previous_job_count: usize,
        new_job_count: usize,
    },
}

#[derive(Default)]
struct SchedulerState {
    settings: Option<JobSettings>,
    timers: HashMap<String, JoinHandle<()>>,
    cancel: CancellationToken,
}

struct Inner {
    source: Arc<dyn JobConfigSource>,
    runner: JobRunner,
    events: EventEmitter<SchedulerEvent>,
    state: tokio::sync::Mutex<SchedulerState>,
    in_flight: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

/// Clears a job's in-flight flag however the run ends.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cheap to clone; clones share the same timers and guards.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(source: Arc<dyn JobConfigSource>, runner: JobRunner, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                runner: runner.with_timeout(config.job_timeout),
                events: EventEmitter::new(),
                state: tokio::sync::Mutex::new(SchedulerState::default()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn events(&self) -> &EventEmitter<SchedulerEvent> {
        &self.inner.events
    }

    /// Job types that currently have a timer.
    pub async fn scheduled_jobs(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut jobs: Vec<String> = state.timers.keys().cloned().collect();
        jobs.sort();
        jobs
    }

    pub fn is_in_flight(&self, job_type: &str) -> bool {
        self.flag(job_type).load(Ordering::SeqCst)
    }

    fn flag(&self, job_type: &str) -> Arc<AtomicBool> {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight
            .entry(job_type.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Load settings and arm a timer for every job whose job and schedule
    /// are both enabled. Invalid cron expressions are logged and skipped.
    /// Returns the number of jobs scheduled.
    pub async fn start(&self) -> Result<usize, ConfigError> {
        let settings = self.inner.source.load().await?;
        Ok(self.arm(settings).await)
    }

    /// Replace every timer with ones for `settings`.
    async fn arm(&self, settings: JobSettings) -> usize {
        let mut state = self.inner.state.lock().await;
        cancel_timers(&mut state);

        let cancel = CancellationToken::new();
        let mut timers = HashMap::new();
        for (job_type, config) in &settings.jobs {
            let Some(expression) = config.active_schedule() else {
                tracing::debug!(job_type = %job_type, "Job or schedule disabled, not scheduling");
                continue;
            };
            let schedule = match parse_schedule(expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    tracing::warn!(job_type = %job_type, cron = %expression, error = %e, "Invalid schedule, job not scheduled");
                    continue;
                }
            };
            let next_run = schedule.upcoming(Utc).next();
            tracing::info!(job_type = %job_type, cron = %expression, next_run = ?next_run, "Job scheduled");
            self.inner.events.emit(SchedulerEvent::Scheduled {
                job_type: job_type.clone(),
                cron_expression: expression.to_string(),
                next_run,
            });
            let timer = spawn_timer(
                Arc::downgrade(&self.inner),
                job_type.clone(),
                schedule,
                cancel.child_token(),
            );
            timers.insert(job_type.clone(), timer);
        }

        let mut job_types: Vec<String> = timers.keys().cloned().collect();
        job_types.sort();
        let job_count = job_types.len();
        state.settings = Some(settings);
        state.timers = timers;
        state.cancel = cancel;
        drop(state);

        tracing::info!(job_count, "Scheduler started");
        self.inner.events.emit(SchedulerEvent::Started { job_count, job_types });
        job_count
    }

    /// Run `job_type` now unless it is already running. `Ok(None)` means
    /// the trigger was skipped.
    pub async fn trigger_job(&self, job_type: &str) -> Result<Option<JobResult>, JobError> {
        let flag = self.flag(job_type);
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!(job_type = %job_type, "Skipping trigger, {}", SKIP_REASON_IN_PROGRESS);
            self.inner.events.emit(SchedulerEvent::Skipped {
                job_type: job_type.to_string(),
                reason: SKIP_REASON_IN_PROGRESS.to_string(),
            });
            return Ok(None);
        }
        let _guard = InFlightGuard(flag);

        let settings = self.current_settings().await?;
        let config = settings
            .jobs
            .get(job_type)
            .cloned()
            .unwrap_or_else(JobConfig::default);

        match self
            .inner
            .runner
            .run_job(job_type, &config, &settings.autonomy)
            .await
        {
            Ok(result) => {
                self.inner.events.emit(SchedulerEvent::JobCompleted {
                    job_type: job_type.to_string(),
                    summary: result.summary.clone(),
                });
                Ok(Some(result))
            }
            Err(e) => {
                self.inner.events.emit(SchedulerEvent::JobFailed {
                    job_type: job_type.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn current_settings(&self) -> Result<JobSettings, JobError> {
        if let Some(settings) = self.inner.state.lock().await.settings.clone() {
            return Ok(settings);
        }
        Ok(self.inner.source.load().await?)
    }

    /// Cancel every timer and forget the loaded settings. Running jobs
    /// finish on their own. Returns the number of timers cancelled.
    pub async fn stop(&self) -> usize {
        let cancelled = {
            let mut state = self.inner.state.lock().await;
            let count = cancel_timers(&mut state);
            state.settings = None;
            count
        };
        tracing::info!(cancelled, "Scheduler stopped");
        self.inner.events.emit(SchedulerEvent::Stopped);
        cancelled
    }

    /// Re-read the configuration and restart with it. When the new
    /// configuration cannot be loaded the current timers keep running.
    pub async fn reload(&self) -> Result<usize, ConfigError> {
        let settings = match self.inner.source.load().await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "Reload failed, keeping current schedule");
                return Err(e);
            }
        };
        let previous_job_count = self.inner.state.lock().await.timers.len();
        self.stop().await;
        let new_job_count = self.arm(settings).await;
        tracing::info!(previous_job_count, new_job_count, "Scheduler reloaded");
        self.inner.events.emit(SchedulerEvent::Reloaded {
            previous_job_count,
            new_job_count,
        });
        Ok(new_job_count)
    }
}

fn cancel_timers(state: &mut SchedulerState) -> usize {
    state.cancel.cancel();
    let count = state.timers.len();
    for (_, timer) in state.timers.drain() {
        timer.abort();
    }
    count
}

fn spawn_timer(
    inner: Weak<Inner>,
    job_type: String,
    schedule: cron::Schedule,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                tracing::info!(job_type = %job_type, "Schedule has no further fire times");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let scheduler = JobScheduler { inner };
            let job_type = job_type.clone();
            // Detached so a long run does not delay the next fire, which
            // then hits the in-flight guard.
            tokio::spawn(async move {
                let _ = scheduler.trigger_job(&job_type).await;
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::api::memory::FailPoint;
    use crate::api::{InMemoryTaskApi, JobRunStatus};
    use crate::jobs::config::{ScheduleConfig, StaticConfigSource};
    use crate::jobs::registry::{JobContext, JobHandler, JobRegistry};

    struct Slow {
        job_type: &'static str,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for Slow {
        fn job_type(&self) -> &str {
            self.job_type
        }

        async fn run(&self, _ctx: &JobContext) -> anyhow::Result<JobResult> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("handler exploded");
            }
            Ok(JobResult::summary(format!("{} done", self.job_type)))
        }
    }

    fn scheduler(
        api: Arc<InMemoryTaskApi>,
        source: Arc<StaticConfigSource>,
        handlers: Vec<Arc<dyn JobHandler>>,
    ) -> JobScheduler {
        let mut registry = JobRegistry::new();
        for handler in handlers {
            registry.register(handler);
        }
        let runner = JobRunner::new(api, Arc::new(registry), "ws", "/repo");
        JobScheduler::new(source, runner, SchedulerConfig::default())
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Yearly at midnight on Jan 1: never fires during a test.
    const RARE: &str = "0 0 1 1 *";

    #[tokio::test]
    async fn only_enabled_jobs_with_enabled_schedules_are_scheduled() {
        let mut schedule_off = JobConfig::scheduled(RARE);
        schedule_off.schedule = Some(ScheduleConfig {
            cron_expression: RARE.to_string(),
            enabled: false,
        });
        let job_off = JobConfig {
            enabled: false,
            ..JobConfig::scheduled(RARE)
        };
        let settings = JobSettings::default()
            .with_job("lint", JobConfig::scheduled(RARE))
            .with_job("docs", schedule_off)
            .with_job("tests", job_off)
            .with_job("manual", JobConfig::default())
            .with_job("broken", JobConfig::scheduled("every tuesday"));
        let source = Arc::new(StaticConfigSource::new(settings));
        let scheduler = scheduler(Arc::new(InMemoryTaskApi::new()), source, vec![]);
        let mut rx = scheduler.events().subscribe();

        assert_eq!(scheduler.start().await.unwrap(), 1);
        assert_eq!(scheduler.scheduled_jobs().await, ["lint"]);

        let events = drain(&mut rx);
        let scheduled: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::Scheduled { .. }))
            .collect();
        assert_eq!(scheduled.len(), 1);
        assert!(matches!(
            events.last(),
            Some(SchedulerEvent::Started { job_count: 1, .. })
        ));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped_once() {
        let source = Arc::new(StaticConfigSource::new(
            JobSettings::default().with_job("slow", JobConfig::default()),
        ));
        let scheduler = scheduler(
            Arc::new(InMemoryTaskApi::new()),
            source,
            vec![Arc::new(Slow {
                job_type: "slow",
                delay: Duration::from_millis(300),
                fail: false,
            })],
        );
        let mut rx = scheduler.events().subscribe();

        let (first, second) = tokio::join!(scheduler.trigger_job("slow"), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            scheduler.trigger_job("slow").await
        });
        assert!(first.unwrap().is_some());
        assert!(second.unwrap().is_none());
        assert!(!scheduler.is_in_flight("slow"));

        let skipped: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SchedulerEvent::Skipped { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].contains("in progress"));

        // Guard released: a later trigger runs again.
        assert!(scheduler.trigger_job("slow").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_job_is_reported_and_releases_guard() {
        let api = Arc::new(InMemoryTaskApi::new());
        api.set_failing(FailPoint::UpdateJobRun, true);
        let source = Arc::new(StaticConfigSource::new(
            JobSettings::default().with_job("bad", JobConfig::default()),
        ));
        let scheduler = scheduler(
            api.clone(),
            source,
            vec![Arc::new(Slow {
                job_type: "bad",
                delay: Duration::ZERO,
                fail: true,
            })],
        );
        let mut rx = scheduler.events().subscribe();

        let err = scheduler.trigger_job("bad").await.unwrap_err();
        assert!(err.to_string().contains("handler exploded"));
        assert!(!scheduler.is_in_flight("bad"));
        assert!(drain(&mut rx).iter().any(|e| matches!(e, SchedulerEvent::JobFailed { .. })));
        // The update was refused, so the record is still RUNNING.
        assert_eq!(api.job_runs()[0].status, JobRunStatus::Running);
    }

    #[tokio::test]
    async fn reload_reports_job_counts() {
        let source = Arc::new(StaticConfigSource::new(
            JobSettings::default()
                .with_job("lint", JobConfig::scheduled(RARE))
                .with_job("docs", JobConfig::scheduled(RARE)),
        ));
        let scheduler = scheduler(Arc::new(InMemoryTaskApi::new()), source.clone(), vec![]);
        assert_eq!(scheduler.start().await.unwrap(), 2);

        source.set(
            JobSettings::default()
                .with_job("lint", JobConfig::scheduled(RARE))
                .with_job(
                    "docs",
                    JobConfig {
                        enabled: false,
                        ..JobConfig::scheduled(RARE)
                    },
                ),
        );
        let mut rx = scheduler.events().subscribe();
        assert_eq!(scheduler.reload().await.unwrap(), 1);

        let events = drain(&mut rx);
        assert!(events.contains(&SchedulerEvent::Stopped));
        assert!(events.contains(&SchedulerEvent::Reloaded {
            previous_job_count: 2,
            new_job_count: 1,
        }));
        assert_eq!(scheduler.scheduled_jobs().await, ["lint"]);
        assert_eq!(scheduler.stop().await, 1);
    }

    /// Serves its settings once, then fails every later load.
    struct FailsAfterFirstLoad {
        settings: JobSettings,
        loads: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl JobConfigSource for FailsAfterFirstLoad {
        async fn load(&self) -> Result<JobSettings, ConfigError> {
            if self.loads.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(self.settings.clone())
            } else {
                Err(ConfigError::ParseError("unexpected end of file".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn failed_reload_keeps_current_timers() {
        let source = Arc::new(FailsAfterFirstLoad {
            settings: JobSettings::default().with_job("lint", JobConfig::scheduled(RARE)),
            loads: std::sync::atomic::AtomicUsize::new(0),
        });
        let runner = JobRunner::new(
            Arc::new(InMemoryTaskApi::new()),
            Arc::new(JobRegistry::new()),
            "ws",
            "/repo",
        );
        let scheduler = JobScheduler::new(source, runner, SchedulerConfig::default());
        assert_eq!(scheduler.start().await.unwrap(), 1);

        let mut rx = scheduler.events().subscribe();
        assert!(matches!(scheduler.reload().await, Err(ConfigError::ParseError(_))));
        assert_eq!(scheduler.scheduled_jobs().await, ["lint"]);
        assert!(!drain(&mut rx).contains(&SchedulerEvent::Stopped));
        assert_eq!(scheduler.stop().await, 1);
    }

    #[tokio::test]
    async fn every_second_schedule_fires() {
        let api = Arc::new(InMemoryTaskApi::new());
        let source = Arc::new(StaticConfigSource::new(
            JobSettings::default().with_job("tick", JobConfig::scheduled("* * * * * *")),
        ));
        let scheduler = scheduler(
            api.clone(),
            source,
            vec![Arc::new(Slow {
                job_type: "tick",
                delay: Duration::ZERO,
                fail: false,
            })],
        );
        let mut rx = scheduler.events().subscribe();
        scheduler.start().await.unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SchedulerEvent::JobCompleted { job_type, .. }) = rx.recv().await {
                    return job_type;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(completed, "tick");
        assert_eq!(scheduler.stop().await, 1);
        assert!(scheduler.scheduled_jobs().await.is_empty());
    }
}
