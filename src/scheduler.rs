use chrono::{DateTime, Days, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::TriggerError;
use crate::layers::DateWindow;
use crate::pipeline::Pipeline;
use crate::run::{RunHistory, RunRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Clock the daily trigger time and the default window are read in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScheduleZone {
    #[default]
    Utc,
    Local,
}

impl FromStr for ScheduleZone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utc" => Ok(Self::Utc),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown timezone {:?}", other)),
        }
    }
}

impl ScheduleZone {
    pub fn today(self) -> NaiveDate {
        match self {
            Self::Utc => Utc::now().date_naive(),
            Self::Local => Local::now().date_naive(),
        }
    }

    fn until_next(self, at: NaiveTime) -> Option<(Duration, String)> {
        match self {
            Self::Utc => until_next(at, &Utc::now()),
            Self::Local => until_next(at, &Local::now()),
        }
    }
}

/// When and over which window the daily loop fires.
#[derive(Debug, Clone, Copy)]
pub struct DailySchedule {
    pub at: NaiveTime,
    pub days_back: u32,
    pub zone: ScheduleZone,
    /// Also run once for the default window before waiting for the first slot.
    pub run_immediately: bool,
}

/// Drives pipeline runs, at most one at a time.
pub struct RunScheduler {
    pipeline: Arc<Pipeline>,
    history: Option<RunHistory>,
    state: Mutex<SchedulerState>,
    running: AtomicBool,
    last_run: Mutex<Option<RunRecord>>,
    shutdown: watch::Sender<bool>,
}

/// Holds the run-lock; dropping it releases the lock and returns to idle.
struct RunGuard<'a> {
    scheduler: &'a RunScheduler,
}

impl<'a> RunGuard<'a> {
    fn acquire(scheduler: &'a RunScheduler) -> Option<Self> {
        scheduler
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { scheduler })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.set_state(SchedulerState::Idle);
        self.scheduler.running.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunScheduler {
    pub fn new(pipeline: Arc<Pipeline>, history: Option<RunHistory>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pipeline,
            history,
            state: Mutex::new(SchedulerState::Idle),
            running: AtomicBool::new(false),
            last_run: Mutex::new(None),
            shutdown,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.state)
    }

    pub fn last_run(&self) -> Option<RunRecord> {
        lock(&self.last_run).clone()
    }

    fn set_state(&self, next: SchedulerState) {
        let mut state = lock(&self.state);
        if *state != next {
            tracing::debug!("Scheduler {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run the pipeline once for `window`. Rejected, not queued, while a run is in progress.
    pub async fn trigger(&self, window: DateWindow) -> Result<RunRecord, TriggerError> {
        if self.is_shutting_down() {
            warn!("Ignoring trigger for {}: scheduler is shutting down", window);
            return Err(TriggerError::ShuttingDown);
        }
        let Some(_guard) = RunGuard::acquire(self) else {
            warn!("Ignoring trigger for {}: a run is already in progress", window);
            return Err(TriggerError::AlreadyRunning);
        };
        self.set_state(SchedulerState::Running);

        let record = self.pipeline.run(window).await;
        self.set_state(if record.failed() {
            SchedulerState::Failed
        } else {
            SchedulerState::Completed
        });

        if let Some(history) = &self.history {
            if let Err(e) = history.append(&record).await {
                warn!("Could not append run {} to history: {}", record.run_id(), e);
            }
        }
        *lock(&self.last_run) = Some(record.clone());
        Ok(record)
    }

    /// Explicit date-range run.
    pub async fn trigger_range(&self, from: NaiveDate, to: NaiveDate) -> Result<RunRecord, TriggerError> {
        let window = DateWindow::new(from, to).ok_or(TriggerError::InvalidWindow { from, to })?;
        self.trigger(window).await
    }

    /// Fire once a day at `schedule.at` until [`RunScheduler::shutdown`].
    pub async fn run_daily(&self, schedule: DailySchedule) {
        let DailySchedule {
            at,
            days_back,
            zone,
            run_immediately,
        } = schedule;
        let mut shutdown = self.shutdown.subscribe();
        info!("Daily schedule active at {} ({:?})", at.format("%H:%M"), zone);

        if run_immediately {
            self.scheduled_run(daily_window(zone.today(), days_back)).await;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            let Some((wait, next)) = zone.until_next(at) else {
                warn!("Could not resolve next {} ({:?}), retrying in a minute", at, zone);
                tokio::time::sleep(Duration::from_secs(60)).await;
                continue;
            };
            info!("Next run at {}", next);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => continue,
            }

            self.scheduled_run(daily_window(zone.today(), days_back)).await;
        }
        info!("Daily schedule stopped");
    }

    async fn scheduled_run(&self, window: DateWindow) {
        match self.trigger(window).await {
            Ok(record) if record.failed() => warn!("Scheduled run {} failed", record.run_id()),
            Ok(_) => {}
            Err(e) => warn!("Scheduled trigger skipped: {}", e),
        }
    }

    /// Stop the daily loop, refuse new triggers and cancel the current run at its next stage.
    pub fn shutdown(&self) {
        info!("Scheduler shutting down");
        self.shutdown.send_replace(true);
        self.pipeline.cancel();
    }
}

/// Next occurrence of `at` strictly after `now`.
pub fn compute_next<Tz: TimeZone>(at: NaiveTime, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let mut day = now.date_naive();
    // a DST gap can swallow the slot on a given day
    for _ in 0..3 {
        if let Some(candidate) = day.and_time(at).and_local_timezone(tz.clone()).earliest() {
            if candidate > *now {
                return Some(candidate);
            }
        }
        day = day.succ_opt()?;
    }
    None
}

/// Wait from `now` to the next `at`, with the slot formatted for logs.
fn until_next<Tz: TimeZone>(at: NaiveTime, now: &DateTime<Tz>) -> Option<(Duration, String)>
where
    Tz::Offset: Display,
{
    let next = compute_next(at, now)?;
    let label = next.format("%Y-%m-%d %H:%M %Z").to_string();
    let wait = next.signed_duration_since(now.clone()).to_std().unwrap_or(Duration::ZERO);
    Some((wait, label))
}

/// `[today - days_back, yesterday]`.
pub fn daily_window(today: NaiveDate, days_back: u32) -> DateWindow {
    let to = today.pred_opt().unwrap_or(today);
    let from = today
        .checked_sub_days(Days::new(u64::from(days_back.max(1))))
        .unwrap_or(to);
    DateWindow { from, to }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::RetrievalError;
    use crate::layers::discovery::PaperSource;
    use crate::layers::test_support::{paper, RecordingDelay, RecordingMailer, ScriptedLlm, ScriptedSource};
    use crate::layers::PaperRecord;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn config() -> PipelineConfig {
        PipelineConfig {
            research_keywords: vec!["battery".into()],
            ..Default::default()
        }
    }

    fn scheduler(source: Arc<dyn PaperSource>, history: Option<RunHistory>) -> Arc<RunScheduler> {
        let pipeline = Pipeline::new(
            &config(),
            source,
            Arc::new(ScriptedLlm::always("Score: 5\n【中文摘要】中文。\nEnglish Abstract: English.")),
            Arc::new(RecordingDelay::default()),
            Arc::new(RecordingMailer::default()),
        );
        Arc::new(RunScheduler::new(Arc::new(pipeline), history))
    }

    fn schedule(run_immediately: bool) -> DailySchedule {
        DailySchedule {
            at: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
            days_back: 1,
            zone: ScheduleZone::Utc,
            run_immediately,
        }
    }

    fn window() -> DateWindow {
        DateWindow::single_day(NaiveDate::from_ymd_opt(2025, 3, 4).unwrap())
    }

    /// Blocks inside `search` until released.
    #[derive(Default)]
    struct GatedSource {
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PaperSource for GatedSource {
        async fn search(
            &self,
            _keyword: &str,
            _from: NaiveDate,
            _to: NaiveDate,
            _max_results: usize,
        ) -> Result<Vec<PaperRecord>, RetrievalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(vec![paper("W1", "Battery storage")])
        }
    }

    #[tokio::test]
    async fn trigger_while_running_is_rejected_without_second_execution() {
        let source = Arc::new(GatedSource::default());
        let sched = scheduler(source.clone(), None);

        let first = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.trigger(window()).await })
        };
        source.entered.notified().await;
        assert_eq!(sched.state(), SchedulerState::Running);

        let second = sched.trigger(window()).await;
        assert_eq!(second.unwrap_err(), TriggerError::AlreadyRunning);

        source.release.notify_one();
        let record = first.await.unwrap().unwrap();

        assert!(!record.failed());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sched.state(), SchedulerState::Idle);
        assert_eq!(sched.last_run().unwrap().run_id(), record.run_id());
    }

    #[tokio::test]
    async fn lock_is_released_between_runs() {
        let source = Arc::new(ScriptedSource::new().with("battery", vec![paper("W1", "Battery storage")]));
        let sched = scheduler(source.clone(), None);

        sched.trigger(window()).await.unwrap();
        sched.trigger(window()).await.unwrap();

        assert_eq!(source.calls(), 2);
        assert_eq!(sched.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn failed_run_is_returned_and_persisted() {
        let path = std::env::temp_dir().join(format!("paper-digest-sched-{}.jsonl", std::process::id()));
        let source = Arc::new(ScriptedSource::new().failing("battery"));
        let sched = scheduler(source, Some(RunHistory::new(&path)));

        let record = sched.trigger(window()).await.unwrap();

        assert!(record.failed());
        assert_eq!(sched.state(), SchedulerState::Idle);
        let saved = RunHistory::new(&path).load().await.unwrap();
        assert_eq!(saved, vec![record]);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn rejects_inverted_range() {
        let sched = scheduler(Arc::new(ScriptedSource::new()), None);
        let from = NaiveDate::from_ymd_opt(2025, 3, 5).unwrap();
        let to = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();

        let err = sched.trigger_range(from, to).await.unwrap_err();

        assert_eq!(err, TriggerError::InvalidWindow { from, to });
    }

    #[tokio::test]
    async fn shutdown_refuses_triggers_and_stops_daily_loop() {
        let source = Arc::new(ScriptedSource::new());
        let sched = scheduler(source.clone(), None);

        let daily = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.run_daily(schedule(false)).await })
        };
        tokio::task::yield_now().await;
        sched.shutdown();

        tokio::time::timeout(Duration::from_secs(5), daily)
            .await
            .expect("daily loop exits on shutdown")
            .unwrap();
        assert_eq!(sched.trigger(window()).await.unwrap_err(), TriggerError::ShuttingDown);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn immediate_run_happens_inside_the_daily_task() {
        let source = Arc::new(ScriptedSource::new().with("battery", vec![paper("W1", "Battery storage")]));
        let sched = scheduler(source.clone(), None);

        let daily = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.run_daily(schedule(true)).await })
        };
        while sched.last_run().is_none() {
            tokio::task::yield_now().await;
        }
        assert!(!daily.is_finished());
        sched.shutdown();

        tokio::time::timeout(Duration::from_secs(5), daily)
            .await
            .expect("daily loop exits on shutdown")
            .unwrap();
        assert_eq!(source.calls(), 1);
        assert!(!sched.last_run().unwrap().failed());
    }

    #[test]
    fn next_slot_is_today_or_tomorrow() {
        let at = NaiveTime::from_hms_opt(21, 0, 0).unwrap();
        let morning = Utc.with_ymd_and_hms(2025, 3, 4, 8, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2025, 3, 4, 21, 0, 0).unwrap();

        assert_eq!(
            compute_next(at, &morning),
            Some(Utc.with_ymd_and_hms(2025, 3, 4, 21, 0, 0).unwrap())
        );
        assert_eq!(
            compute_next(at, &night),
            Some(Utc.with_ymd_and_hms(2025, 3, 5, 21, 0, 0).unwrap())
        );
    }

    #[test]
    fn wait_is_measured_in_the_schedule_clock() {
        let at = NaiveTime::from_hms_opt(21, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 20, 30, 0).unwrap();

        let (wait, label) = until_next(at, &now).unwrap();

        assert_eq!(wait, Duration::from_secs(30 * 60));
        assert_eq!(label, "2025-03-04 21:00 UTC");
    }

    #[test]
    fn schedule_zone_defaults_to_utc() {
        assert_eq!(ScheduleZone::default(), ScheduleZone::Utc);
        assert_eq!("Local".parse::<ScheduleZone>(), Ok(ScheduleZone::Local));
        assert_eq!(" utc ".parse::<ScheduleZone>(), Ok(ScheduleZone::Utc));
        assert!("Europe/Berlin".parse::<ScheduleZone>().is_err());
    }

    #[test]
    fn daily_window_ends_yesterday() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();

        assert_eq!(daily_window(today, 1), DateWindow::single_day(yesterday));
        let w = daily_window(today, 3);
        assert_eq!(w.from, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
        assert_eq!(w.to, yesterday);
    }
}
