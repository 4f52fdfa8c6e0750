//! One task per monitored channel, plus a periodic poll summary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::SourceError;
use crate::poller::{ChannelPoller, TickOutcome};
use crate::targets::ChannelTarget;

/// Something the scheduler can tick on a fixed interval.
#[async_trait]
pub trait PollJob: Send + 'static {
    fn target(&self) -> &ChannelTarget;
    async fn run_tick(&mut self) -> Result<TickOutcome, SourceError>;
}

#[async_trait]
impl PollJob for ChannelPoller {
    fn target(&self) -> &ChannelTarget {
        ChannelPoller::target(self)
    }

    async fn run_tick(&mut self) -> Result<TickOutcome, SourceError> {
        self.tick().await
    }
}

/// Poll counts and durations accumulated between summary flushes.
#[derive(Debug, Default)]
pub struct PollSummary {
    polls: AtomicU64,
    elapsed_ms: AtomicU64,
}

impl PollSummary {
    pub fn record(&self, elapsed: Duration) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.elapsed_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Polls recorded since the last drain.
    pub fn pending(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    /// Take `(polls, total_elapsed_ms)` and reset both counters.
    pub fn drain(&self) -> (u64, u64) {
        (
            self.polls.swap(0, Ordering::Relaxed),
            self.elapsed_ms.swap(0, Ordering::Relaxed),
        )
    }
}

/// Handle to a running background task.
pub struct TaskHandle {
    name: String,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    fn spawn<F, Fut>(name: String, run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(stop_rx));
        Self { name, stop, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the task to exit. An in-flight tick runs to completion first.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(task = %self.name, error = %e, "Task ended abnormally");
        }
    }
}

pub struct Scheduler {
    tasks: Vec<TaskHandle>,
    summary_task: TaskHandle,
}

impl Scheduler {
    /// Spawn one task per job. Each job's first tick is staggered uniformly
    /// over `[0, interval)`.
    pub fn start<J: PollJob>(jobs: Vec<J>, interval: Duration, summary: Arc<PollSummary>) -> Self {
        let channels = jobs.len();
        let interval_ms = interval.as_millis() as u64;
        let mut rng = rand::thread_rng();

        let tasks = jobs
            .into_iter()
            .map(|job| {
                let stagger = if interval_ms == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rng.gen_range(0..interval_ms))
                };
                let summary = summary.clone();
                TaskHandle::spawn(job.target().key(), move |stop_rx| {
                    run_job(job, interval, stagger, summary, stop_rx)
                })
            })
            .collect();

        let summary_task = TaskHandle::spawn("poll-summary".to_string(), move |stop_rx| {
            run_summary(summary, interval, channels, stop_rx)
        });

        info!(channels, interval = ?interval, "Scheduler started");
        Self {
            tasks,
            summary_task,
        }
    }

    pub fn tasks(&self) -> &[TaskHandle] {
        &self.tasks
    }

    /// Stop every task and wait for them to exit.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.stop();
        }
        self.summary_task.stop();

        for task in self.tasks {
            task.join().await;
        }
        self.summary_task.join().await;
        info!("Scheduler stopped");
    }
}

async fn run_job<J: PollJob>(
    mut job: J,
    period: Duration,
    stagger: Duration,
    summary: Arc<PollSummary>,
    mut stop_rx: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = sleep(stagger) => {}
        _ = stop_rx.changed() => return,
    }

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }

        let started = Instant::now();
        let result = job.run_tick().await;
        summary.record(started.elapsed());

        let target = job.target();
        match result {
            Ok(outcome) => debug!(
                guild = %target.guild_id,
                channel = %target.channel_id,
                outcome = ?outcome,
                "Poll tick finished"
            ),
            Err(e) => error!(
                guild = %target.guild_id,
                channel = %target.channel_id,
                error = %e,
                "Poll tick failed"
            ),
        }

        if *stop_rx.borrow() {
            break;
        }
    }
}

async fn run_summary(
    summary: Arc<PollSummary>,
    period: Duration,
    channels: usize,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }

        let (polls, elapsed_ms) = summary.drain();
        if polls > 0 {
            info!(
                polls,
                channels,
                total_ms = elapsed_ms,
                avg_ms = elapsed_ms / polls,
                "Poll summary"
            );
        }
    }
}
