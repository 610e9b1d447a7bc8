//! Timer scheduling behind a trait, so reconnect back-off, debounced writes and
//! periodic sweeps can run on tokio in production and on a virtual clock in tests.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type OnceTask = Box<dyn FnOnce() -> TaskFuture + Send + 'static>;
pub type RepeatingTask = Arc<dyn Fn() -> TaskFuture + Send + Sync + 'static>;

/// Wrap an async closure as a single-shot task.
pub fn once<F, Fut>(f: F) -> OnceTask
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// Wrap an async closure as a repeating task.
pub fn repeating<F, Fut>(f: F) -> RepeatingTask
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Handle to a scheduled timer. Cancelling is idempotent.
#[derive(Clone, Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub trait Scheduler: Send + Sync {
    fn schedule_once(&self, delay: Duration, task: OnceTask) -> TimerHandle;
    fn schedule_repeating(&self, period: Duration, task: RepeatingTask) -> TimerHandle;
}

/// Production scheduler: one tokio task per timer. Must be used inside a runtime.
#[derive(Clone, Debug, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, task: OnceTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let token = handle.token.clone();
        tokio::spawn(async move {
            tokio::select! {
              _ = token.cancelled() => {}
              _ = sleep(delay) => {
                if !token.is_cancelled() {
                  task().await;
                }
              }
            }
        });
        handle
    }

    fn schedule_repeating(&self, period: Duration, task: RepeatingTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let token = handle.token.clone();
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                  _ = token.cancelled() => break,
                  _ = tick.tick() => {
                    task().await;
                  }
                }
            }
        });
        handle
    }
}

enum ManualTask {
    Once(OnceTask),
    Repeating { period: Duration, task: RepeatingTask },
}

struct ManualTimer {
    seq: u64,
    due: Duration,
    token: CancellationToken,
    task: ManualTask,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    timers: Vec<ManualTimer>,
}

/// Virtual-time scheduler. Nothing runs until [`ManualScheduler::advance`] is awaited.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation.
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of armed (not cancelled) timers.
    pub fn pending(&self) -> usize {
        self.lock()
            .timers
            .iter()
            .filter(|t| !t.token.is_cancelled())
            .count()
    }

    /// Move the clock forward, running every timer that falls due in deadline order.
    /// Timers armed by running tasks are honoured if they fall inside the window.
    pub async fn advance(&self, by: Duration) {
        let target = self.lock().now + by;

        loop {
            let runnable = {
                let mut st = self.lock();
                st.timers.retain(|t| !t.token.is_cancelled());

                let next = st
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(_, t)| (t.due, t.seq))
                    .map(|(idx, _)| idx);
                let Some(idx) = next else {
                    break;
                };

                let due = st.timers[idx].due;
                st.now = st.now.max(due);

                if matches!(st.timers[idx].task, ManualTask::Once(_)) {
                    let timer = st.timers.swap_remove(idx);
                    match timer.task {
                        ManualTask::Once(task) => Runnable::Once(task),
                        ManualTask::Repeating { task, .. } => Runnable::Repeating(task),
                    }
                } else {
                    let seq = st.next_seq;
                    st.next_seq += 1;
                    let timer = &mut st.timers[idx];
                    timer.seq = seq;
                    match &timer.task {
                        ManualTask::Repeating { period, task } => {
                            let task = task.clone();
                            timer.due = due + *period;
                            Runnable::Repeating(task)
                        }
                        ManualTask::Once(_) => continue,
                    }
                }
            };

            match runnable {
                Runnable::Once(task) => task().await,
                Runnable::Repeating(task) => task().await,
            }
        }

        self.lock().now = target;
    }

    fn arm(&self, delay: Duration, task: ManualTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut st = self.lock();
        let seq = st.next_seq;
        st.next_seq += 1;
        let due = st.now + delay;
        st.timers.push(ManualTimer {
            seq,
            due,
            token: handle.token.clone(),
            task,
        });
        handle
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Runnable {
    Once(OnceTask),
    Repeating(RepeatingTask),
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, task: OnceTask) -> TimerHandle {
        self.arm(delay, ManualTask::Once(task))
    }

    fn schedule_repeating(&self, period: Duration, task: RepeatingTask) -> TimerHandle {
        let period = period.max(Duration::from_millis(1));
        self.arm(period, ManualTask::Repeating { period, task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_task(counter: &Arc<AtomicUsize>) -> OnceTask {
        let counter = counter.clone();
        once(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn manual_once_fires_only_after_delay() {
        let sched = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        sched.schedule_once(Duration::from_secs(2), counter_task(&hits));

        sched.advance(Duration::from_millis(1999)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        sched.advance(Duration::from_millis(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sched.pending(), 0);
    }

    #[tokio::test]
    async fn manual_cancelled_timer_never_fires() {
        let sched = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = sched.schedule_once(Duration::from_secs(1), counter_task(&hits));
        handle.cancel();

        sched.advance(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn manual_repeating_fires_each_period() {
        let sched = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = sched.schedule_repeating(
            Duration::from_secs(10),
            repeating(move || {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        sched.advance(Duration::from_secs(35)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        handle.cancel();
        sched.advance(Duration::from_secs(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn manual_runs_in_deadline_order() {
        let sched = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, secs) in [("late", 3u64), ("early", 1), ("mid", 2)] {
            let order = order.clone();
            sched.schedule_once(
                Duration::from_secs(secs),
                once(move || async move {
                    order.lock().unwrap().push(label);
                }),
            );
        }

        sched.advance(Duration::from_secs(3)).await;
        assert_eq!(*order.lock().unwrap(), vec!["early", "mid", "late"]);
        assert_eq!(sched.now(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_fires_unless_cancelled() {
        let sched = TokioScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));
        sched.schedule_once(Duration::from_millis(20), counter_task(&fired));
        let handle = sched.schedule_once(Duration::from_millis(20), counter_task(&cancelled));
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }
}
