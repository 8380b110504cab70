use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Timer-driven jobs on tokio tasks. Each job invocation is awaited before
/// the next one is scheduled; a panicking invocation is logged and the job
/// keeps its schedule.
#[derive(Default)]
pub struct Scheduler {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_once<F, Fut>(&self, name: &'static str, delay: Duration, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!("Scheduling {} in {:?}", name, delay);
        self.track(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            run_guarded(name, job()).await;
        }));
    }

    pub fn run_repeating<F, Fut>(&self, name: &'static str, first: Duration, interval: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!(
            "Scheduling {} every {:?}, first run in {:?}",
            name, interval, first
        );
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                run_guarded(name, job()).await;
            }
        }));
    }

    /// Run every day at `at`, local time.
    pub fn run_daily<F, Fut>(&self, name: &'static str, at: NaiveTime, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!("Scheduling {} daily at {}", name, at);
        self.track(tokio::spawn(async move {
            loop {
                let now = Local::now();
                let Some(next) = next_daily_run(&now, at) else {
                    error!("No valid run time for {} at {}", name, at);
                    return;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                debug!("{} next run at {} (in {:?})", name, next, wait);
                tokio::time::sleep(wait).await;
                run_guarded(name, job()).await;
            }
        }));
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    pub fn shutdown(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.handles.lock().push(handle);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_guarded<Fut>(name: &'static str, job: Fut)
where
    Fut: Future<Output = ()> + Send,
{
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        error!("Scheduled job {} panicked", name);
    }
}

/// First occurrence of `at` strictly after `now`. Days where `at` falls in a
/// DST gap are skipped.
pub fn next_daily_run<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let today = now.date_naive();
    (0..3u64).find_map(|offset| {
        let day = today.checked_add_days(Days::new(offset))?;
        let candidate = tz.from_local_datetime(&day.and_time(at)).earliest()?;
        (candidate > *now).then_some(candidate)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn next_run_later_today() {
        let at = NaiveTime::from_hms_opt(2, 30, 0).unwrap();
        assert_eq!(
            next_daily_run(&utc(2024, 5, 1, 1, 0), at),
            Some(utc(2024, 5, 1, 2, 30))
        );
    }

    #[test]
    fn next_run_rolls_to_tomorrow() {
        let at = NaiveTime::from_hms_opt(2, 30, 0).unwrap();
        assert_eq!(
            next_daily_run(&utc(2024, 5, 1, 2, 30), at),
            Some(utc(2024, 5, 2, 2, 30))
        );
        assert_eq!(
            next_daily_run(&utc(2024, 12, 31, 23, 0), at),
            Some(utc(2025, 1, 1, 2, 30))
        );
    }

    #[tokio::test]
    async fn run_once_fires_after_delay() {
        let scheduler = Scheduler::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.run_once("probe", Duration::from_millis(10), move || async move {
            let _ = tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test]
    async fn repeating_job_survives_a_panic() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler.run_repeating("flaky", Duration::ZERO, Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while runs.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        scheduler.shutdown();
        assert!(scheduler.is_empty());
    }
}
