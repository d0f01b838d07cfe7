//! 宿主调度器契约
//!
//! 插件只通过 [`Scheduler`] 注册周期任务；同名任务重复注册时替换旧任务。

use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// 周期任务体：每次触发返回一个新的 future。
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// 宿主调度器。
pub trait Scheduler: Send + Sync {
    fn add(&self, name: &str, cycle: Duration, job: Job);

    fn remove(&self, name: &str);
}

/// 基于 tokio 的调度器：每个任务一个循环，前一次未结束时错过的触发被跳过。
#[derive(Debug, Default)]
pub struct TokioScheduler {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Scheduler for TokioScheduler {
    fn add(&self, name: &str, cycle: Duration, job: Job) {
        let cycle = cycle.max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cycle);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                job().await;
            }
        });
        debug!(target: "devgw.plugin", job = %name, cycle_ms = cycle.as_millis() as u64, "scheduler_job_added");
        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn remove(&self, name: &str) {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
        if let Some(handle) = removed {
            handle.abort();
            debug!(target: "devgw.plugin", job = %name, "scheduler_job_removed");
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.get_mut().unwrap_or_else(|p| p.into_inner()).drain() {
            handle.abort();
        }
    }
}

/// 只记录不执行的调度器；测试里用 [`RecordingScheduler::fire`] 手动触发。
#[derive(Default)]
pub struct RecordingScheduler {
    jobs: Mutex<BTreeMap<String, (Duration, Job)>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn cycle(&self, name: &str) -> Option<Duration> {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .map(|(cycle, _)| *cycle)
    }

    /// 执行一次任务；任务不存在时返回 false。
    pub async fn fire(&self, name: &str) -> bool {
        let job = self
            .jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .map(|(_, job)| Arc::clone(job));
        match job {
            Some(job) => {
                job().await;
                true
            }
            None => false,
        }
    }
}

impl Scheduler for RecordingScheduler {
    fn add(&self, name: &str, cycle: Duration, job: Job) {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), (cycle, job));
    }

    fn remove(&self, name: &str) {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: Arc<AtomicUsize>) -> Job {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn recording_scheduler_fires_on_demand() {
        let scheduler = RecordingScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.add("avr_poll", Duration::from_secs(30), counting_job(Arc::clone(&counter)));

        assert_eq!(scheduler.cycle("avr_poll"), Some(Duration::from_secs(30)));
        assert!(scheduler.fire("avr_poll").await);
        assert!(scheduler.fire("avr_poll").await);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        scheduler.remove("avr_poll");
        assert!(!scheduler.fire("avr_poll").await);
        assert!(scheduler.names().is_empty());
    }

    #[tokio::test]
    async fn tokio_scheduler_runs_until_removed() {
        let scheduler = TokioScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.add("meter_poll", Duration::from_millis(20), counting_job(Arc::clone(&counter)));

        tokio::time::sleep(Duration::from_millis(110)).await;
        scheduler.remove("meter_poll");
        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {} times", seen);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
        assert!(scheduler.names().is_empty());
    }
}
