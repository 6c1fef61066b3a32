use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::error::Result;
use crate::models::{Hook, ScheduledTask};
use crate::processor::CourseDataProcessor;
use crate::store::{Clock, TaskScheduler};

/// Drives queued hooks one at a time, the way a host cron would.
pub struct Worker {
    processor: Arc<CourseDataProcessor>,
    scheduler: Arc<dyn TaskScheduler>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        processor: Arc<CourseDataProcessor>,
        scheduler: Arc<dyn TaskScheduler>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            processor,
            scheduler,
            clock,
            poll_interval,
        }
    }

    /// Runs the oldest due hook, if any. Returns whether a hook was taken.
    pub async fn run_once(&self) -> Result<bool> {
        let mut due = self.scheduler.take_due(self.clock.now(), 1).await?;
        let Some(task) = due.pop() else {
            return Ok(false);
        };

        if let Err(err) = self.execute(&task).await {
            error!(hook = task.hook.name(), course_id = %task.hook.course_id(), "hook failed: {err}");
        }
        Ok(true)
    }

    /// Runs due hooks until none remain or `max_hooks` have run.
    pub async fn run_until_idle(&self, max_hooks: usize) -> Result<usize> {
        let mut ran = 0;
        while ran < max_hooks && self.run_once().await? {
            ran += 1;
        }
        Ok(ran)
    }

    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(poll_secs = self.poll_interval.as_secs(), "worker started");

        loop {
            let ran = match self.run_until_idle(usize::MAX).await {
                Ok(ran) => ran,
                Err(err) => {
                    error!("failed to take due hooks: {err}");
                    0
                }
            };
            if ran > 0 {
                info!(ran, "processed queued hooks");
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("worker stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn execute(&self, task: &ScheduledTask) -> Result<()> {
        match &task.hook {
            Hook::CalculateCourseData { course_id } => {
                self.processor.dispatch(*course_id).await?;
            }
            Hook::CourseDataBatch(args) => {
                self.processor.run_task(args).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessorConfig, ThrottlePolicy, ThrottleTier};
    use crate::log::ProcessorLog;
    use crate::memory::{FixedClock, MemoryScheduler, MemoryStore};
    use crate::models::EnrollmentStatus;
    use crate::store::{Clock, CourseStore};
    use chrono::Utc;
    use uuid::Uuid;

    fn setup(per_page: u32) -> (Arc<MemoryStore>, Arc<MemoryScheduler>, Arc<CourseDataProcessor>, Worker) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(MemoryScheduler::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let config = ProcessorConfig {
            per_page,
            processors_debug: true,
            ..ProcessorConfig::default()
        };
        let processor = Arc::new(CourseDataProcessor::new(
            &config,
            store.clone(),
            store.clone(),
            scheduler.clone(),
            clock.clone(),
            ProcessorLog::new(true),
        ));
        let worker = Worker::new(
            processor.clone(),
            scheduler.clone(),
            clock,
            Duration::from_millis(10),
        );
        (store, scheduler, processor, worker)
    }

    #[tokio::test]
    async fn trigger_runs_through_to_statistics() {
        let (store, scheduler, processor, worker) = setup(2);
        let course_id = store.add_course("End to end");
        for progress in [0.0, 50.0, 50.0, 100.0, 100.0] {
            let grade = (progress == 100.0).then_some(100.0);
            store.enroll(course_id, EnrollmentStatus::Enrolled, progress, grade);
        }

        processor
            .schedule_from_course(Uuid::new_v4(), course_id)
            .await
            .unwrap();
        // One dispatch plus three pages.
        assert_eq!(worker.run_until_idle(100).await.unwrap(), 4);

        let stats = store.stats(course_id).await.unwrap().unwrap();
        assert_eq!(stats.average_progress, 60.0);
        assert_eq!(stats.average_grade, 100.0);
        assert_eq!(stats.enrolled_students, 5);
        assert!(scheduler.snapshot().is_empty());
        assert_eq!(store.lock_value(course_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn visits_every_page_exactly_once() {
        let (store, _, processor, worker) = setup(3);
        let course_id = store.add_course("Ten students");
        for _ in 0..10 {
            store.enroll(course_id, EnrollmentStatus::Enrolled, 10.0, None);
        }

        processor.dispatch(course_id).await.unwrap();
        // ceil(10 / 3) pages.
        assert_eq!(worker.run_until_idle(100).await.unwrap(), 4);

        let stats = store.stats(course_id).await.unwrap().unwrap();
        assert_eq!(stats.enrolled_students, 10);
        assert_eq!(stats.average_progress, 10.0);
    }

    #[tokio::test]
    async fn exact_multiple_finishes_on_empty_page() {
        let (store, scheduler, processor, worker) = setup(2);
        let course_id = store.add_course("Four students");
        for _ in 0..4 {
            store.enroll(course_id, EnrollmentStatus::Enrolled, 50.0, None);
        }

        processor.dispatch(course_id).await.unwrap();
        // Two full pages, then an empty one that finalizes.
        assert_eq!(worker.run_until_idle(100).await.unwrap(), 3);

        let stats = store.stats(course_id).await.unwrap().unwrap();
        assert_eq!(stats.enrolled_students, 4);
        assert_eq!(stats.average_progress, 50.0);
        assert_eq!(store.lock_value(course_id).await.unwrap(), None);
        assert!(scheduler.snapshot().is_empty());
    }

    #[tokio::test]
    async fn long_throttle_window_does_not_spin() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(MemoryScheduler::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let config = ProcessorConfig {
            throttle: ThrottlePolicy {
                floor: 1,
                base_interval_secs: 3600,
                tiers: vec![ThrottleTier {
                    min_students: 1,
                    interval_secs: 4 * 3600,
                }],
            },
            ..ProcessorConfig::default()
        };
        let processor = Arc::new(CourseDataProcessor::new(
            &config,
            store.clone(),
            store.clone(),
            scheduler.clone(),
            clock.clone(),
            ProcessorLog::new(true),
        ));
        let worker = Worker::new(
            processor.clone(),
            scheduler.clone(),
            clock.clone(),
            Duration::from_millis(10),
        );

        let course_id = store.add_course("Long window");
        store.enroll(course_id, EnrollmentStatus::Enrolled, 10.0, None);
        store
            .set_last_run(course_id, clock.now() - chrono::Duration::hours(1))
            .await
            .unwrap();

        processor.dispatch(course_id).await.unwrap();
        clock.advance(chrono::Duration::hours(3));

        assert_eq!(worker.run_until_idle(50).await.unwrap(), 1);
        let next = scheduler.next_dispatch(course_id).await.unwrap().unwrap();
        assert!(next > clock.now());
    }

    #[tokio::test]
    async fn idle_queue_takes_nothing() {
        let (_, _, _, worker) = setup(2);
        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_, _, _, worker) = setup(2);
        worker.run(async {}).await.unwrap();
    }
}
