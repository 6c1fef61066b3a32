use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::ThrottlePolicy;
use crate::error::Result;
use crate::models::CourseId;
use crate::store::{Clock, CourseStore, LOCK_SENTINEL};

/// Concurrency and frequency checks consulted before a course is recalculated.
#[derive(Clone)]
pub struct CourseGuard {
    courses: Arc<dyn CourseStore>,
    clock: Arc<dyn Clock>,
    policy: ThrottlePolicy,
}

impl CourseGuard {
    pub fn new(courses: Arc<dyn CourseStore>, clock: Arc<dyn Clock>, policy: ThrottlePolicy) -> Self {
        Self {
            courses,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    /// Only the exact sentinel counts as locked; anything else reads as free.
    pub async fn is_already_processing(&self, course_id: CourseId) -> Result<bool> {
        let value = self.courses.lock_value(course_id).await?;
        Ok(value.as_deref() == Some(LOCK_SENTINEL))
    }

    pub async fn last_run(&self, course_id: CourseId) -> Result<Option<DateTime<Utc>>> {
        self.courses.last_run(course_id).await
    }

    /// Unix seconds of the last completed run, 0 when the course never ran.
    pub async fn get_last_run(&self, course_id: CourseId) -> Result<i64> {
        Ok(self
            .last_run(course_id)
            .await?
            .map(|at| at.timestamp())
            .unwrap_or(0))
    }

    pub async fn maybe_throttle(&self, expected_size: u64, course_id: CourseId) -> Result<bool> {
        let Some(interval) = self.policy.interval_for(expected_size) else {
            return Ok(false);
        };
        let Some(last_run) = self.last_run(course_id).await? else {
            return Ok(false);
        };

        let elapsed = (self.clock.now() - last_run).num_seconds();
        Ok(elapsed <= interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FixedClock, MemoryStore};
    use chrono::Duration;

    fn setup() -> (Arc<MemoryStore>, Arc<FixedClock>, CourseGuard) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let guard = CourseGuard::new(store.clone(), clock.clone(), ThrottlePolicy::default());
        (store, clock, guard)
    }

    #[tokio::test]
    async fn only_sentinel_counts_as_locked() {
        let (store, _, guard) = setup();
        let course_id = store.add_course("Lock values");

        assert!(!guard.is_already_processing(course_id).await.unwrap());

        for value in ["", "no", "unlocked", "YES"] {
            store.set_lock_value(course_id, Some(value));
            assert!(!guard.is_already_processing(course_id).await.unwrap());
        }

        store.set_lock_value(course_id, Some(LOCK_SENTINEL));
        assert!(guard.is_already_processing(course_id).await.unwrap());
    }

    #[tokio::test]
    async fn last_run_defaults_to_zero() {
        let (store, clock, guard) = setup();
        let course_id = store.add_course("Last run");
        assert_eq!(guard.get_last_run(course_id).await.unwrap(), 0);

        let now = clock.now();
        store.set_last_run(course_id, now).await.unwrap();
        assert_eq!(guard.get_last_run(course_id).await.unwrap(), now.timestamp());
    }

    #[tokio::test]
    async fn throttles_large_courses_after_recent_run() {
        let (store, clock, guard) = setup();
        let course_id = store.add_course("Throttle");

        assert!(!guard.maybe_throttle(25, course_id).await.unwrap());
        // Never ran.
        assert!(!guard.maybe_throttle(500, course_id).await.unwrap());
        assert!(!guard.maybe_throttle(2500, course_id).await.unwrap());

        store
            .set_last_run(course_id, clock.now() - Duration::hours(1))
            .await
            .unwrap();
        assert!(!guard.maybe_throttle(25, course_id).await.unwrap());
        assert!(guard.maybe_throttle(500, course_id).await.unwrap());
        assert!(guard.maybe_throttle(2500, course_id).await.unwrap());

        clock.advance(Duration::minutes(30));
        assert!(!guard.maybe_throttle(500, course_id).await.unwrap());
        assert!(guard.maybe_throttle(2500, course_id).await.unwrap());
    }
}
