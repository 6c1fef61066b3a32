//! Collaborator seams for the processor: course records, the student roster,
//! the host task scheduler, and wall-clock time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    Aggregate, CourseId, CourseStats, EnrollmentStatus, Hook, LessonId, QuizId, ScheduledTask,
    StudentId,
};

/// Lock flag value meaning "a job owns this course".
pub const LOCK_SENTINEL: &str = "yes";

#[async_trait]
pub trait CourseStore: Send + Sync {
    async fn course_exists(&self, course_id: CourseId) -> Result<bool>;

    async fn course_for_lesson(&self, lesson_id: LessonId) -> Result<Option<CourseId>>;

    async fn course_for_quiz(&self, quiz_id: QuizId) -> Result<Option<CourseId>>;

    /// Raw lock flag as stored, including malformed values.
    async fn lock_value(&self, course_id: CourseId) -> Result<Option<String>>;

    /// Sets the lock to [`LOCK_SENTINEL`] unless it already holds it.
    /// Returns `true` when this call took the lock.
    async fn try_lock(&self, course_id: CourseId) -> Result<bool>;

    async fn clear_lock(&self, course_id: CourseId) -> Result<()>;

    async fn load_aggregate(&self, course_id: CourseId) -> Result<Option<Aggregate>>;

    async fn save_aggregate(&self, course_id: CourseId, aggregate: &Aggregate) -> Result<()>;

    async fn clear_aggregate(&self, course_id: CourseId) -> Result<()>;

    async fn last_run(&self, course_id: CourseId) -> Result<Option<DateTime<Utc>>>;

    async fn set_last_run(&self, course_id: CourseId, at: DateTime<Utc>) -> Result<()>;

    async fn stats(&self, course_id: CourseId) -> Result<Option<CourseStats>>;

    async fn write_stats(&self, course_id: CourseId, stats: &CourseStats) -> Result<()>;
}

/// Enrolled students of a course, in a total order that is stable across pages.
#[async_trait]
pub trait StudentStore: Send + Sync {
    async fn count_students(
        &self,
        course_id: CourseId,
        statuses: &[EnrollmentStatus],
    ) -> Result<u64>;

    async fn list_students(
        &self,
        course_id: CourseId,
        statuses: &[EnrollmentStatus],
        offset: u64,
        limit: u32,
    ) -> Result<Vec<StudentId>>;

    /// Completion percentage, 0 to 100.
    async fn progress(&self, course_id: CourseId, student_id: StudentId) -> Result<f64>;

    /// Grade of the student's completed quiz, `None` if the course has no
    /// quiz or the student has not completed it.
    async fn grade(&self, course_id: CourseId, student_id: StudentId) -> Result<Option<f64>>;
}

/// Deferred execution, possibly on another worker. Delivery is at-least-once
/// and not necessarily immediate.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn schedule(&self, hook: Hook, run_at: DateTime<Utc>) -> Result<()>;

    /// Pending hooks for a course in FIFO order.
    async fn pending_for_course(&self, course_id: CourseId) -> Result<Vec<ScheduledTask>>;

    async fn next_dispatch(&self, course_id: CourseId) -> Result<Option<DateTime<Utc>>>;

    async fn unschedule_course(&self, course_id: CourseId) -> Result<u64>;

    /// Removes and returns hooks due at `now`, oldest first.
    async fn take_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledTask>>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
