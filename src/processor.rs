//! Course data recalculation.
//!
//! A dispatch takes the course lock and queues page 1. Each page folds its
//! students into the course's running aggregate and queues the next page; a
//! short page finalizes the statistics and releases the lock. Pages may run
//! on different workers with arbitrary delay in between, so all state lives
//! on the course record.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::ProcessorConfig;
use crate::error::Result;
use crate::guard::CourseGuard;
use crate::log::ProcessorLog;
use crate::models::{CourseId, Hook, LessonId, QuizId, StudentId, TaskArgs};
use crate::store::{Clock, CourseStore, StudentStore, TaskScheduler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    UnknownCourse,
    /// Another job holds the course lock.
    AlreadyProcessing,
    /// Ran too recently for its size; a dispatch is queued for `retry_at`.
    Throttled { retry_at: DateTime<Utc> },
    Scheduled,
}

pub struct CourseDataProcessor {
    courses: Arc<dyn CourseStore>,
    students: Arc<dyn StudentStore>,
    scheduler: Arc<dyn TaskScheduler>,
    clock: Arc<dyn Clock>,
    guard: CourseGuard,
    log: ProcessorLog,
    per_page: u32,
}

fn message(action: &str, course_id: CourseId) -> String {
    format!("Course data calculation {action} for course {course_id}.")
}

impl CourseDataProcessor {
    pub fn new(
        config: &ProcessorConfig,
        courses: Arc<dyn CourseStore>,
        students: Arc<dyn StudentStore>,
        scheduler: Arc<dyn TaskScheduler>,
        clock: Arc<dyn Clock>,
        log: ProcessorLog,
    ) -> Self {
        let guard = CourseGuard::new(courses.clone(), clock.clone(), config.throttle.clone());
        Self {
            courses,
            students,
            scheduler,
            clock,
            guard,
            log,
            per_page: config.per_page.max(1),
        }
    }

    pub fn guard(&self) -> &CourseGuard {
        &self.guard
    }

    pub fn log(&self) -> &ProcessorLog {
        &self.log
    }

    /// Starts a recalculation unless the course is locked or was recalculated
    /// too recently for its size.
    pub async fn dispatch(&self, course_id: CourseId) -> Result<DispatchOutcome> {
        self.log.log(message("dispatched", course_id));

        if !self.courses.course_exists(course_id).await? {
            return Ok(DispatchOutcome::UnknownCourse);
        }

        self.log.log(message("triggered", course_id));

        if self.guard.is_already_processing(course_id).await? {
            self.log.log(message("throttled", course_id));
            return Ok(DispatchOutcome::AlreadyProcessing);
        }

        let first = TaskArgs::first_page(course_id, self.per_page);
        let expected = self
            .students
            .count_students(course_id, &first.statuses)
            .await?;

        if self.guard.maybe_throttle(expected, course_id).await? {
            let last_run = self.guard.last_run(course_id).await?.unwrap_or_else(|| self.clock.now());
            let now = self.clock.now();
            let mut retry_at =
                last_run + Duration::seconds(self.guard.policy().reschedule_delay_secs());
            if retry_at <= now {
                retry_at = now + Duration::seconds(self.guard.policy().base_interval_secs);
            }
            self.enqueue_dispatch(course_id, retry_at).await?;
            self.log.log(message("throttled", course_id));
            return Ok(DispatchOutcome::Throttled { retry_at });
        }

        if !self.courses.try_lock(course_id).await? {
            self.log.log(message("throttled", course_id));
            return Ok(DispatchOutcome::AlreadyProcessing);
        }

        // Leftovers from an interrupted job must not leak into this one.
        self.courses.clear_aggregate(course_id).await?;
        debug!(%course_id, expected, per_page = self.per_page, "queueing first course data page");
        self.scheduler
            .schedule(Hook::CourseDataBatch(first), self.clock.now())
            .await?;
        self.log.log(message("scheduled", course_id));

        Ok(DispatchOutcome::Scheduled)
    }

    /// Processes one page. Returns `true` once the course's students are exhausted.
    pub async fn run_task(&self, args: &TaskArgs) -> Result<bool> {
        let course_id = args.course_id;

        if args.page == 0 || args.per_page == 0 {
            warn!(%course_id, page = args.page, per_page = args.per_page, "rejecting malformed course data page");
            return Ok(true);
        }

        if !self.courses.course_exists(course_id).await? {
            warn!(%course_id, page = args.page, "course data page for unknown course");
            return Ok(true);
        }

        if !self.guard.is_already_processing(course_id).await? {
            if args.page > 1 {
                // The job this page belonged to finished or was cancelled.
                debug!(%course_id, page = args.page, "dropping orphaned course data page");
                return Ok(true);
            }
            if !self.courses.try_lock(course_id).await? {
                self.log.log(message("throttled", course_id));
                return Ok(false);
            }
        }

        let mut aggregate = self
            .courses
            .load_aggregate(course_id)
            .await?
            .unwrap_or_default();

        // Pages before the last counted one already have a processed successor.
        if args.page < aggregate.last_page {
            debug!(%course_id, page = args.page, "course data page already superseded");
            return Ok(false);
        }
        let already_counted = args.page == aggregate.last_page;

        let page = self
            .students
            .list_students(course_id, &args.statuses, args.offset(), args.per_page)
            .await?;

        if already_counted {
            debug!(%course_id, page = args.page, "course data page already counted");
        } else {
            for student_id in page.iter().copied() {
                let progress = self.students.progress(course_id, student_id).await?;
                let grade = self.students.grade(course_id, student_id).await?;
                aggregate.add_student(progress, grade);
            }
            aggregate.last_page = args.page;
            self.courses.save_aggregate(course_id, &aggregate).await?;
        }

        if page.len() < args.per_page as usize {
            let stats = aggregate.finalize(self.clock.now());
            self.courses.write_stats(course_id, &stats).await?;
            self.courses.clear_aggregate(course_id).await?;
            self.courses.clear_lock(course_id).await?;
            self.log.log(message("completed", course_id));
            return Ok(true);
        }

        let next = args.next_page();
        if already_counted && self.get_batch(course_id).await?.contains(&next) {
            return Ok(false);
        }
        self.scheduler
            .schedule(Hook::CourseDataBatch(next), self.clock.now())
            .await?;
        Ok(false)
    }

    /// Drops queued work and the lock without writing statistics.
    pub async fn cancel(&self, course_id: CourseId) -> Result<u64> {
        let removed = self.scheduler.unschedule_course(course_id).await?;
        self.courses.clear_aggregate(course_id).await?;
        self.courses.clear_lock(course_id).await?;
        self.log.log(message("cancelled", course_id));
        Ok(removed)
    }

    /// Pending batch pages for a course, in the order they will run.
    pub async fn get_batch(&self, course_id: CourseId) -> Result<Vec<TaskArgs>> {
        Ok(self
            .scheduler
            .pending_for_course(course_id)
            .await?
            .into_iter()
            .filter_map(|task| match task.hook {
                Hook::CourseDataBatch(args) => Some(args),
                Hook::CalculateCourseData { .. } => None,
            })
            .collect())
    }

    pub async fn schedule_from_course(&self, student_id: StudentId, course_id: CourseId) -> Result<bool> {
        debug!(%student_id, %course_id, "enrollment change");
        if !self.courses.course_exists(course_id).await? {
            return Ok(false);
        }
        self.schedule_calculation(course_id).await
    }

    pub async fn schedule_from_lesson(&self, student_id: StudentId, lesson_id: LessonId) -> Result<bool> {
        debug!(%student_id, %lesson_id, "lesson completion");
        match self.courses.course_for_lesson(lesson_id).await? {
            Some(course_id) => self.schedule_calculation(course_id).await,
            None => Ok(false),
        }
    }

    pub async fn schedule_from_quiz(&self, student_id: StudentId, quiz_id: QuizId) -> Result<bool> {
        debug!(%student_id, %quiz_id, "quiz submission");
        match self.courses.course_for_quiz(quiz_id).await? {
            Some(course_id) => self.schedule_calculation(course_id).await,
            None => Ok(false),
        }
    }

    /// Queues a deferred dispatch for now. At most one is pending per course.
    async fn schedule_calculation(&self, course_id: CourseId) -> Result<bool> {
        self.log.log(message("triggered", course_id));
        self.enqueue_dispatch(course_id, self.clock.now()).await
    }

    async fn enqueue_dispatch(&self, course_id: CourseId, run_at: DateTime<Utc>) -> Result<bool> {
        if self.scheduler.next_dispatch(course_id).await?.is_some() {
            return Ok(false);
        }
        self.scheduler
            .schedule(Hook::CalculateCourseData { course_id }, run_at)
            .await?;
        self.log.log(message("scheduled", course_id));
        Ok(true)
    }
}
