//! In-process backends for the demo command and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Aggregate, CourseId, CourseStats, CourseSummary, EnrollmentStatus, Hook, LessonId, QuizId,
    ScheduledTask, StudentId,
};
use crate::store::{Clock, CourseStore, StudentStore, TaskScheduler, LOCK_SENTINEL};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct Enrollment {
    student_id: StudentId,
    status: EnrollmentStatus,
    progress: f64,
    grade: Option<f64>,
}

#[derive(Debug, Default)]
struct CourseRecord {
    title: String,
    lock: Option<String>,
    aggregate: Option<Aggregate>,
    last_run: Option<DateTime<Utc>>,
    stats: Option<CourseStats>,
    enrollments: Vec<Enrollment>,
}

#[derive(Debug, Default)]
struct Catalog {
    courses: HashMap<CourseId, CourseRecord>,
    lessons: HashMap<LessonId, CourseId>,
    quizzes: HashMap<QuizId, LessonId>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Catalog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_course(&self, title: &str) -> CourseId {
        let course_id = Uuid::new_v4();
        guard(&self.inner).courses.insert(
            course_id,
            CourseRecord {
                title: title.to_string(),
                ..CourseRecord::default()
            },
        );
        course_id
    }

    /// Returns `None` when the course does not exist.
    pub fn add_lesson(&self, course_id: CourseId) -> Option<LessonId> {
        let mut catalog = guard(&self.inner);
        if !catalog.courses.contains_key(&course_id) {
            return None;
        }
        let lesson_id = Uuid::new_v4();
        catalog.lessons.insert(lesson_id, course_id);
        Some(lesson_id)
    }

    pub fn add_quiz(&self, lesson_id: LessonId) -> Option<QuizId> {
        let mut catalog = guard(&self.inner);
        if !catalog.lessons.contains_key(&lesson_id) {
            return None;
        }
        let quiz_id = Uuid::new_v4();
        catalog.quizzes.insert(quiz_id, lesson_id);
        Some(quiz_id)
    }

    pub fn enroll(
        &self,
        course_id: CourseId,
        status: EnrollmentStatus,
        progress: f64,
        grade: Option<f64>,
    ) -> Option<StudentId> {
        let mut catalog = guard(&self.inner);
        let course = catalog.courses.get_mut(&course_id)?;
        let student_id = Uuid::new_v4();
        course.enrollments.push(Enrollment {
            student_id,
            status,
            progress,
            grade,
        });
        Some(student_id)
    }

    /// Writes a raw lock value, bypassing the test-and-set.
    pub fn set_lock_value(&self, course_id: CourseId, value: Option<&str>) {
        if let Some(course) = guard(&self.inner).courses.get_mut(&course_id) {
            course.lock = value.map(str::to_string);
        }
    }

    pub fn summaries(&self) -> Vec<CourseSummary> {
        let mut summaries: Vec<CourseSummary> = guard(&self.inner)
            .courses
            .iter()
            .map(|(course_id, course)| CourseSummary {
                course_id: *course_id,
                title: course.title.clone(),
                locked: course.lock.as_deref() == Some(LOCK_SENTINEL),
                stats: course.stats.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.title.cmp(&b.title));
        summaries
    }

    fn matching<'a>(
        course: &'a CourseRecord,
        statuses: &[EnrollmentStatus],
    ) -> impl Iterator<Item = Enrollment> + 'a {
        let statuses = statuses.to_vec();
        course
            .enrollments
            .iter()
            .filter(move |enrollment| statuses.contains(&enrollment.status))
            .cloned()
    }

    fn enrollment(&self, course_id: CourseId, student_id: StudentId) -> Option<Enrollment> {
        guard(&self.inner)
            .courses
            .get(&course_id)?
            .enrollments
            .iter()
            .find(|enrollment| enrollment.student_id == student_id)
            .cloned()
    }
}

#[async_trait]
impl CourseStore for MemoryStore {
    async fn course_exists(&self, course_id: CourseId) -> Result<bool> {
        Ok(guard(&self.inner).courses.contains_key(&course_id))
    }

    async fn course_for_lesson(&self, lesson_id: LessonId) -> Result<Option<CourseId>> {
        Ok(guard(&self.inner).lessons.get(&lesson_id).copied())
    }

    async fn course_for_quiz(&self, quiz_id: QuizId) -> Result<Option<CourseId>> {
        let catalog = guard(&self.inner);
        Ok(catalog
            .quizzes
            .get(&quiz_id)
            .and_then(|lesson_id| catalog.lessons.get(lesson_id))
            .copied())
    }

    async fn lock_value(&self, course_id: CourseId) -> Result<Option<String>> {
        Ok(guard(&self.inner)
            .courses
            .get(&course_id)
            .and_then(|course| course.lock.clone()))
    }

    async fn try_lock(&self, course_id: CourseId) -> Result<bool> {
        let mut catalog = guard(&self.inner);
        let Some(course) = catalog.courses.get_mut(&course_id) else {
            return Ok(false);
        };
        if course.lock.as_deref() == Some(LOCK_SENTINEL) {
            return Ok(false);
        }
        course.lock = Some(LOCK_SENTINEL.to_string());
        Ok(true)
    }

    async fn clear_lock(&self, course_id: CourseId) -> Result<()> {
        if let Some(course) = guard(&self.inner).courses.get_mut(&course_id) {
            course.lock = None;
        }
        Ok(())
    }

    async fn load_aggregate(&self, course_id: CourseId) -> Result<Option<Aggregate>> {
        Ok(guard(&self.inner)
            .courses
            .get(&course_id)
            .and_then(|course| course.aggregate.clone()))
    }

    async fn save_aggregate(&self, course_id: CourseId, aggregate: &Aggregate) -> Result<()> {
        if let Some(course) = guard(&self.inner).courses.get_mut(&course_id) {
            course.aggregate = Some(aggregate.clone());
        }
        Ok(())
    }

    async fn clear_aggregate(&self, course_id: CourseId) -> Result<()> {
        if let Some(course) = guard(&self.inner).courses.get_mut(&course_id) {
            course.aggregate = None;
        }
        Ok(())
    }

    async fn last_run(&self, course_id: CourseId) -> Result<Option<DateTime<Utc>>> {
        Ok(guard(&self.inner)
            .courses
            .get(&course_id)
            .and_then(|course| course.last_run))
    }

    async fn set_last_run(&self, course_id: CourseId, at: DateTime<Utc>) -> Result<()> {
        if let Some(course) = guard(&self.inner).courses.get_mut(&course_id) {
            course.last_run = Some(at);
        }
        Ok(())
    }

    async fn stats(&self, course_id: CourseId) -> Result<Option<CourseStats>> {
        Ok(guard(&self.inner)
            .courses
            .get(&course_id)
            .and_then(|course| course.stats.clone()))
    }

    async fn write_stats(&self, course_id: CourseId, stats: &CourseStats) -> Result<()> {
        if let Some(course) = guard(&self.inner).courses.get_mut(&course_id) {
            course.stats = Some(stats.clone());
            course.last_run = Some(stats.last_run);
        }
        Ok(())
    }
}

#[async_trait]
impl StudentStore for MemoryStore {
    async fn count_students(
        &self,
        course_id: CourseId,
        statuses: &[EnrollmentStatus],
    ) -> Result<u64> {
        let catalog = guard(&self.inner);
        Ok(catalog
            .courses
            .get(&course_id)
            .map(|course| Self::matching(course, statuses).count() as u64)
            .unwrap_or(0))
    }

    async fn list_students(
        &self,
        course_id: CourseId,
        statuses: &[EnrollmentStatus],
        offset: u64,
        limit: u32,
    ) -> Result<Vec<StudentId>> {
        let catalog = guard(&self.inner);
        let Some(course) = catalog.courses.get(&course_id) else {
            return Ok(Vec::new());
        };
        Ok(Self::matching(course, statuses)
            .skip(offset as usize)
            .take(limit as usize)
            .map(|enrollment| enrollment.student_id)
            .collect())
    }

    async fn progress(&self, course_id: CourseId, student_id: StudentId) -> Result<f64> {
        Ok(self
            .enrollment(course_id, student_id)
            .map(|enrollment| enrollment.progress)
            .unwrap_or(0.0))
    }

    async fn grade(&self, course_id: CourseId, student_id: StudentId) -> Result<Option<f64>> {
        Ok(self
            .enrollment(course_id, student_id)
            .and_then(|enrollment| enrollment.grade))
    }
}

#[derive(Debug, Default)]
struct Queue {
    next_seq: u64,
    tasks: Vec<ScheduledTask>,
}

#[derive(Debug, Default)]
pub struct MemoryScheduler {
    inner: Mutex<Queue>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<ScheduledTask> {
        let mut tasks = guard(&self.inner).tasks.clone();
        tasks.sort_by_key(|task| (task.run_at, task.seq));
        tasks
    }
}

#[async_trait]
impl TaskScheduler for MemoryScheduler {
    async fn schedule(&self, hook: Hook, run_at: DateTime<Utc>) -> Result<()> {
        let mut queue = guard(&self.inner);
        queue.next_seq += 1;
        let seq = queue.next_seq;
        queue.tasks.push(ScheduledTask { seq, hook, run_at });
        Ok(())
    }

    async fn pending_for_course(&self, course_id: CourseId) -> Result<Vec<ScheduledTask>> {
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|task| task.hook.course_id() == course_id)
            .collect())
    }

    async fn next_dispatch(&self, course_id: CourseId) -> Result<Option<DateTime<Utc>>> {
        Ok(guard(&self.inner)
            .tasks
            .iter()
            .filter(|task| task.hook == Hook::CalculateCourseData { course_id })
            .map(|task| task.run_at)
            .min())
    }

    async fn unschedule_course(&self, course_id: CourseId) -> Result<u64> {
        let mut queue = guard(&self.inner);
        let before = queue.tasks.len();
        queue.tasks.retain(|task| task.hook.course_id() != course_id);
        Ok((before - queue.tasks.len()) as u64)
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledTask>> {
        let mut queue = guard(&self.inner);
        let mut due: Vec<ScheduledTask> = queue
            .tasks
            .iter()
            .filter(|task| task.run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|task| (task.run_at, task.seq));
        due.truncate(limit as usize);

        queue
            .tasks
            .retain(|task| !due.iter().any(|taken| taken.seq == task.seq));
        Ok(due)
    }
}

/// Clock pinned to an instant that tests can move forward.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = guard(&self.now);
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *guard(&self.now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pagination_visits_each_student_once() {
        let store = MemoryStore::new();
        let course_id = store.add_course("Pagination");
        let mut expected = Vec::new();
        for _ in 0..7 {
            expected.extend(store.enroll(course_id, EnrollmentStatus::Enrolled, 0.0, None));
        }
        store.enroll(course_id, EnrollmentStatus::Expired, 0.0, None);

        let statuses = [EnrollmentStatus::Enrolled];
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let page = store
                .list_students(course_id, &statuses, pages * 3, 3)
                .await
                .unwrap();
            pages += 1;
            let short = page.len() < 3;
            seen.extend(page);
            if short {
                break;
            }
        }

        assert_eq!(pages, 3);
        assert_eq!(seen, expected);
        assert_eq!(store.count_students(course_id, &statuses).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn try_lock_is_test_and_set() {
        let store = MemoryStore::new();
        let course_id = store.add_course("Locking");

        store.set_lock_value(course_id, Some("no"));
        assert!(store.try_lock(course_id).await.unwrap());
        assert!(!store.try_lock(course_id).await.unwrap());

        store.clear_lock(course_id).await.unwrap();
        assert!(store.try_lock(course_id).await.unwrap());
        assert!(!store.try_lock(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn quiz_resolves_through_lesson() {
        let store = MemoryStore::new();
        let course_id = store.add_course("Resolution");
        let lesson_id = store.add_lesson(course_id).unwrap();
        let quiz_id = store.add_quiz(lesson_id).unwrap();

        assert_eq!(store.course_for_lesson(lesson_id).await.unwrap(), Some(course_id));
        assert_eq!(store.course_for_quiz(quiz_id).await.unwrap(), Some(course_id));
        assert_eq!(store.course_for_quiz(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn take_due_is_fifo_and_leaves_future_tasks() {
        let scheduler = MemoryScheduler::new();
        let now = Utc::now();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let later = Uuid::new_v4();

        scheduler
            .schedule(Hook::CalculateCourseData { course_id: first }, now)
            .await
            .unwrap();
        scheduler
            .schedule(Hook::CalculateCourseData { course_id: later }, now + Duration::hours(1))
            .await
            .unwrap();
        scheduler
            .schedule(Hook::CalculateCourseData { course_id: second }, now)
            .await
            .unwrap();

        let due = scheduler.take_due(now, 10).await.unwrap();
        let ids: Vec<CourseId> = due.iter().map(|task| task.hook.course_id()).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(scheduler.snapshot().len(), 1);
        assert_eq!(
            scheduler.next_dispatch(later).await.unwrap(),
            Some(now + Duration::hours(1))
        );
    }
}
