use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type CourseId = Uuid;
pub type StudentId = Uuid;
pub type LessonId = Uuid;
pub type QuizId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Enrolled,
    Expired,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Enrolled => "enrolled",
            EnrollmentStatus::Expired => "expired",
            EnrollmentStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for EnrollmentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "enrolled" => Ok(EnrollmentStatus::Enrolled),
            "expired" => Ok(EnrollmentStatus::Expired),
            "cancelled" => Ok(EnrollmentStatus::Cancelled),
            other => Err(format!("unknown enrollment status: {other}")),
        }
    }
}

/// One page of work for the batch executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub course_id: CourseId,
    pub page: u32,
    pub per_page: u32,
    pub statuses: Vec<EnrollmentStatus>,
}

impl TaskArgs {
    pub fn first_page(course_id: CourseId, per_page: u32) -> Self {
        Self {
            course_id,
            page: 1,
            per_page: per_page.max(1),
            statuses: vec![EnrollmentStatus::Enrolled],
        }
    }

    pub fn next_page(&self) -> Self {
        Self {
            page: self.page + 1,
            ..self.clone()
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.per_page)
    }
}

/// Running totals folded in page by page. Not an average until finalized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub students: u64,
    pub progress: f64,
    pub quizzes: u64,
    pub grade: f64,
    #[serde(default)]
    pub last_page: u32,
}

impl Aggregate {
    pub fn add_student(&mut self, progress: f64, grade: Option<f64>) {
        self.students += 1;
        self.progress += progress.clamp(0.0, 100.0);
        if let Some(grade) = grade {
            self.quizzes += 1;
            self.grade += grade.clamp(0.0, 100.0);
        }
    }

    pub fn finalize(&self, now: DateTime<Utc>) -> CourseStats {
        CourseStats {
            average_progress: if self.students == 0 {
                0.0
            } else {
                self.progress / self.students as f64
            },
            average_grade: if self.quizzes == 0 {
                0.0
            } else {
                self.grade / self.quizzes as f64
            },
            enrolled_students: self.students,
            last_run: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseStats {
    pub average_progress: f64,
    pub average_grade: f64,
    pub enrolled_students: u64,
    pub last_run: DateTime<Utc>,
}

/// Work the host scheduler can deliver later, possibly on another worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum Hook {
    CalculateCourseData { course_id: CourseId },
    CourseDataBatch(TaskArgs),
}

impl Hook {
    pub fn course_id(&self) -> CourseId {
        match self {
            Hook::CalculateCourseData { course_id } => *course_id,
            Hook::CourseDataBatch(args) => args.course_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Hook::CalculateCourseData { .. } => "calculate_course_data",
            Hook::CourseDataBatch(_) => "course_data_batch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub seq: u64,
    pub hook: Hook,
    pub run_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CourseSummary {
    pub course_id: CourseId,
    pub title: String,
    pub locked: bool,
    pub stats: Option<CourseStats>,
}
