use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{ProcessorError, Result};
use crate::models::{
    Aggregate, CourseId, CourseStats, CourseSummary, EnrollmentStatus, Hook, LessonId, QuizId,
    ScheduledTask, StudentId,
};
use crate::store::{CourseStore, StudentStore, TaskScheduler, LOCK_SENTINEL};

pub async fn init_db(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn status_names(statuses: &[EnrollmentStatus]) -> Vec<String> {
    statuses.iter().map(|status| status.as_str().to_string()).collect()
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| ProcessorError::Config(format!("{value} exceeds i64")))
}

async fn upsert_course(pool: &PgPool, id: Uuid, title: &str) -> Result<CourseId> {
    let course_id: Uuid = sqlx::query(
        r#"
        INSERT INTO course_data.courses (id, title)
        VALUES ($1, $2)
        ON CONFLICT (title) DO UPDATE SET title = EXCLUDED.title
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(title)
    .fetch_one(pool)
    .await?
    .try_get("id")?;
    Ok(course_id)
}

async fn upsert_student(pool: &PgPool, id: Uuid, full_name: &str, email: &str) -> Result<StudentId> {
    let student_id: Uuid = sqlx::query(
        r#"
        INSERT INTO course_data.students (id, full_name, email)
        VALUES ($1, $2, $3)
        ON CONFLICT (email) DO UPDATE SET full_name = EXCLUDED.full_name
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(full_name)
    .bind(email)
    .fetch_one(pool)
    .await?
    .try_get("id")?;
    Ok(student_id)
}

async fn upsert_enrollment(
    pool: &PgPool,
    course_id: CourseId,
    student_id: StudentId,
    status: EnrollmentStatus,
    progress: f64,
    grade: Option<f64>,
    enrolled_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO course_data.enrollments
        (course_id, student_id, status, progress, grade, enrolled_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (course_id, student_id) DO UPDATE
        SET status = EXCLUDED.status, progress = EXCLUDED.progress, grade = EXCLUDED.grade
        "#,
    )
    .bind(course_id)
    .bind(student_id)
    .bind(status.as_str())
    .bind(progress.clamp(0.0, 100.0))
    .bind(grade)
    .bind(enrolled_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Loads one course with a graded quiz and five students at varied progress.
pub async fn seed(pool: &PgPool) -> Result<CourseId> {
    let course_id = upsert_course(
        pool,
        Uuid::parse_str("7b0c2f4e-5d1a-4c83-9a6e-2f8d3b1c0e57")?,
        "Foundations of Scholarship",
    )
    .await?;

    let lesson_id = Uuid::parse_str("a1e9c7d2-3b4f-4e6a-8c5d-9f0b1a2c3d4e")?;
    sqlx::query(
        r#"
        INSERT INTO course_data.lessons (id, course_id, title)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(lesson_id)
    .bind(course_id)
    .bind("Research Habits")
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO course_data.quizzes (id, lesson_id, title)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(Uuid::parse_str("c4d5e6f7-0a1b-4c2d-9e3f-4a5b6c7d8e9f")?)
    .bind(lesson_id)
    .bind("Research Habits Check-in")
    .execute(pool)
    .await?;

    let students = vec![
        ("Avery Lee", "avery.lee@example.com", 0.0, None),
        ("Jules Moreno", "jules.moreno@example.com", 50.0, None),
        ("Kiara Patel", "kiara.patel@example.com", 50.0, None),
        ("Noor Haddad", "noor.haddad@example.com", 100.0, Some(100.0)),
        ("Sami Okafor", "sami.okafor@example.com", 100.0, Some(100.0)),
    ];

    let base = Utc::now();
    for (position, (name, email, progress, grade)) in students.into_iter().enumerate() {
        let student_id = upsert_student(pool, Uuid::new_v4(), name, email).await?;
        let enrolled_at = base + chrono::Duration::seconds(position as i64);
        upsert_enrollment(
            pool,
            course_id,
            student_id,
            EnrollmentStatus::Enrolled,
            progress,
            grade,
            enrolled_at,
        )
        .await?;
    }

    Ok(course_id)
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        course_title: String,
        full_name: String,
        email: String,
        status: EnrollmentStatus,
        progress: f64,
        grade: Option<f64>,
        enrolled_at: Option<DateTime<Utc>>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut imported = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let course_id = upsert_course(pool, Uuid::new_v4(), &row.course_title).await?;
        let student_id = upsert_student(pool, Uuid::new_v4(), &row.full_name, &row.email).await?;

        let affected = upsert_enrollment(
            pool,
            course_id,
            student_id,
            row.status,
            row.progress,
            row.grade,
            row.enrolled_at.unwrap_or_else(Utc::now),
        )
        .await?;

        if affected > 0 {
            imported += 1;
        }
    }

    Ok(imported)
}

pub async fn fetch_course_summaries(pool: &PgPool) -> Result<Vec<CourseSummary>> {
    let rows = sqlx::query(
        "SELECT id, title, calc_lock, last_run, average_progress, average_grade, enrolled_students \
         FROM course_data.courses \
         ORDER BY title",
    )
    .fetch_all(pool)
    .await?;

    let mut summaries = Vec::new();
    for row in rows {
        summaries.push(CourseSummary {
            course_id: row.try_get("id")?,
            title: row.try_get("title")?,
            locked: row.try_get::<Option<String>, _>("calc_lock")?.as_deref() == Some(LOCK_SENTINEL),
            stats: stats_from_row(&row)?,
        });
    }

    Ok(summaries)
}

pub async fn fetch_pending(pool: &PgPool) -> Result<Vec<ScheduledTask>> {
    let rows = sqlx::query(
        "SELECT seq, payload, run_at FROM course_data.scheduled_tasks ORDER BY run_at, seq",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(task_from_row).collect()
}

fn stats_from_row(row: &sqlx::postgres::PgRow) -> Result<Option<CourseStats>> {
    let enrolled: Option<i64> = row.try_get("enrolled_students")?;
    let last_run: Option<DateTime<Utc>> = row.try_get("last_run")?;

    Ok(match (enrolled, last_run) {
        (Some(enrolled), Some(last_run)) => Some(CourseStats {
            average_progress: row.try_get::<Option<f64>, _>("average_progress")?.unwrap_or(0.0),
            average_grade: row.try_get::<Option<f64>, _>("average_grade")?.unwrap_or(0.0),
            enrolled_students: u64::try_from(enrolled).unwrap_or(0),
            last_run,
        }),
        _ => None,
    })
}

fn task_from_row(row: &sqlx::postgres::PgRow) -> Result<ScheduledTask> {
    let seq: i64 = row.try_get("seq")?;
    let Json(hook): Json<Hook> = row.try_get("payload")?;
    Ok(ScheduledTask {
        seq: u64::try_from(seq).unwrap_or(0),
        hook,
        run_at: row.try_get("run_at")?,
    })
}

/// Postgres-backed course records, roster and task queue.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CourseStore for PgStore {
    async fn course_exists(&self, course_id: CourseId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS found FROM course_data.courses WHERE id = $1")
            .bind(course_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn course_for_lesson(&self, lesson_id: LessonId) -> Result<Option<CourseId>> {
        let row = sqlx::query("SELECT course_id FROM course_data.lessons WHERE id = $1")
            .bind(lesson_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("course_id")?),
            None => None,
        })
    }

    async fn course_for_quiz(&self, quiz_id: QuizId) -> Result<Option<CourseId>> {
        let row = sqlx::query(
            "SELECT l.course_id FROM course_data.quizzes q \
             JOIN course_data.lessons l ON l.id = q.lesson_id \
             WHERE q.id = $1",
        )
        .bind(quiz_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("course_id")?),
            None => None,
        })
    }

    async fn lock_value(&self, course_id: CourseId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT calc_lock FROM course_data.courses WHERE id = $1")
            .bind(course_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("calc_lock")?,
            None => None,
        })
    }

    async fn try_lock(&self, course_id: CourseId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE course_data.courses SET calc_lock = $2 \
             WHERE id = $1 AND calc_lock IS DISTINCT FROM $2",
        )
        .bind(course_id)
        .bind(LOCK_SENTINEL)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_lock(&self, course_id: CourseId) -> Result<()> {
        sqlx::query("UPDATE course_data.courses SET calc_lock = NULL WHERE id = $1")
            .bind(course_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_aggregate(&self, course_id: CourseId) -> Result<Option<Aggregate>> {
        let row = sqlx::query("SELECT calc_aggregate FROM course_data.courses WHERE id = $1")
            .bind(course_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let aggregate: Option<Json<Aggregate>> = row.try_get("calc_aggregate")?;
        Ok(aggregate.map(|Json(aggregate)| aggregate))
    }

    async fn save_aggregate(&self, course_id: CourseId, aggregate: &Aggregate) -> Result<()> {
        sqlx::query("UPDATE course_data.courses SET calc_aggregate = $2 WHERE id = $1")
            .bind(course_id)
            .bind(Json(aggregate))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_aggregate(&self, course_id: CourseId) -> Result<()> {
        sqlx::query("UPDATE course_data.courses SET calc_aggregate = NULL WHERE id = $1")
            .bind(course_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn last_run(&self, course_id: CourseId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_run FROM course_data.courses WHERE id = $1")
            .bind(course_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("last_run")?,
            None => None,
        })
    }

    async fn set_last_run(&self, course_id: CourseId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE course_data.courses SET last_run = $2 WHERE id = $1")
            .bind(course_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stats(&self, course_id: CourseId) -> Result<Option<CourseStats>> {
        let row = sqlx::query(
            "SELECT last_run, average_progress, average_grade, enrolled_students \
             FROM course_data.courses WHERE id = $1",
        )
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => stats_from_row(&row),
            None => Ok(None),
        }
    }

    async fn write_stats(&self, course_id: CourseId, stats: &CourseStats) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE course_data.courses
            SET average_progress = $2, average_grade = $3, enrolled_students = $4, last_run = $5
            WHERE id = $1
            "#,
        )
        .bind(course_id)
        .bind(stats.average_progress)
        .bind(stats.average_grade)
        .bind(to_i64(stats.enrolled_students)?)
        .bind(stats.last_run)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StudentStore for PgStore {
    async fn count_students(
        &self,
        course_id: CourseId,
        statuses: &[EnrollmentStatus],
    ) -> Result<u64> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS total FROM course_data.enrollments \
             WHERE course_id = $1 AND status = ANY($2)",
        )
        .bind(course_id)
        .bind(status_names(statuses))
        .fetch_one(&self.pool)
        .await?
        .try_get("total")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn list_students(
        &self,
        course_id: CourseId,
        statuses: &[EnrollmentStatus],
        offset: u64,
        limit: u32,
    ) -> Result<Vec<StudentId>> {
        // (enrolled_at, student_id) is a total order, so pages never overlap.
        let rows = sqlx::query(
            "SELECT student_id FROM course_data.enrollments \
             WHERE course_id = $1 AND status = ANY($2) \
             ORDER BY enrolled_at, student_id \
             OFFSET $3 LIMIT $4",
        )
        .bind(course_id)
        .bind(status_names(statuses))
        .bind(to_i64(offset)?)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut students = Vec::with_capacity(rows.len());
        for row in rows {
            students.push(row.try_get("student_id")?);
        }
        Ok(students)
    }

    async fn progress(&self, course_id: CourseId, student_id: StudentId) -> Result<f64> {
        let row = sqlx::query(
            "SELECT progress FROM course_data.enrollments WHERE course_id = $1 AND student_id = $2",
        )
        .bind(course_id)
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => row.try_get("progress")?,
            None => 0.0,
        })
    }

    async fn grade(&self, course_id: CourseId, student_id: StudentId) -> Result<Option<f64>> {
        let row = sqlx::query(
            r#"
            SELECT e.grade
            FROM course_data.enrollments e
            WHERE e.course_id = $1 AND e.student_id = $2
              AND EXISTS (
                SELECT 1 FROM course_data.quizzes q
                JOIN course_data.lessons l ON l.id = q.lesson_id
                WHERE l.course_id = e.course_id
              )
            "#,
        )
        .bind(course_id)
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => row.try_get("grade")?,
            None => None,
        })
    }
}

#[async_trait]
impl TaskScheduler for PgStore {
    async fn schedule(&self, hook: Hook, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO course_data.scheduled_tasks (hook, course_id, payload, run_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(hook.name())
        .bind(hook.course_id())
        .bind(Json(&hook))
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_for_course(&self, course_id: CourseId) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            "SELECT seq, payload, run_at FROM course_data.scheduled_tasks \
             WHERE course_id = $1 ORDER BY run_at, seq",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn next_dispatch(&self, course_id: CourseId) -> Result<Option<DateTime<Utc>>> {
        let next: Option<DateTime<Utc>> = sqlx::query(
            "SELECT MIN(run_at) AS next_run FROM course_data.scheduled_tasks \
             WHERE course_id = $1 AND hook = 'calculate_course_data'",
        )
        .bind(course_id)
        .fetch_one(&self.pool)
        .await?
        .try_get("next_run")?;
        Ok(next)
    }

    async fn unschedule_course(&self, course_id: CourseId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM course_data.scheduled_tasks WHERE course_id = $1")
            .bind(course_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledTask>> {
        // SKIP LOCKED lets several workers claim disjoint hooks.
        let rows = sqlx::query(
            r#"
            DELETE FROM course_data.scheduled_tasks
            WHERE seq IN (
                SELECT seq FROM course_data.scheduled_tasks
                WHERE run_at <= $1
                ORDER BY run_at, seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING seq, payload, run_at
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = rows
            .iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>>>()?;
        tasks.sort_by_key(|task| (task.run_at, task.seq));
        Ok(tasks)
    }
}
