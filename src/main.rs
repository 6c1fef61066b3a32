use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use course_data_processor::db::{self, PgStore};
use course_data_processor::log::ProcessorLog;
use course_data_processor::memory::{MemoryScheduler, MemoryStore};
use course_data_processor::models::EnrollmentStatus;
use course_data_processor::report;
use course_data_processor::store::{Clock, SystemClock, TaskScheduler};
use course_data_processor::{CourseDataProcessor, DispatchOutcome, ProcessorConfig, Worker};

#[derive(Parser)]
#[command(name = "course-data")]
#[command(about = "Background recalculation of course progress and grade statistics", long_about = None)]
struct Cli {
    /// JSON file overriding processor defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TriggerSource {
    Course,
    Lesson,
    Quiz,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a sample course with enrolled students
    Seed,
    /// Import enrollments from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Start a recalculation for a course now
    Dispatch {
        #[arg(long)]
        course: Uuid,
    },
    /// Queue a recalculation from an enrollment, lesson or quiz event
    Trigger {
        #[arg(value_enum)]
        source: TriggerSource,
        /// Course, lesson or quiz id
        id: Uuid,
        #[arg(long)]
        student: Option<Uuid>,
    },
    /// Drop queued work and the lock for a course
    Cancel {
        #[arg(long)]
        course: Uuid,
    },
    /// Run queued hooks
    Work {
        /// Drain due hooks and exit instead of polling
        #[arg(long)]
        once: bool,
    },
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = "course-data-report.md")]
        out: PathBuf,
    },
    /// Run a full recalculation against in-memory stores
    Demo {
        #[arg(long, default_value_t = 12)]
        students: usize,
    },
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

fn pg_processor(pool: &PgPool, config: &ProcessorConfig) -> (Arc<CourseDataProcessor>, Arc<PgStore>) {
    let store = Arc::new(PgStore::new(pool.clone()));
    let processor = Arc::new(CourseDataProcessor::new(
        config,
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(SystemClock),
        ProcessorLog::new(config.processors_debug),
    ));
    (processor, store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = ProcessorConfig::load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&connect().await?).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let course_id = db::seed(&connect().await?).await?;
            println!("Seed data inserted for course {course_id}.");
        }
        Commands::Import { csv } => {
            let imported = db::import_csv(&connect().await?, &csv).await?;
            println!("Imported {imported} enrollments from {}.", csv.display());
        }
        Commands::Dispatch { course } => {
            let pool = connect().await?;
            let (processor, _) = pg_processor(&pool, &config);
            match processor.dispatch(course).await? {
                DispatchOutcome::UnknownCourse => println!("No course {course}."),
                DispatchOutcome::AlreadyProcessing => {
                    println!("Course {course} is already being calculated.")
                }
                DispatchOutcome::Throttled { retry_at } => {
                    println!("Course {course} ran recently; retry queued for {retry_at}.")
                }
                DispatchOutcome::Scheduled => println!("Calculation queued for course {course}."),
            }
        }
        Commands::Trigger {
            source,
            id,
            student,
        } => {
            let pool = connect().await?;
            let (processor, _) = pg_processor(&pool, &config);
            let student = student.unwrap_or_else(Uuid::nil);
            let queued = match source {
                TriggerSource::Course => processor.schedule_from_course(student, id).await?,
                TriggerSource::Lesson => processor.schedule_from_lesson(student, id).await?,
                TriggerSource::Quiz => processor.schedule_from_quiz(student, id).await?,
            };
            if queued {
                println!("Recalculation queued.");
            } else {
                println!("Nothing queued (unknown target or already pending).");
            }
        }
        Commands::Cancel { course } => {
            let pool = connect().await?;
            let (processor, _) = pg_processor(&pool, &config);
            let removed = processor.cancel(course).await?;
            println!("Cancelled course {course}; removed {removed} queued hooks.");
        }
        Commands::Work { once } => {
            let pool = connect().await?;
            let (processor, store) = pg_processor(&pool, &config);
            let worker = Worker::new(
                processor,
                store,
                Arc::new(SystemClock),
                Duration::from_secs(config.worker_poll_secs.max(1)),
            );
            if once {
                let ran = worker.run_until_idle(usize::MAX).await?;
                println!("Ran {ran} hooks.");
            } else {
                worker
                    .run(async {
                        if let Err(err) = tokio::signal::ctrl_c().await {
                            error!("failed to listen for ctrl-c, worker runs until killed: {err}");
                            std::future::pending::<()>().await;
                        }
                    })
                    .await?;
            }
        }
        Commands::Report { out } => {
            let pool = connect().await?;
            let courses = db::fetch_course_summaries(&pool).await?;
            let pending = db::fetch_pending(&pool).await?;
            let report = report::build_report(Utc::now(), &courses, &pending);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Demo { students } => run_demo(&config, students).await?,
    }

    Ok(())
}

async fn run_demo(config: &ProcessorConfig, students: usize) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let scheduler = Arc::new(MemoryScheduler::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let course_id = store.add_course("Demo Course");
    if let Some(lesson_id) = store.add_lesson(course_id) {
        store.add_quiz(lesson_id);
    }
    for position in 0..students {
        let progress = ((position * 37) % 101) as f64;
        let grade = (progress >= 90.0).then_some(70.0 + (position % 4) as f64 * 10.0);
        store.enroll(course_id, EnrollmentStatus::Enrolled, progress, grade);
    }

    let processor = Arc::new(CourseDataProcessor::new(
        config,
        store.clone(),
        store.clone(),
        scheduler.clone(),
        clock.clone(),
        ProcessorLog::new(true),
    ));
    let worker = Worker::new(
        processor.clone(),
        scheduler.clone() as Arc<dyn TaskScheduler>,
        clock.clone(),
        Duration::from_secs(config.worker_poll_secs.max(1)),
    );

    processor.schedule_from_course(Uuid::new_v4(), course_id).await?;
    let ran = worker.run_until_idle(usize::MAX).await?;

    for entry in processor.log().entries() {
        println!("{entry}");
    }
    println!("Ran {ran} hooks.");
    println!();
    print!("{}", report::build_report(clock.now(), &store.summaries(), &scheduler.snapshot()));

    Ok(())
}
