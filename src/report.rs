use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{CourseSummary, ScheduledTask};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSummary {
    pub hook: &'static str,
    pub count: usize,
    pub next_run: DateTime<Utc>,
}

pub fn summarize_pending(pending: &[ScheduledTask]) -> Vec<HookSummary> {
    let mut map: std::collections::HashMap<&'static str, (usize, DateTime<Utc>)> =
        std::collections::HashMap::new();

    for task in pending {
        let entry = map.entry(task.hook.name()).or_insert((0, task.run_at));
        entry.0 += 1;
        entry.1 = entry.1.min(task.run_at);
    }

    let mut summaries: Vec<HookSummary> = map
        .into_iter()
        .map(|(hook, (count, next_run))| HookSummary {
            hook,
            count,
            next_run,
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then(a.hook.cmp(b.hook)));
    summaries
}

pub fn build_report(
    generated_at: DateTime<Utc>,
    courses: &[CourseSummary],
    pending: &[ScheduledTask],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Course Data Report");
    let _ = writeln!(output, "Generated {}", generated_at.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Course Statistics");

    if courses.is_empty() {
        let _ = writeln!(output, "No courses recorded.");
    } else {
        for course in courses {
            match &course.stats {
                Some(stats) => {
                    let _ = writeln!(
                        output,
                        "- {}: {} students, avg progress {:.1}%, avg grade {:.1}% (calculated {})",
                        course.title,
                        stats.enrolled_students,
                        stats.average_progress,
                        stats.average_grade,
                        stats.last_run.format("%Y-%m-%d %H:%M")
                    );
                }
                None => {
                    let _ = writeln!(output, "- {}: not yet calculated", course.title);
                }
            }
        }
    }

    let locked: Vec<&CourseSummary> = courses.iter().filter(|course| course.locked).collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Calculations In Progress");

    if locked.is_empty() {
        let _ = writeln!(output, "No courses are locked.");
    } else {
        for course in locked {
            let _ = writeln!(output, "- {} ({})", course.title, course.course_id);
        }
    }

    let summaries = summarize_pending(pending);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Queued Work");

    if summaries.is_empty() {
        let _ = writeln!(output, "Queue is empty.");
    } else {
        for summary in summaries {
            let _ = writeln!(
                output,
                "- {}: {} queued, next at {}",
                summary.hook,
                summary.count,
                summary.next_run.format("%Y-%m-%d %H:%M")
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CourseStats, Hook, TaskArgs};
    use chrono::Duration;
    use uuid::Uuid;

    fn task(seq: u64, hook: Hook, run_at: DateTime<Utc>) -> ScheduledTask {
        ScheduledTask { seq, hook, run_at }
    }

    #[test]
    fn pending_is_grouped_by_hook() {
        let now = Utc::now();
        let course_id = Uuid::new_v4();
        let pending = vec![
            task(1, Hook::CalculateCourseData { course_id }, now + Duration::hours(2)),
            task(2, Hook::CourseDataBatch(TaskArgs::first_page(course_id, 2)), now),
            task(3, Hook::CalculateCourseData { course_id: Uuid::new_v4() }, now),
        ];

        let summaries = summarize_pending(&pending);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].hook, "calculate_course_data");
        assert_eq!(summaries[0].count, 2);
        assert_eq!(summaries[0].next_run, now);
        assert_eq!(summaries[1].hook, "course_data_batch");
    }

    #[test]
    fn report_lists_stats_and_locks() {
        let now = Utc::now();
        let courses = vec![
            CourseSummary {
                course_id: Uuid::new_v4(),
                title: "Foundations".to_string(),
                locked: false,
                stats: Some(CourseStats {
                    average_progress: 60.0,
                    average_grade: 100.0,
                    enrolled_students: 5,
                    last_run: now,
                }),
            },
            CourseSummary {
                course_id: Uuid::new_v4(),
                title: "Advanced Writing".to_string(),
                locked: true,
                stats: None,
            },
        ];

        let report = build_report(now, &courses, &[]);
        assert!(report.contains("- Foundations: 5 students, avg progress 60.0%, avg grade 100.0%"));
        assert!(report.contains("- Advanced Writing: not yet calculated"));
        assert!(report.contains("## Calculations In Progress\n- Advanced Writing"));
        assert!(report.contains("Queue is empty."));
    }

    #[test]
    fn empty_report_has_placeholders() {
        let report = build_report(Utc::now(), &[], &[]);
        assert!(report.contains("No courses recorded."));
        assert!(report.contains("No courses are locked."));
    }
}
