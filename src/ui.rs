//! Terminal output: job tables, state change lines and the wait spinner.
//!
//! Uses `console` for colors and `indicatif` for the spinner shown while
//! `taro wait` is blocked.

use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::api::{ControlResult, JobTail};
use crate::execution::ExecutionState;
use crate::job::JobInfo;
use crate::persistence::DisabledJob;

const COLUMNS: [&str; 6] = ["JOB ID", "INSTANCE ID", "CREATED", "EXECUTION TIME", "STATE", "STATUS"];

pub fn state_style(state: ExecutionState) -> Style {
    if state.is_failure() {
        Style::new().red().bold()
    } else if state == ExecutionState::Completed {
        Style::new().green()
    } else if state.is_executing() {
        Style::new().cyan()
    } else if state.is_terminal() {
        Style::new().yellow()
    } else {
        Style::new().dim()
    }
}

fn format_time(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|ts| ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

pub fn format_duration(duration: Option<chrono::Duration>) -> String {
    let Some(duration) = duration else {
        return String::new();
    };
    let secs = duration.num_seconds().max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

fn row(info: &JobInfo) -> [String; 6] {
    [
        info.job_id.clone(),
        info.instance_id.clone(),
        format_time(info.lifecycle.first_changed()),
        format_duration(info.lifecycle.execution_time()),
        info.state().to_string(),
        info.exec_error
            .as_ref()
            .map(|e| e.message.clone())
            .or_else(|| info.status.clone())
            .unwrap_or_default(),
    ]
}

/// Renders a plain table of jobs; widths adapt to the content.
pub fn format_jobs_table(jobs: &[JobInfo]) -> Vec<String> {
    let rows: Vec<[String; 6]> = jobs.iter().map(row).collect();
    let mut widths = COLUMNS.map(str::len);
    for r in &rows {
        for (width, cell) in widths.iter_mut().zip(r) {
            *width = (*width).max(cell.chars().count());
        }
    }
    let line = |cells: [&str; 6]| {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![line(COLUMNS)];
    for r in &rows {
        lines.push(line([&r[0], &r[1], &r[2], &r[3], &r[4], &r[5]]));
    }
    lines
}

pub fn print_jobs_table(jobs: &[JobInfo]) {
    let header = Style::new().bold();
    for (i, text) in format_jobs_table(jobs).into_iter().enumerate() {
        match i {
            0 => println!("{}", header.apply_to(text)),
            _ => println!("{}", state_style(jobs[i - 1].state()).apply_to(text)),
        }
    }
}

pub fn print_jobs_json(jobs: &[JobInfo]) {
    println!("{}", serde_json::to_string_pretty(jobs).unwrap_or_default());
}

pub fn print_control_results(results: &[ControlResult]) {
    if results.is_empty() {
        println!("{}", Style::new().yellow().apply_to("No matching instance"));
    }
    for r in results {
        println!("{} {} -> {}", r.job_id, r.instance_id, r.result);
    }
}

fn format_disabled_jobs(jobs: &[DisabledJob]) -> Vec<String> {
    let width = jobs.iter().map(|j| j.job_id.len()).max().unwrap_or(0);
    jobs.iter()
        .map(|job| {
            let kind = if job.regex { "regex" } else { "id" };
            format!("{:<width$}  {kind:<5}  {}", job.job_id, format_time(Some(job.created)))
        })
        .collect()
}

pub fn print_disabled_jobs(jobs: &[DisabledJob]) {
    for line in format_disabled_jobs(jobs) {
        println!("{line}");
    }
}

pub fn print_tail(tails: &[JobTail]) {
    let header = Style::new().bold();
    for tail in tails {
        println!("{}", header.apply_to(format!("{}@{}:", tail.job_id, tail.instance_id)));
        for line in &tail.lines {
            println!("  {line}");
        }
    }
}

pub fn format_state_change(info: &JobInfo) -> String {
    let state = info.state();
    format!(
        "{} {}@{} -> {}",
        format_time(info.lifecycle.last_changed()),
        info.job_id,
        info.instance_id,
        state_style(state).apply_to(state)
    )
}

/// Spinner shown while waiting for state changes.
pub struct WaitProgress {
    pb: ProgressBar,
}

impl WaitProgress {
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(description.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    /// Prints a state change above the spinner.
    pub fn state_changed(&self, info: &JobInfo) {
        self.pb.println(format_state_change(info));
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionLifecycle, ExecutionState};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn info(job_id: &str, status: Option<&str>) -> JobInfo {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        JobInfo {
            job_id: job_id.into(),
            instance_id: "abc".into(),
            lifecycle: ExecutionLifecycle::from_changes([
                (ExecutionState::Created, start),
                (ExecutionState::Running, start),
                (ExecutionState::Completed, start + chrono::Duration::seconds(75)),
            ]),
            status: status.map(str::to_string),
            warnings: BTreeMap::new(),
            exec_error: None,
            tracking: None,
            last_output: vec![],
        }
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(None), "");
        assert_eq!(format_duration(Some(chrono::Duration::seconds(75))), "1:15");
        assert_eq!(format_duration(Some(chrono::Duration::seconds(3725))), "1:02:05");
    }

    #[test]
    fn table_columns_align() {
        let lines = format_jobs_table(&[info("backup", Some("copying")), info("x", None)]);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("JOB ID"));
        let state_col = lines[0].find("STATE").unwrap();
        assert_eq!(&lines[1][state_col..state_col + 9], "COMPLETED");
        assert!(lines[1].ends_with("copying"));
        assert!(lines[1].contains("1:15"));
    }

    #[test]
    fn disabled_jobs_mark_patterns() {
        let jobs = [
            DisabledJob::new("backup", false).unwrap(),
            DisabledJob::new("nightly-.*", true).unwrap(),
        ];
        let lines = format_disabled_jobs(&jobs);
        assert!(lines[0].starts_with("backup      id "));
        assert!(lines[1].starts_with("nightly-.*  regex"));
    }
}
