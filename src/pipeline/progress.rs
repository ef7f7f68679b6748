//! Stage bookkeeping and progress derived from playbook output.
//!
//! The playbook prints one control line listing every task before it
//! starts, fields separated by `^`:
//!
//! ```text
//! ### TASKS ###^...^...^...^...^      task one\tTAGS: [x]^      task two\tTAGS: [y]
//! ```
//!
//! Later `TASK [name] ****` lines are looked up in that list to place the
//! stage's progress.

use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::info;

use super::stage::Stage;

pub const TASK_LIST_MARKER: &str = "### TASKS ###";

/// Fields before the first task in the control line.
const TASK_LIST_SKIP: usize = 5;

/// Task names from a control line, or `None` if any field is malformed.
pub fn parse_task_list(line: &str) -> Option<Vec<String>> {
    if !line.starts_with(TASK_LIST_MARKER) {
        return None;
    }
    line.split('^')
        .skip(TASK_LIST_SKIP)
        .map(|field| {
            let mut chars = field.char_indices();
            for _ in 0..6 {
                let (_, c) = chars.next()?;
                if !c.is_whitespace() {
                    return None;
                }
            }
            let rest = &field[chars.next()?.0..];
            let (name, _) = rest.split_once("\tTAGS:")?;
            Some(name.to_string())
        })
        .collect()
}

/// Name from a `TASK [name] ****` line.
pub fn parse_current_task(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("TASK [")?;
    let stars = rest.trim_end_matches('*');
    if stars.len() == rest.len() {
        return None;
    }
    stars.strip_suffix("] ")
}

#[derive(Debug, Clone)]
pub struct StageRecord {
    pub stage: Stage,
    pub started_at: OffsetDateTime,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct ProgressTracker {
    will_write: bool,
    stage: Option<Stage>,
    stage_progress: Option<f64>,
    stage_started: Option<(Instant, OffsetDateTime)>,
    tasks: Option<Vec<String>>,
    current_task: Option<String>,
    started: (Instant, OffsetDateTime),
    finished: Option<Duration>,
    records: Vec<StageRecord>,
}

impl ProgressTracker {
    pub fn new(will_write: bool) -> Self {
        Self {
            will_write,
            stage: None,
            stage_progress: None,
            stage_started: None,
            tasks: None,
            current_task: None,
            started: (Instant::now(), OffsetDateTime::now_utc()),
            finished: None,
            records: Vec::new(),
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    pub fn stage_count(&self) -> usize {
        if self.will_write {
            Stage::ALL.len()
        } else {
            Stage::ALL.len() - 1
        }
    }

    /// `[n/t] Name`
    pub fn stage_label(&self, stage: Stage) -> String {
        format!("[{}/{}] {}", stage.number(), self.stage_count(), stage.name())
    }

    /// Close the current stage and start `stage`.
    pub fn enter(&mut self, stage: Stage) {
        self.close_stage();
        self.stage = Some(stage);
        self.stage_started = Some((Instant::now(), OffsetDateTime::now_utc()));
        info!("--> {}", self.stage_label(stage));
    }

    fn close_stage(&mut self) {
        if let (Some(stage), Some((started, started_at))) = (self.stage, self.stage_started.take()) {
            self.records.push(StageRecord {
                stage,
                started_at,
                duration: started.elapsed(),
            });
        }
        self.stage_progress = None;
        self.tasks = None;
        self.current_task = None;
    }

    pub fn set_progress(&mut self, fraction: f64) {
        self.stage_progress = Some(fraction.clamp(0.0, 1.0));
    }

    pub fn current_task(&self) -> Option<&str> {
        self.current_task.as_deref()
    }

    /// Feed one line of playbook output.
    pub fn playbook_line(&mut self, line: &str) {
        if !self.stage.is_some_and(Stage::is_virtualized) {
            return;
        }
        if self.tasks.is_none() {
            if let Some(tasks) = parse_task_list(line) {
                info!(count = tasks.len(), "playbook task list");
                self.tasks = Some(tasks);
            }
            return;
        }
        let Some(task) = parse_current_task(line) else {
            return;
        };
        self.current_task = Some(task.to_string());
        let position = self
            .tasks
            .as_ref()
            .and_then(|tasks| Some((tasks.iter().position(|t| t == task)?, tasks.len())));
        if let Some((index, count)) = position {
            self.set_progress(index as f64 / count as f64);
        }
    }

    /// Overall completion in `0.0..=1.0`.
    pub fn overall(&self) -> f64 {
        let Some(stage) = self.stage else {
            return 0.0;
        };
        let span = 1.0 / self.stage_count() as f64;
        let lower = span * (stage.number() - 1) as f64;
        (lower + self.stage_progress.unwrap_or(0.0) * span).min(1.0)
    }

    pub fn finish(&mut self) {
        self.close_stage();
        self.finished = Some(self.started.0.elapsed());
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    /// One line per stage run, then the total.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec!["*** DURATIONS SUMMARY ***".to_string()];
        for record in &self.records {
            lines.push(format!(
                "{}: {} (started {})",
                self.stage_label(record.stage),
                format_duration(record.duration),
                format_timestamp(record.started_at)
            ));
        }
        let total = self.finished.unwrap_or_else(|| self.started.0.elapsed());
        lines.push(format!(
            "TOTAL: {} (started {})",
            format_duration(total),
            format_timestamp(self.started.1)
        ));
        lines
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

pub fn format_timestamp(t: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        t.year(),
        t.month() as u8,
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}
