use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{create_dir_all, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::RunError;
use crate::layers::DateWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    Success,
    PartialFailure,
    Failure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub retrieved: usize,
    pub prefiltered: usize,
    pub scored: usize,
    pub scoring_failed: usize,
    pub above_threshold: usize,
    pub summarized: usize,
    pub summary_failed: usize,
    pub delivered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Keyword or paper id the failure belongs to.
    pub subject: String,
    pub error: String,
}

static RUN_SEQ: AtomicU64 = AtomicU64::new(1);

/// Mutable ledger for a run in progress; consumed by [`RunRecorder::seal`].
#[derive(Debug)]
pub struct RunRecorder {
    run_id: String,
    started_at: DateTime<Utc>,
    window: DateWindow,
    pub counts: StageCounts,
    keyword_failures: Vec<Failure>,
    scoring_failures: Vec<Failure>,
    terminal: Option<RunError>,
}

impl RunRecorder {
    pub fn start(window: DateWindow) -> Self {
        let started_at = Utc::now();
        let seq = RUN_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            run_id: format!("{}-{}", started_at.format("%Y%m%dT%H%M%S"), seq),
            started_at,
            window,
            counts: StageCounts::default(),
            keyword_failures: Vec::new(),
            scoring_failures: Vec::new(),
            terminal: None,
        }
    }

    pub fn window(&self) -> DateWindow {
        self.window
    }

    pub fn keyword_failed(&mut self, keyword: &str, error: impl Into<String>) {
        self.keyword_failures.push(Failure {
            subject: keyword.to_string(),
            error: error.into(),
        });
    }

    pub fn scoring_failed(&mut self, paper_id: &str, error: impl Into<String>) {
        self.scoring_failures.push(Failure {
            subject: paper_id.to_string(),
            error: error.into(),
        });
    }

    /// Record the error that ends the run. The first one wins.
    pub fn fail(&mut self, error: RunError) {
        if self.terminal.is_none() {
            self.terminal = Some(error);
        }
    }

    fn outcome(&self) -> RunOutcome {
        if self.terminal.is_some() {
            RunOutcome::Failure
        } else if !self.keyword_failures.is_empty()
            || !self.scoring_failures.is_empty()
            || self.counts.summary_failed > 0
        {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        }
    }

    pub fn seal(self) -> RunRecord {
        RunRecord {
            outcome: self.outcome(),
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            window: self.window,
            counts: self.counts,
            keyword_failures: self.keyword_failures,
            scoring_failures: self.scoring_failures,
            terminal_error: self.terminal.map(|e| e.to_string()),
        }
    }
}

/// Sealed outcome of one run. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    run_id: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    window: DateWindow,
    outcome: RunOutcome,
    counts: StageCounts,
    keyword_failures: Vec<Failure>,
    scoring_failures: Vec<Failure>,
    terminal_error: Option<String>,
}

impl RunRecord {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
    pub fn elapsed_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
    pub fn window(&self) -> DateWindow {
        self.window
    }
    pub fn outcome(&self) -> RunOutcome {
        self.outcome
    }
    pub fn counts(&self) -> &StageCounts {
        &self.counts
    }
    pub fn keyword_failures(&self) -> &[Failure] {
        &self.keyword_failures
    }
    pub fn scoring_failures(&self) -> &[Failure] {
        &self.scoring_failures
    }
    pub fn terminal_error(&self) -> Option<&str> {
        self.terminal_error.as_deref()
    }
    pub fn failed(&self) -> bool {
        self.outcome == RunOutcome::Failure
    }

    /// One line per run, for the history listing.
    pub fn summary(&self) -> String {
        let c = self.counts();
        let mut line = format!(
            "{} {} {:?} retrieved={} scored={} summarized={} delivered={}",
            self.run_id(),
            self.window(),
            self.outcome(),
            c.retrieved,
            c.scored,
            c.summarized,
            c.delivered
        );
        let (keywords, papers) = (self.keyword_failures().len(), self.scoring_failures().len());
        if keywords + papers > 0 {
            line.push_str(&format!(" keyword_failures={} scoring_failures={}", keywords, papers));
        }
        if let Some(error) = self.terminal_error() {
            line.push_str(&format!(" error=\"{}\"", error));
        }
        line
    }

    pub fn log(&self) {
        let c = &self.counts;
        match self.outcome {
            RunOutcome::Failure => tracing::error!(
                run_id = %self.run_id,
                window = %self.window,
                retrieved = c.retrieved,
                prefiltered = c.prefiltered,
                scored = c.scored,
                delivered = c.delivered,
                elapsed_ms = self.elapsed_ms(),
                error = self.terminal_error.as_deref().unwrap_or(""),
                "Run failed"
            ),
            outcome => tracing::info!(
                run_id = %self.run_id,
                window = %self.window,
                outcome = ?outcome,
                retrieved = c.retrieved,
                prefiltered = c.prefiltered,
                scored = c.scored,
                scoring_failed = c.scoring_failed,
                above_threshold = c.above_threshold,
                summarized = c.summarized,
                summary_failed = c.summary_failed,
                delivered = c.delivered,
                elapsed_ms = self.elapsed_ms(),
                "Run finished"
            ),
        }
    }
}

/// Append-only JSON-lines log of sealed runs.
pub struct RunHistory {
    path: PathBuf,
}

impl RunHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn append(&self, record: &RunRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub async fn load(&self) -> anyhow::Result<Vec<RunRecord>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(anyhow::Error::from))
            .collect()
    }
}
