use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PaperRecord {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub publication_date: Option<NaiveDate>,
    pub doi: Option<String>,
    pub venue: Option<String>,
    pub abstract_text: Option<String>,
    pub url: String,
    /// Search keywords that returned this record, first-seen order.
    #[serde(default)]
    pub matched_keywords: Vec<String>,
}

impl PaperRecord {
    /// Abstract if present and not blank.
    pub fn abstract_or_none(&self) -> Option<&str> {
        self.abstract_text
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Inclusive publication-date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Option<Self> {
        (from <= to).then_some(Self { from, to })
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self { from: day, to: day }
    }
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}..{}", self.from, self.to)
        }
    }
}

/// A record that passed the keyword pre-filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub paper: PaperRecord,
    /// Positive terms found in title/abstract.
    pub prefilter_hits: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScoreOutcome {
    Scored { score: u8, reason: Option<String> },
    Failed { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub outcome: ScoreOutcome,
}

impl ScoredCandidate {
    pub fn score(&self) -> Option<u8> {
        match self.outcome {
            ScoreOutcome::Scored { score, .. } => Some(score),
            ScoreOutcome::Failed { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.outcome {
            ScoreOutcome::Scored { reason, .. } => reason.as_deref(),
            ScoreOutcome::Failed { .. } => None,
        }
    }

    pub fn paper(&self) -> &PaperRecord {
        &self.candidate.paper
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BilingualSummary {
    /// Summary in the paper's own language.
    pub source: String,
    /// Summary in the reader's language.
    pub target: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SummaryStatus {
    Generated,
    BelowThreshold,
    NoAbstract,
    Failed { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummarizedCandidate {
    pub scored: ScoredCandidate,
    pub summary: Option<BilingualSummary>,
    pub status: SummaryStatus,
}

impl SummarizedCandidate {
    pub fn paper(&self) -> &PaperRecord {
        self.scored.paper()
    }

    pub fn score(&self) -> u8 {
        self.scored.score().unwrap_or(0)
    }
}

pub mod delivery;
pub mod digest;
pub mod discovery;
pub mod llm;
pub mod prefilter;
pub mod prompt;
pub mod retry;
pub mod scoring;
pub mod summarize;

#[cfg(test)]
pub(crate) mod test_support;
