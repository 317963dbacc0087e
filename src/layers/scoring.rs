use futures_util::stream::{self, StreamExt};
use regex::Regex;
use std::sync::LazyLock;

use crate::layers::llm::LlmCaller;
use crate::layers::prompt::{self, PromptValues};
use crate::layers::{Candidate, ScoreOutcome, ScoredCandidate};

static LABELLED_SCORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:score|rating|relevance|评分|分数)\s*[:：=\-]?\s*(\d+)").expect("valid score pattern")
});
static LEADING_SCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)(?:\s*/\s*5)?\s*(?:$|[\s.,;)])").expect("valid score pattern"));
static REASON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*(?:reason|理由)\s*[:：]\s*(.+)$").expect("valid reason pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedScore {
    pub score: u8,
    pub reason: Option<String>,
}

/// Extract a 1-5 score and an optional reason from a model reply.
pub fn parse_score(reply: &str) -> Result<ParsedScore, String> {
    let digits = LABELLED_SCORE
        .captures(reply)
        .or_else(|| LEADING_SCORE.captures(reply))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| format!("no score found in '{}'", prompt::truncate_chars(reply, 80)))?;

    let score: u8 = digits
        .parse()
        .map_err(|_| format!("score '{}' is not a small integer", digits))?;
    if !(1..=5).contains(&score) {
        return Err(format!("score {} outside 1..=5", score));
    }

    let reason = REASON
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|r| !r.is_empty());

    Ok(ParsedScore { score, reason })
}

pub struct RelevanceScorer {
    caller: LlmCaller,
    template: String,
    interests: String,
    max_abstract_chars: usize,
}

impl RelevanceScorer {
    /// `interests` is rendered into `{interests}` for every candidate alike.
    pub fn new(
        caller: LlmCaller,
        template: impl Into<String>,
        interests: &[String],
        max_abstract_chars: usize,
    ) -> Self {
        Self {
            caller,
            template: template.into(),
            interests: interests.join(", "),
            max_abstract_chars,
        }
    }

    /// Score every candidate; output order matches input order.
    pub async fn score_all(&self, candidates: Vec<Candidate>) -> Vec<ScoredCandidate> {
        stream::iter(candidates)
            .map(|c| self.score_one(c))
            .buffered(self.caller.concurrency.max(1))
            .collect()
            .await
    }

    pub async fn score_one(&self, candidate: Candidate) -> ScoredCandidate {
        let values = PromptValues::for_paper(&candidate.paper, &self.interests, self.max_abstract_chars);
        let prompt = prompt::render(&self.template, &values);
        let label = format!("score {}", candidate.paper.id);

        let outcome = match self.caller.call_parsed(&label, &prompt, parse_score).await {
            Ok((parsed, attempts)) => {
                tracing::debug!(
                    "Scored {} = {} after {} attempt(s)",
                    candidate.paper.id,
                    parsed.score,
                    attempts
                );
                ScoreOutcome::Scored {
                    score: parsed.score,
                    reason: parsed.reason,
                }
            }
            Err(exhausted) => ScoreOutcome::Failed {
                attempts: exhausted.attempts,
                last_error: exhausted.last_error,
            },
        };

        ScoredCandidate { candidate, outcome }
    }
}

/// Result of applying the relevance threshold to scored candidates.
#[derive(Debug, Default)]
pub struct ThresholdSplit {
    pub passed: Vec<ScoredCandidate>,
    pub below: Vec<ScoredCandidate>,
    pub failed: Vec<ScoredCandidate>,
}

pub fn apply_threshold(scored: Vec<ScoredCandidate>, threshold: u8) -> ThresholdSplit {
    let mut split = ThresholdSplit::default();
    for candidate in scored {
        match candidate.score() {
            Some(score) if score >= threshold => split.passed.push(candidate),
            Some(_) => split.below.push(candidate),
            None => split.failed.push(candidate),
        }
    }
    split
}
