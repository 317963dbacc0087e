use futures_util::stream::{self, StreamExt};

use crate::layers::llm::LlmCaller;
use crate::layers::prompt::{self, PromptValues};
use crate::layers::{BilingualSummary, ScoredCandidate, SummarizedCandidate, SummaryStatus};

/// Markers that open each language block in the model reply.
#[derive(Debug, Clone)]
pub struct SummaryMarkers {
    pub source: String,
    pub target: String,
}

impl Default for SummaryMarkers {
    fn default() -> Self {
        Self {
            source: "English Abstract:".to_string(),
            target: "【中文摘要】".to_string(),
        }
    }
}

/// Split a reply into its two language blocks. Blocks may come in either order.
pub fn parse_bilingual(reply: &str, markers: &SummaryMarkers) -> Result<BilingualSummary, String> {
    let missing = |marker: &str| format!("missing '{}' block", marker);

    // Locate the longer marker first so the shorter one is never matched inside it.
    let (src_at, tgt_at) = if markers.source.len() >= markers.target.len() {
        let src_at = reply.find(&markers.source).ok_or_else(|| missing(&markers.source))?;
        let tgt_at = find_outside(reply, &markers.target, src_at, markers.source.len())
            .ok_or_else(|| missing(&markers.target))?;
        (src_at, tgt_at)
    } else {
        let tgt_at = reply.find(&markers.target).ok_or_else(|| missing(&markers.target))?;
        let src_at = find_outside(reply, &markers.source, tgt_at, markers.target.len())
            .ok_or_else(|| missing(&markers.source))?;
        (src_at, tgt_at)
    };

    let source = block(reply, src_at, markers.source.len(), tgt_at);
    let target = block(reply, tgt_at, markers.target.len(), src_at);

    if source.is_empty() {
        return Err(format!("empty '{}' block", markers.source));
    }
    if target.is_empty() {
        return Err(format!("empty '{}' block", markers.target));
    }
    Ok(BilingualSummary {
        source: source.to_string(),
        target: target.to_string(),
    })
}

/// First match of `marker` that does not overlap `[taken, taken + taken_len)`.
fn find_outside(reply: &str, marker: &str, taken: usize, taken_len: usize) -> Option<usize> {
    reply
        .match_indices(marker)
        .map(|(at, _)| at)
        .find(|&at| at + marker.len() <= taken || at >= taken + taken_len)
}

/// Text after the marker at `start`, up to the other marker if that one follows.
fn block(reply: &str, start: usize, marker_len: usize, other: usize) -> &str {
    let body = start + marker_len;
    let end = if other >= body { other } else { reply.len() };
    reply[body..end].trim()
}

pub struct Summarizer {
    caller: LlmCaller,
    template: String,
    interests: String,
    markers: SummaryMarkers,
    max_abstract_chars: usize,
}

impl Summarizer {
    pub fn new(
        caller: LlmCaller,
        template: impl Into<String>,
        interests: &[String],
        markers: SummaryMarkers,
        max_abstract_chars: usize,
    ) -> Self {
        Self {
            caller,
            template: template.into(),
            interests: interests.join(", "),
            markers,
            max_abstract_chars,
        }
    }

    /// Summarize candidates at or above `threshold`; the rest pass through untouched.
    pub async fn summarize_all(&self, scored: Vec<ScoredCandidate>, threshold: u8) -> Vec<SummarizedCandidate> {
        stream::iter(scored)
            .map(|c| self.summarize_one(c, threshold))
            .buffered(self.caller.concurrency.max(1))
            .collect()
            .await
    }

    pub async fn summarize_one(&self, scored: ScoredCandidate, threshold: u8) -> SummarizedCandidate {
        if scored.score().map_or(true, |s| s < threshold) {
            return SummarizedCandidate {
                scored,
                summary: None,
                status: SummaryStatus::BelowThreshold,
            };
        }
        if scored.paper().abstract_or_none().is_none() {
            tracing::debug!("No abstract for {}, skipping summary", scored.paper().id);
            return SummarizedCandidate {
                scored,
                summary: None,
                status: SummaryStatus::NoAbstract,
            };
        }

        let values = PromptValues::for_paper(scored.paper(), &self.interests, self.max_abstract_chars);
        let prompt = prompt::render(&self.template, &values);
        let label = format!("summarize {}", scored.paper().id);
        let markers = &self.markers;

        match self
            .caller
            .call_parsed(&label, &prompt, |reply| parse_bilingual(reply, markers))
            .await
        {
            Ok((summary, _)) => SummarizedCandidate {
                scored,
                summary: Some(summary),
                status: SummaryStatus::Generated,
            },
            Err(exhausted) => {
                tracing::warn!(
                    "Summary for {} failed, falling back to abstract: {}",
                    scored.paper().id,
                    exhausted.last_error
                );
                SummarizedCandidate {
                    scored,
                    summary: None,
                    status: SummaryStatus::Failed {
                        attempts: exhausted.attempts,
                        last_error: exhausted.last_error,
                    },
                }
            }
        }
    }
}
