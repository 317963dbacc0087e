use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::RunError;
use crate::layers::delivery::MailClient;
use crate::layers::digest::DigestAssembler;
use crate::layers::discovery::{PaperSource, RetrievalOrchestrator};
use crate::layers::llm::{LlmCaller, LlmClient};
use crate::layers::prefilter::KeywordFilter;
use crate::layers::retry::Delay;
use crate::layers::scoring::{apply_threshold, RelevanceScorer};
use crate::layers::summarize::Summarizer;
use crate::layers::{DateWindow, ScoreOutcome, SummaryStatus};
use crate::run::{RunRecord, RunRecorder};

/// One full pass: retrieve, pre-filter, score, summarize, assemble, send.
pub struct Pipeline {
    keywords: Vec<String>,
    relevance_threshold: u8,
    summarize_threshold: u8,
    retrieval: RetrievalOrchestrator,
    prefilter: KeywordFilter,
    scorer: RelevanceScorer,
    summarizer: Summarizer,
    assembler: DigestAssembler,
    mailer: Arc<dyn MailClient>,
    cancelled: AtomicBool,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        source: Arc<dyn PaperSource>,
        llm: Arc<dyn LlmClient>,
        delay: Arc<dyn Delay>,
        mailer: Arc<dyn MailClient>,
    ) -> Self {
        let caller = LlmCaller {
            client: llm,
            delay,
            retry: config.retry,
            timeout: config.llm_timeout,
            concurrency: config.llm_concurrency,
        };

        Self {
            keywords: config.research_keywords.clone(),
            relevance_threshold: config.relevance_threshold,
            summarize_threshold: config.summarize_threshold,
            retrieval: RetrievalOrchestrator::new(source, config.max_results),
            prefilter: KeywordFilter::new(&config.research_keywords, &config.exclude_keywords),
            scorer: RelevanceScorer::new(
                caller.clone(),
                config.filter_prompt.clone(),
                &config.research_keywords,
                config.max_abstract_chars,
            ),
            summarizer: Summarizer::new(
                caller,
                config.summarize_prompt.clone(),
                &config.research_keywords,
                config.summary_markers.clone(),
                config.max_abstract_chars,
            ),
            assembler: DigestAssembler::new(config.digest.clone()),
            mailer,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Ask the current and any later run to stop at the next stage boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn run(&self, window: DateWindow) -> RunRecord {
        info!("Starting run for {}", window);
        let mut recorder = RunRecorder::start(window);
        if let Err(e) = self.execute(&mut recorder).await {
            recorder.fail(e);
        }
        let record = recorder.seal();
        record.log();
        record
    }

    fn checkpoint(&self, stage: &'static str) -> Result<(), RunError> {
        if self.is_cancelled() {
            warn!("Run cancelled before {}", stage);
            return Err(RunError::Cancelled { stage });
        }
        Ok(())
    }

    async fn execute(&self, rec: &mut RunRecorder) -> Result<(), RunError> {
        let window = rec.window();

        // 1. Retrieval
        self.checkpoint("retrieval")?;
        let retrieval = self.retrieval.retrieve(window, &self.keywords).await;
        for failure in &retrieval.failures {
            rec.keyword_failed(&failure.keyword, failure.error.clone());
        }
        rec.counts.retrieved = retrieval.papers.len();
        if retrieval.unavailable() {
            return Err(RunError::RetrievalUnavailable {
                keywords: retrieval.queried,
            });
        }

        // 2. Keyword pre-filter
        self.checkpoint("pre-filter")?;
        let candidates = self.prefilter.filter_batch(retrieval.papers);
        rec.counts.prefiltered = candidates.len();
        info!("Pre-filter kept {}/{} papers", candidates.len(), rec.counts.retrieved);

        // 3. Relevance scoring
        self.checkpoint("scoring")?;
        let scored = self.scorer.score_all(candidates).await;
        let split = apply_threshold(scored, self.relevance_threshold);
        for dropped in &split.failed {
            if let ScoreOutcome::Failed { attempts, last_error } = &dropped.outcome {
                warn!(
                    "Dropping {} after {} failed scoring attempt(s): {}",
                    dropped.paper().id,
                    attempts,
                    last_error
                );
                rec.scoring_failed(&dropped.paper().id, last_error.clone());
            }
        }
        rec.counts.scored = split.passed.len() + split.below.len();
        rec.counts.scoring_failed = split.failed.len();
        rec.counts.above_threshold = split.passed.len();
        info!(
            "Scoring: {} at or above {}, {} below, {} failed",
            split.passed.len(),
            self.relevance_threshold,
            split.below.len(),
            split.failed.len()
        );

        // 4. Summaries
        self.checkpoint("summarizing")?;
        let summarized = self
            .summarizer
            .summarize_all(split.passed, self.summarize_threshold)
            .await;
        rec.counts.summarized = summarized
            .iter()
            .filter(|s| s.status == SummaryStatus::Generated)
            .count();
        rec.counts.summary_failed = summarized
            .iter()
            .filter(|s| matches!(s.status, SummaryStatus::Failed { .. }))
            .count();

        // 5. Digest and delivery
        self.checkpoint("delivery")?;
        let digest = self.assembler.assemble(summarized, window);
        self.mailer
            .send(&digest)
            .await
            .map_err(|e| RunError::Delivery(e.to_string()))?;
        rec.counts.delivered = digest.paper_count();
        info!("Delivered '{}' with {} papers", digest.subject, digest.paper_count());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CompletionError, RetrievalError};
    use crate::layers::retry::RetryPolicy;
    use crate::layers::test_support::{paper, RecordingDelay, RecordingMailer, ScriptedLlm, ScriptedSource};
    use crate::layers::PaperRecord;
    use crate::run::RunOutcome;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::time::Duration;

    const SUMMARY: &str = "【中文摘要】电池储能的新方法。\nEnglish Abstract: A new approach to battery storage.";

    fn window() -> DateWindow {
        DateWindow::single_day(NaiveDate::from_ymd_opt(2025, 3, 4).unwrap())
    }

    fn config(relevance: u8, summarize: u8) -> PipelineConfig {
        PipelineConfig {
            research_keywords: vec!["battery".into(), "grid".into()],
            exclude_keywords: vec!["survey".into()],
            relevance_threshold: relevance,
            summarize_threshold: summarize,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
            filter_prompt: "RATE {title}\n{abstract}".into(),
            summarize_prompt: "SUMMARIZE {title}\n{abstract}".into(),
            ..Default::default()
        }
    }

    /// Scores "Battery storage" 5 and everything else 2; answers summary prompts.
    fn scripted_llm() -> Arc<ScriptedLlm> {
        Arc::new(ScriptedLlm::new(|prompt, _| {
            if prompt.starts_with("SUMMARIZE") {
                Ok(SUMMARY.to_string())
            } else if prompt.contains("Battery storage") {
                Ok("Score: 5\nReason: directly on battery storage".to_string())
            } else {
                Ok("Score: 2\nReason: tangential".to_string())
            }
        }))
    }

    fn pipeline(
        cfg: &PipelineConfig,
        source: Arc<dyn PaperSource>,
        llm: Arc<ScriptedLlm>,
        mailer: Arc<RecordingMailer>,
    ) -> Pipeline {
        Pipeline::new(cfg, source, llm, Arc::new(RecordingDelay::default()), mailer)
    }

    fn two_keyword_source() -> ScriptedSource {
        ScriptedSource::new()
            .with(
                "battery",
                vec![
                    paper("W1", "Battery storage at scale"),
                    paper("W2", "A survey of battery chemistry"),
                    paper("W3", "Grid-forming battery inverters"),
                ],
            )
            .with("grid", vec![paper("W3", "Grid-forming battery inverters")])
    }

    #[tokio::test]
    async fn end_to_end_keeps_single_relevant_paper_with_summaries() {
        let llm = scripted_llm();
        let mailer = Arc::new(RecordingMailer::default());
        let p = pipeline(&config(4, 4), Arc::new(two_keyword_source()), llm.clone(), mailer.clone());

        let record = p.run(window()).await;

        assert_eq!(record.outcome(), RunOutcome::Success);
        let c = record.counts();
        assert_eq!(c.retrieved, 3);
        assert_eq!(c.prefiltered, 2);
        assert_eq!(c.scored, 2);
        assert_eq!(c.above_threshold, 1);
        assert_eq!(c.summarized, 1);
        assert_eq!(c.delivered, 1);

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].paper_ids, vec!["W1"]);
        assert!(sent[0].html.contains("电池储能的新方法。"));
        assert!(sent[0].html.contains("A new approach to battery storage."));
        assert!(!sent[0].html.contains("Grid-forming"));
        // two scoring calls and one summary call
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn paper_below_summarize_threshold_ships_raw_abstract() {
        let llm = Arc::new(ScriptedLlm::always("Score: 4"));
        let mailer = Arc::new(RecordingMailer::default());
        let source = ScriptedSource::new().with("battery", vec![paper("W1", "Battery storage at scale")]);
        let p = pipeline(&config(4, 5), Arc::new(source), llm.clone(), mailer.clone());

        let record = p.run(window()).await;

        assert_eq!(record.outcome(), RunOutcome::Success);
        assert_eq!(record.counts().summarized, 0);
        assert_eq!(llm.calls(), 1);
        assert!(llm.prompts().iter().all(|p| !p.starts_with("SUMMARIZE")));
        let sent = mailer.sent();
        assert_eq!(sent[0].paper_ids, vec!["W1"]);
        assert!(sent[0].html.contains("Abstract of Battery storage at scale"));
    }

    #[tokio::test]
    async fn all_keywords_failing_fails_run_without_delivery() {
        let source = ScriptedSource::new().failing("battery").failing("grid");
        let llm = scripted_llm();
        let mailer = Arc::new(RecordingMailer::default());
        let p = pipeline(&config(4, 4), Arc::new(source), llm.clone(), mailer.clone());

        let record = p.run(window()).await;

        assert!(record.failed());
        assert_eq!(record.keyword_failures().len(), 2);
        assert_eq!(
            record.terminal_error(),
            Some("retrieval unavailable: all 2 keyword queries failed")
        );
        assert!(mailer.sent().is_empty());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn one_failing_keyword_is_partial_failure() {
        let source = ScriptedSource::new()
            .with("battery", vec![paper("W1", "Battery storage at scale")])
            .failing("grid");
        let mailer = Arc::new(RecordingMailer::default());
        let p = pipeline(&config(4, 4), Arc::new(source), scripted_llm(), mailer.clone());

        let record = p.run(window()).await;

        assert_eq!(record.outcome(), RunOutcome::PartialFailure);
        assert_eq!(record.keyword_failures()[0].subject, "grid");
        assert_eq!(mailer.sent()[0].paper_ids, vec!["W1"]);
    }

    #[tokio::test]
    async fn empty_window_still_delivers_no_papers_message() {
        let mailer = Arc::new(RecordingMailer::default());
        let p = pipeline(&config(4, 4), Arc::new(ScriptedSource::new()), scripted_llm(), mailer.clone());

        let record = p.run(window()).await;

        assert_eq!(record.outcome(), RunOutcome::Success);
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].paper_count(), 0);
        assert!(sent[0].html.contains("No Relevant Papers Found"));
    }

    #[tokio::test]
    async fn delivery_failure_fails_run_but_keeps_counts() {
        let mailer = Arc::new(RecordingMailer::rejecting());
        let p = pipeline(&config(4, 4), Arc::new(two_keyword_source()), scripted_llm(), mailer);

        let record = p.run(window()).await;

        assert!(record.failed());
        assert_eq!(record.counts().above_threshold, 1);
        assert_eq!(record.counts().delivered, 0);
        assert!(record.terminal_error().unwrap().starts_with("delivery failed"));
    }

    #[tokio::test]
    async fn scoring_failures_are_dropped_and_recorded() {
        let llm = Arc::new(ScriptedLlm::new(|prompt, _| {
            if prompt.contains("Grid-forming") {
                Err(CompletionError::Transport("connection reset".into()))
            } else if prompt.starts_with("SUMMARIZE") {
                Ok(SUMMARY.to_string())
            } else {
                Ok("Score: 5".to_string())
            }
        }));
        let mailer = Arc::new(RecordingMailer::default());
        let p = pipeline(&config(4, 4), Arc::new(two_keyword_source()), llm.clone(), mailer.clone());

        let record = p.run(window()).await;

        assert_eq!(record.outcome(), RunOutcome::PartialFailure);
        assert_eq!(record.counts().scoring_failed, 1);
        assert_eq!(record.scoring_failures()[0].subject, "W3");
        assert_eq!(mailer.sent()[0].paper_ids, vec!["W1"]);
        // W1: one score + one summary, W3: three failed score attempts
        assert_eq!(llm.calls(), 5);
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let source = Arc::new(two_keyword_source());
        let llm = scripted_llm();
        let mailer = Arc::new(RecordingMailer::default());
        let p = pipeline(&config(4, 4), source.clone(), llm.clone(), mailer.clone());
        p.cancel();

        let record = p.run(window()).await;

        assert!(record.failed());
        assert_eq!(record.terminal_error(), Some("run cancelled before retrieval"));
        assert_eq!(source.calls(), 0);
        assert_eq!(llm.calls(), 0);
        assert!(mailer.sent().is_empty());
    }

    /// Returns one paper, then asks the pipeline to stop.
    struct CancellingSource {
        pipeline: std::sync::OnceLock<Arc<Pipeline>>,
    }

    #[async_trait]
    impl PaperSource for CancellingSource {
        async fn search(
            &self,
            _keyword: &str,
            _from: NaiveDate,
            _to: NaiveDate,
            _max_results: usize,
        ) -> Result<Vec<PaperRecord>, RetrievalError> {
            if let Some(p) = self.pipeline.get() {
                p.cancel();
            }
            Ok(vec![paper("W1", "Battery storage at scale")])
        }
    }

    #[tokio::test]
    async fn cancellation_takes_effect_at_next_stage_boundary() {
        let source = Arc::new(CancellingSource {
            pipeline: std::sync::OnceLock::new(),
        });
        let llm = scripted_llm();
        let mailer = Arc::new(RecordingMailer::default());
        let p = Arc::new(pipeline(&config(4, 4), source.clone(), llm.clone(), mailer.clone()));
        let _ = source.pipeline.set(p.clone());

        let record = p.run(window()).await;

        assert_eq!(record.terminal_error(), Some("run cancelled before pre-filter"));
        assert_eq!(record.counts().retrieved, 1);
        assert_eq!(llm.calls(), 0);
        assert!(mailer.sent().is_empty());
    }
}
