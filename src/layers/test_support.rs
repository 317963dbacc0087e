//! Stub collaborators shared by the unit tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{CompletionError, DeliveryError, RetrievalError};
use crate::layers::delivery::MailClient;
use crate::layers::digest::Digest;
use crate::layers::discovery::PaperSource;
use crate::layers::llm::LlmClient;
use crate::layers::retry::Delay;
use crate::layers::PaperRecord;

pub fn paper(id: &str, title: &str) -> PaperRecord {
    PaperRecord {
        id: id.to_string(),
        title: title.to_string(),
        authors: vec!["A. Author".to_string()],
        publication_date: NaiveDate::from_ymd_opt(2025, 3, 4),
        doi: None,
        venue: Some("Test Venue".to_string()),
        abstract_text: Some(format!("Abstract of {}", title)),
        url: format!("https://openalex.org/{}", id),
        matched_keywords: Vec::new(),
    }
}

/// Paper source answering from a fixed keyword table.
#[derive(Default)]
pub struct ScriptedSource {
    answers: HashMap<String, Vec<PaperRecord>>,
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, keyword: &str, papers: Vec<PaperRecord>) -> Self {
        self.answers.insert(keyword.to_string(), papers);
        self
    }

    pub fn failing(mut self, keyword: &str) -> Self {
        self.failing.insert(keyword.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaperSource for ScriptedSource {
    async fn search(
        &self,
        keyword: &str,
        _from: NaiveDate,
        _to: NaiveDate,
        max_results: usize,
    ) -> Result<Vec<PaperRecord>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(keyword) {
            return Err(RetrievalError::Status {
                endpoint: "stub".to_string(),
                status: 503,
            });
        }
        Ok(self
            .answers
            .get(keyword)
            .map(|p| p.iter().take(max_results).cloned().collect())
            .unwrap_or_default())
    }
}

type Responder = Box<dyn Fn(&str, usize) -> Result<String, CompletionError> + Send + Sync>;

/// LLM client whose answer is computed from the prompt and the call number.
pub struct ScriptedLlm {
    responder: Responder,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(
        responder: impl Fn(&str, usize) -> Result<String, CompletionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn always(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_, _| Ok(text.clone()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, prompt: &str, _timeout: Duration) -> Result<String, CompletionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        (self.responder)(prompt, n)
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<Digest>>,
    pub reject: bool,
}

impl RecordingMailer {
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<Digest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailClient for RecordingMailer {
    async fn send(&self, digest: &Digest) -> Result<(), DeliveryError> {
        if self.reject {
            return Err(DeliveryError::Rejected("stub refused".to_string()));
        }
        self.sent.lock().unwrap().push(digest.clone());
        Ok(())
    }
}

/// Records requested delays instead of sleeping.
#[derive(Default)]
pub struct RecordingDelay {
    pub waits: Mutex<Vec<Duration>>,
}

impl RecordingDelay {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delay for RecordingDelay {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
    }
}
