use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RetrievalError;
use crate::layers::{DateWindow, PaperRecord};

/// Anything that can list papers published in a window for one keyword.
#[async_trait]
pub trait PaperSource: Send + Sync {
    async fn search(
        &self,
        keyword: &str,
        from: NaiveDate,
        to: NaiveDate,
        max_results: usize,
    ) -> Result<Vec<PaperRecord>, RetrievalError>;
}

// OpenAlex Data Structures
#[derive(Deserialize)]
struct OAResponse {
    results: Vec<OAWork>,
}

#[derive(Deserialize)]
struct OAWork {
    id: String,
    title: Option<String>,
    display_name: Option<String>,
    doi: Option<String>,
    publication_date: Option<String>,
    #[serde(default)]
    authorships: Vec<OAAuthorship>,
    primary_location: Option<OALocation>,
    #[serde(default)]
    abstract_inverted_index: Option<HashMap<String, Vec<usize>>>,
}

#[derive(Deserialize)]
struct OAAuthorship {
    author: OAAuthor,
}

#[derive(Deserialize)]
struct OAAuthor {
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct OALocation {
    source: Option<OASource>,
    landing_page_url: Option<String>,
}

#[derive(Deserialize)]
struct OASource {
    display_name: Option<String>,
}

use governor::clock::DefaultClock;
use governor::state::{direct::NotKeyed, InMemoryState};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;

/// OpenAlex caps `per-page` at 200.
const OPENALEX_MAX_PER_PAGE: usize = 200;

pub struct OpenAlexClient {
    client: Client,
    api_url: String,
    email: Option<String>,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl OpenAlexClient {
    pub fn new(api_url: impl Into<String>, email: Option<String>, timeout: Duration) -> Self {
        // OpenAlex allows 10 req/s for the polite pool; stay under it.
        let quota = Quota::per_second(nonzero!(8u32));
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("paper-digest/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            email,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    fn works_url(&self, keyword: &str, from: NaiveDate, to: NaiveDate, max_results: usize) -> String {
        let mut url = format!(
            "{}/works?search={}&filter=from_publication_date:{},to_publication_date:{}&sort=publication_date:desc&per-page={}",
            self.api_url,
            urlencoding::encode(keyword),
            from.format("%Y-%m-%d"),
            to.format("%Y-%m-%d"),
            max_results.clamp(1, OPENALEX_MAX_PER_PAGE),
        );
        if let Some(email) = &self.email {
            url.push_str(&format!("&mailto={}", urlencoding::encode(email)));
        }
        url
    }
}

#[async_trait]
impl PaperSource for OpenAlexClient {
    async fn search(
        &self,
        keyword: &str,
        from: NaiveDate,
        to: NaiveDate,
        max_results: usize,
    ) -> Result<Vec<PaperRecord>, RetrievalError> {
        self.limiter.until_ready().await;

        let url = self.works_url(keyword, from, to, max_results);
        tracing::info!("Querying OpenAlex: {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RetrievalError::Transport {
                endpoint: self.api_url.clone(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(RetrievalError::Status {
                endpoint: self.api_url.clone(),
                status: resp.status().as_u16(),
            });
        }

        let oa_resp: OAResponse = resp.json().await.map_err(|e| RetrievalError::Decode {
            endpoint: self.api_url.clone(),
            message: e.to_string(),
        })?;

        Ok(oa_resp
            .results
            .into_iter()
            .take(max_results)
            .map(work_to_record)
            .collect())
    }
}

fn work_to_record(work: OAWork) -> PaperRecord {
    let authors = work
        .authorships
        .into_iter()
        .filter_map(|a| a.author.display_name)
        .collect();
    let (venue, landing) = match work.primary_location {
        Some(loc) => (loc.source.and_then(|s| s.display_name), loc.landing_page_url),
        None => (None, None),
    };
    let url = landing
        .or_else(|| work.doi.clone())
        .unwrap_or_else(|| work.id.clone());

    PaperRecord {
        id: short_work_id(&work.id),
        title: work
            .title
            .or(work.display_name)
            .unwrap_or_else(|| "Untitled".to_string()),
        authors,
        publication_date: work
            .publication_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
        doi: work.doi,
        venue,
        abstract_text: work.abstract_inverted_index.as_ref().map(rebuild_abstract),
        url,
        matched_keywords: Vec::new(),
    }
}

/// `https://openalex.org/W123` -> `W123`
fn short_work_id(id: &str) -> String {
    id.rsplit('/').next().unwrap_or(id).trim().to_string()
}

/// OpenAlex ships abstracts as word -> positions; put the words back in order.
fn rebuild_abstract(index: &HashMap<String, Vec<usize>>) -> String {
    let mut positioned: Vec<(usize, &str)> = index
        .iter()
        .flat_map(|(word, positions)| positions.iter().map(move |p| (*p, word.as_str())))
        .collect();
    positioned.sort_by_key(|(pos, _)| *pos);
    positioned
        .into_iter()
        .map(|(_, w)| w)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordFailure {
    pub keyword: String,
    pub error: String,
}

/// Deduplicated output of one retrieval pass.
#[derive(Debug, Default)]
pub struct Retrieval {
    pub papers: Vec<PaperRecord>,
    pub failures: Vec<KeywordFailure>,
    pub queried: usize,
}

impl Retrieval {
    /// Every keyword query failed, so there is no data at all.
    pub fn unavailable(&self) -> bool {
        self.queried > 0 && self.failures.len() == self.queried
    }
}

pub struct RetrievalOrchestrator {
    source: Arc<dyn PaperSource>,
    max_results: usize,
}

impl RetrievalOrchestrator {
    pub fn new(source: Arc<dyn PaperSource>, max_results: usize) -> Self {
        Self { source, max_results }
    }

    pub async fn retrieve(&self, window: DateWindow, keywords: &[String]) -> Retrieval {
        let mut retrieval = Retrieval {
            queried: keywords.len(),
            ..Default::default()
        };
        let mut index: HashMap<String, usize> = HashMap::new();

        for keyword in keywords {
            let found = match self
                .source
                .search(keyword, window.from, window.to, self.max_results)
                .await
            {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!("Retrieval for keyword '{}' failed: {}", keyword, e);
                    retrieval.failures.push(KeywordFailure {
                        keyword: keyword.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let total = found.len();
            let mut fresh = 0;
            for mut paper in found {
                let id = paper.id.trim().to_string();
                if id.is_empty() {
                    tracing::warn!("Dropping record without identifier: '{}'", paper.title);
                    continue;
                }
                match index.get(&id) {
                    Some(&pos) => {
                        let existing = &mut retrieval.papers[pos];
                        if !existing.matched_keywords.iter().any(|k| k == keyword) {
                            existing.matched_keywords.push(keyword.clone());
                        }
                    }
                    None => {
                        paper.id = id.clone();
                        paper.matched_keywords = vec![keyword.clone()];
                        index.insert(id, retrieval.papers.len());
                        retrieval.papers.push(paper);
                        fresh += 1;
                    }
                }
            }
            tracing::info!("Keyword '{}': found {} papers ({} new)", keyword, total, fresh);
        }

        tracing::info!(
            "Retrieval for {}: {} unique papers, {}/{} keywords failed",
            window,
            retrieval.papers.len(),
            retrieval.failures.len(),
            retrieval.queried
        );
        retrieval
    }
}
