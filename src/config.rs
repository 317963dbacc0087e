use chrono::NaiveTime;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::layers::digest::DigestSettings;
use crate::layers::llm::LlmSettings;
use crate::layers::retry::RetryPolicy;
use crate::layers::summarize::SummaryMarkers;
use crate::scheduler::ScheduleZone;

const PREFIX: &str = "PAPER_DIGEST_";

pub const DEFAULT_FILTER_PROMPT: &str = "You screen new academic papers for a researcher.\n\
Rate how relevant the paper below is to these research interests: {interests}.\n\
Answer with exactly two lines:\n\
Score: <integer 1-5, 5 = must read>\n\
Reason: <one sentence>\n\n\
Title: {title}\n\nAbstract: {abstract}";

pub const DEFAULT_SUMMARIZE_PROMPT: &str = "Summarize the paper below for a busy researcher in 2-3 sentences, \
once in Chinese and once in English. Use exactly this layout:\n\
【中文摘要】\n<Chinese summary>\n\n\
English Abstract:\n<English summary>\n\n\
Research interests: {interests}\nTitle: {title}\nAuthors: {authors}\nVenue: {venue}\n\nAbstract: {abstract}";

/// Everything the pipeline and scheduler need, already parsed.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub research_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub relevance_threshold: u8,
    pub summarize_threshold: u8,
    pub max_results: usize,
    pub days_back: u32,
    pub retry: RetryPolicy,
    pub llm_timeout: Duration,
    pub llm_concurrency: usize,
    pub max_abstract_chars: usize,
    pub filter_prompt: String,
    pub summarize_prompt: String,
    pub summary_markers: SummaryMarkers,
    pub digest: DigestSettings,
    pub trigger_time: NaiveTime,
    pub timezone: ScheduleZone,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            research_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            relevance_threshold: 3,
            summarize_threshold: 4,
            max_results: 20,
            days_back: 1,
            retry: RetryPolicy::default(),
            llm_timeout: Duration::from_secs(60),
            llm_concurrency: 4,
            max_abstract_chars: 2000,
            filter_prompt: DEFAULT_FILTER_PROMPT.to_string(),
            summarize_prompt: DEFAULT_SUMMARIZE_PROMPT.to_string(),
            summary_markers: SummaryMarkers::default(),
            digest: DigestSettings::default(),
            trigger_time: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or_default(),
            timezone: ScheduleZone::Utc,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let retry = RetryPolicy {
            max_attempts: var_parse("MAX_ATTEMPTS", d.retry.max_attempts, "integer")?,
            base_delay: Duration::from_millis(var_parse(
                "BACKOFF_BASE_MS",
                d.retry.base_delay.as_millis() as u64,
                "milliseconds",
            )?),
            max_delay: Duration::from_millis(var_parse(
                "BACKOFF_MAX_MS",
                d.retry.max_delay.as_millis() as u64,
                "milliseconds",
            )?),
        };

        let config = Self {
            research_keywords: var_list("RESEARCH_KEYWORDS").unwrap_or(d.research_keywords),
            exclude_keywords: var_list("EXCLUDE_KEYWORDS").unwrap_or(d.exclude_keywords),
            relevance_threshold: var_parse("RELEVANCE_THRESHOLD", d.relevance_threshold, "integer 1-5")?,
            summarize_threshold: var_parse("SUMMARIZE_THRESHOLD", d.summarize_threshold, "integer 1-5")?,
            max_results: var_parse("MAX_RESULTS", d.max_results, "integer")?,
            days_back: var_parse("DAYS_BACK", d.days_back, "integer")?,
            retry,
            llm_timeout: Duration::from_secs(var_parse("LLM_TIMEOUT_SECS", d.llm_timeout.as_secs(), "seconds")?),
            llm_concurrency: var_parse("LLM_CONCURRENCY", d.llm_concurrency, "integer")?,
            max_abstract_chars: var_parse("MAX_ABSTRACT_CHARS", d.max_abstract_chars, "integer")?,
            filter_prompt: var("FILTER_PROMPT").unwrap_or(d.filter_prompt),
            summarize_prompt: var("SUMMARIZE_PROMPT").unwrap_or(d.summarize_prompt),
            summary_markers: SummaryMarkers {
                source: var("SOURCE_MARKER").unwrap_or(d.summary_markers.source),
                target: var("TARGET_MARKER").unwrap_or(d.summary_markers.target),
            },
            digest: DigestSettings {
                subject_template: var("EMAIL_SUBJECT").unwrap_or(d.digest.subject_template),
                greeting: var("EMAIL_GREETING").unwrap_or(d.digest.greeting),
                footer: var("EMAIL_FOOTER")
                    .map(|f| f.replace("\\n", "\n"))
                    .unwrap_or(d.digest.footer),
            },
            trigger_time: match var("TRIGGER_TIME") {
                Some(raw) => parse_time_of_day(&raw)?,
                None => d.trigger_time,
            },
            timezone: var_parse("TIMEZONE", d.timezone, "utc or local")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.research_keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(ConfigError::NoKeywords);
        }
        for (name, value) in [
            ("relevance_threshold", self.relevance_threshold),
            ("summarize_threshold", self.summarize_threshold),
        ] {
            if !(1..=5).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }
        if self.relevance_threshold > self.summarize_threshold {
            return Err(ConfigError::ThresholdOrder {
                relevance: self.relevance_threshold,
                summarize: self.summarize_threshold,
            });
        }
        let markers = &self.summary_markers;
        if markers.source.trim().is_empty() || markers.target.trim().is_empty() || markers.source == markers.target {
            return Err(ConfigError::AmbiguousMarkers);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Zero("max_attempts"));
        }
        if self.max_results == 0 {
            return Err(ConfigError::Zero("max_results"));
        }
        if self.llm_concurrency == 0 {
            return Err(ConfigError::Zero("llm_concurrency"));
        }
        if self.days_back == 0 {
            return Err(ConfigError::Zero("days_back"));
        }
        Ok(())
    }
}

/// Settings for the concrete collaborators wired up by the binary.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub openalex_api_url: String,
    pub openalex_email: Option<String>,
    pub http_timeout: Duration,
    /// Everything but the API key, which only the pipeline needs.
    llm: LlmSettings,
    llm_api_key: Option<String>,
    pub outbox_dir: PathBuf,
    pub history_path: PathBuf,
}

impl AdapterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let openalex_api_url = var("OPENALEX_API_URL").unwrap_or_else(|| "https://api.openalex.org".to_string());
        url::Url::parse(&openalex_api_url).map_err(|_| ConfigError::InvalidVar {
            var: format!("{}OPENALEX_API_URL", PREFIX),
            value: openalex_api_url.clone(),
            expected: "absolute URL",
        })?;

        Ok(Self {
            openalex_api_url,
            openalex_email: var("OPENALEX_EMAIL"),
            http_timeout: Duration::from_secs(var_parse("HTTP_TIMEOUT_SECS", 30, "seconds")?),
            llm_api_key: var("LLM_API_KEY"),
            llm: LlmSettings {
                api_key: String::new(),
                api_base_url: var("LLM_BASE_URL").unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                model_name: var("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                system_prompt: var("LLM_SYSTEM_PROMPT"),
                temperature: var_parse("LLM_TEMPERATURE", 0.3, "float")?,
                max_tokens: var_parse("LLM_MAX_TOKENS", 500, "integer")?,
            },
            outbox_dir: var("OUTBOX_DIR").unwrap_or_else(|| "outbox".to_string()).into(),
            history_path: var("HISTORY_PATH")
                .unwrap_or_else(|| "runs/history.jsonl".to_string())
                .into(),
        })
    }

    /// LLM settings with the API key filled in; the key is required from here on.
    pub fn llm_settings(&self) -> Result<LlmSettings, ConfigError> {
        let api_key = self
            .llm_api_key
            .clone()
            .ok_or_else(|| ConfigError::MissingVar(format!("{}LLM_API_KEY", PREFIX)))?;
        Ok(LlmSettings {
            api_key,
            ..self.llm.clone()
        })
    }
}

fn var(name: &str) -> Option<String> {
    env::var(format!("{}{}", PREFIX, name))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn var_parse<T: FromStr>(name: &str, default: T, expected: &'static str) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidVar {
            var: format!("{}{}", PREFIX, name),
            value: raw,
            expected,
        }),
    }
}

fn var_list(name: &str) -> Option<Vec<String>> {
    var(name).map(|raw| split_list(&raw))
}

/// Comma- or newline-separated list, blanks dropped.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| ConfigError::InvalidVar {
        var: format!("{}TRIGGER_TIME", PREFIX),
        value: raw.to_string(),
        expected: "HH:MM",
    })
}
