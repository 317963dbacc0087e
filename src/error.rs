use thiserror::Error;

/// A single keyword query against the paper source failed.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} answered with status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("could not decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

/// An LLM call failed before producing usable text.
#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("LLM request failed: {0}")]
    Transport(String),

    #[error("LLM returned no content")]
    EmptyResponse,

    #[error("LLM call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("could not write digest to {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not encode digest metadata: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("mail transport rejected the digest: {0}")]
    Rejected(String),
}

/// Raised while loading or validating configuration, never mid-run.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no research keywords configured")]
    NoKeywords,

    #[error("{name} must be between 1 and 5, got {value}")]
    ThresholdOutOfRange { name: &'static str, value: u8 },

    #[error("relevance_threshold ({relevance}) is above summarize_threshold ({summarize})")]
    ThresholdOrder { relevance: u8, summarize: u8 },

    #[error("summary markers must be non-empty and different from each other")]
    AmbiguousMarkers,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("environment variable {var} has invalid value '{value}': expected {expected}")]
    InvalidVar {
        var: String,
        value: String,
        expected: &'static str,
    },

    #[error("required environment variable {0} is not set")]
    MissingVar(String),
}

/// Terminal error of a run; sets the outcome to `failure`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("retrieval unavailable: all {keywords} keyword queries failed")]
    RetrievalUnavailable { keywords: usize },

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("run cancelled before {stage}")]
    Cancelled { stage: &'static str },
}

/// Why the scheduler refused a trigger.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TriggerError {
    #[error("a run is already in progress")]
    AlreadyRunning,

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("invalid window: {from} is after {to}")]
    InvalidWindow {
        from: chrono::NaiveDate,
        to: chrono::NaiveDate,
    },
}
