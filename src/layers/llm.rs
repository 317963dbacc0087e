//! LLM completion client.
//!
//! The pipeline only needs "prompt in, text out"; [`OpenAiClient`] speaks the
//! OpenAI chat-completions protocol, so any compatible endpoint works
//! (OpenAI, DeepSeek, Moonshot, a local vLLM, ...).

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::CompletionError;
use crate::layers::retry::{retry, Delay, Exhausted, RetryPolicy};

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, CompletionError>;
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub api_base_url: String,
    pub model_name: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    settings: LlmSettings,
}

impl OpenAiClient {
    pub fn new(settings: LlmSettings) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&settings.api_key)
            .with_api_base(&settings.api_base_url);

        Self {
            client: Client::with_config(openai_config),
            settings,
        }
    }

    async fn chat(&self, prompt: &str) -> Result<String, CompletionError> {
        let mut messages = Vec::new();

        if let Some(sys_msg) = &self.settings.system_prompt {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(sys_msg.as_str())
                .build()
                .map_err(|e| CompletionError::Transport(e.to_string()))?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(|e| CompletionError::Transport(e.to_string()))?;
        messages.push(ChatCompletionRequestMessage::User(user_msg));

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.settings.model_name)
            .messages(messages)
            .temperature(self.settings.temperature)
            .max_tokens(self.settings.max_tokens)
            .build()
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("LLM API call failed: {}", e);
            CompletionError::Transport(e.to_string())
        })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(CompletionError::EmptyResponse)?;

        let content = content.trim();
        if content.is_empty() {
            return Err(CompletionError::EmptyResponse);
        }
        Ok(content.to_string())
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, CompletionError> {
        debug!(
            "Calling LLM, model: {}, prompt length: {} chars",
            self.settings.model_name,
            prompt.len()
        );
        match tokio::time::timeout(timeout, self.chat(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout(timeout)),
        }
    }
}

/// One failed attempt: either the call itself or its reply was unusable.
#[derive(thiserror::Error, Debug)]
pub enum AttemptError {
    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// Shared LLM call settings for the scoring and summarizing stages.
#[derive(Clone)]
pub struct LlmCaller {
    pub client: Arc<dyn LlmClient>,
    pub delay: Arc<dyn Delay>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    /// Max in-flight calls within one stage.
    pub concurrency: usize,
}

impl LlmCaller {
    /// Call the model until `parse` accepts a reply or attempts run out.
    /// Transport errors, timeouts and malformed replies all consume an attempt.
    pub async fn call_parsed<T, P>(&self, label: &str, prompt: &str, parse: P) -> Result<(T, u32), Exhausted>
    where
        P: Fn(&str) -> Result<T, String> + Sync,
        T: Send,
    {
        let parse = &parse;
        retry(&self.retry, self.delay.as_ref(), label, |_| async move {
            let reply = self.client.complete(prompt, self.timeout).await?;
            parse(&reply).map_err(AttemptError::Malformed)
        })
        .await
    }
}
