use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::resilience::{Guard, RetryPolicy};

/// Text completion used only for Copilot rationale wording.
#[async_trait]
pub trait RationaleLlm: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

#[derive(Serialize)]
struct Request<'a> {
    model: &'a str,
    temperature: f64,
    response_format: ResponseFormat,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct Response {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// OpenAI-compatible chat completions client. Responses are cached by a
/// hash of the prompt content.
pub struct OpenAiLlm {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    cache: Cache<u64, String>,
    guard: Arc<Guard>,
}

impl OpenAiLlm {
    /// `None` when no API key is configured.
    pub fn from_config(cfg: &Config, guard: Arc<Guard>) -> Result<Option<Self>> {
        let Some(api_key) = cfg.openai_api_key.clone() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.llm_timeout_secs.max(1)))
            .build()?;
        let cache = Cache::builder()
            .max_capacity(1_000)
            .time_to_live(Duration::from_secs(cfg.llm_cache_ttl_secs.max(1)))
            .build();
        Ok(Some(Self {
            client,
            api_url: cfg.llm_api_base.clone(),
            api_key,
            model: cfg.llm_model.clone(),
            cache,
            guard,
        }))
    }

    /// Guard for this client honouring LLM_MAX_RETRIES.
    pub fn guard(cfg: &Config) -> Guard {
        Guard::new(
            "llm",
            Duration::from_secs(cfg.llm_timeout_secs.max(1)),
            crate::config::resilience::LLM_MAX_IN_FLIGHT,
        )
        .with_retry(RetryPolicy {
            max_retries: cfg.llm_max_retries,
            ..RetryPolicy::default()
        })
    }
}

pub fn content_hash(system: &str, user: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    system.hash(&mut hasher);
    user.hash(&mut hasher);
    hasher.finish()
}

#[async_trait]
impl RationaleLlm for OpenAiLlm {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let key = content_hash(system, user);
        if let Some(hit) = self.cache.get(&key).await {
            debug!("[LLM] cache hit");
            return Ok(hit);
        }

        let request = Request {
            model: &self.model,
            temperature: 0.2,
            response_format: ResponseFormat { kind: "json_object" },
            messages: vec![
                Message { role: "system", content: system },
                Message { role: "user", content: user },
            ],
        };
        let (client, url, key_header, request) = (
            &self.client,
            self.api_url.as_str(),
            format!("Bearer {}", self.api_key),
            &request,
        );
        let key_header = key_header.as_str();

        let content = self
            .guard
            .call(|| async move {
                let response = client
                    .post(url)
                    .header("Authorization", key_header)
                    .json(request)
                    .send()
                    .await?;
                let status = response.status();
                if status.is_server_error() || status.as_u16() == 429 {
                    return Err(AppError::Llm(format!("chat completion returned {status}")));
                }
                let body: Response = response.error_for_status()?.json().await?;
                body.choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .ok_or_else(|| AppError::Llm("empty choices".to_string()))
            })
            .await?;

        self.cache.insert(key, content.clone()).await;
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_json_mode() {
        let req = Request {
            model: "gpt-4o-mini",
            temperature: 0.2,
            response_format: ResponseFormat { kind: "json_object" },
            messages: vec![Message { role: "system", content: "s" }],
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["response_format"]["type"], "json_object");
        assert_eq!(v["messages"][0]["role"], "system");
    }

    #[test]
    fn response_deserializes_first_choice() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"{\"recommendation\":\"WAIT\"}"}}]}"#;
        let parsed: Response = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "{\"recommendation\":\"WAIT\"}");
    }

    #[test]
    fn content_hash_depends_on_both_prompts() {
        assert_eq!(content_hash("a", "b"), content_hash("a", "b"));
        assert_ne!(content_hash("a", "b"), content_hash("ab", ""));
    }
}
