//! Answer generation providers.
//!
//! - **[`OpenAIChatProvider`]**: `POST /v1/chat/completions`, needs `OPENAI_API_KEY`.
//! - **[`OllamaChatProvider`]**: `POST /api/chat` on a local Ollama instance.
//! - **[`DisabledGenerator`]**: fails every call.
//! - **[`FallbackGenerator`]**: tries a primary, then a secondary on failure.
//!
//! Both HTTP providers share the retry policy in [`crate::http`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{LlmConfig, LlmFallbackConfig};
use crate::error::{RagError, RagResult};
use crate::http;

pub const SYSTEM_PROMPT: &str = "You are an assistant that answers questions using only the \
provided context from the user's documents.\n\
\n\
Guidelines:\n\
1. Base your answer on the context; do not invent facts.\n\
2. Cite the source filename for the information you use.\n\
3. If the context does not contain enough information, say so clearly.\n\
4. Be concise but complete.";

pub fn user_prompt(context: &str, question: &str) -> String {
    format!(
        "Context Information:\n{}\n\nUser Question: {}\n\n\
         Answer based on the context above. If the context does not contain \
         sufficient information to fully answer the question, say so clearly.",
        context, question
    )
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub model: String,
    /// As reported by the provider; estimated from the text otherwise.
    pub tokens: usize,
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> RagResult<Generation>;
}

pub struct DisabledGenerator;

#[async_trait]
impl GenerationProvider for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }

    fn model(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _request: &GenerationRequest) -> RagResult<Generation> {
        Err(RagError::upstream("LLM provider is disabled"))
    }
}

// ============ OpenAI ============

pub struct OpenAIChatProvider {
    model: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChatProvider {
    pub fn new(model: String, settings: &LlmConfig) -> RagResult<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RagError::validation("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
            api_key,
            max_retries: settings.max_retries,
            client: http::build_client(settings.connect_timeout_secs, settings.timeout_secs)?,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAIChatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> RagResult<Generation> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        let json = http::post_json_with_retry(
            &self.client,
            "https://api.openai.com/v1/chat/completions",
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_chat(&json, &self.model)
    }
}

fn parse_openai_chat(json: &serde_json::Value, requested_model: &str) -> RagResult<Generation> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| RagError::upstream("invalid OpenAI response: missing message content"))?
        .to_string();
    let model = json
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or(requested_model)
        .to_string();
    let tokens = json
        .pointer("/usage/completion_tokens")
        .and_then(|t| t.as_u64())
        .map(|t| t as usize)
        .unwrap_or_else(|| crate::chunk::estimate_tokens(&text));
    Ok(Generation {
        text,
        model,
        tokens,
    })
}

// ============ Ollama ============

pub struct OllamaChatProvider {
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaChatProvider {
    pub fn new(model: String, url: Option<String>, settings: &LlmConfig) -> RagResult<Self> {
        let url = url.unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model,
            url: url.trim_end_matches('/').to_string(),
            max_retries: settings.max_retries,
            client: http::build_client(settings.connect_timeout_secs, settings.timeout_secs)?,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaChatProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> RagResult<Generation> {
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "options": {
                "num_predict": request.max_tokens,
                "temperature": request.temperature,
            },
        });
        let json = http::post_json_with_retry(
            &self.client,
            &format!("{}/api/chat", self.url),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        parse_ollama_chat(&json, &self.model)
    }
}

fn parse_ollama_chat(json: &serde_json::Value, requested_model: &str) -> RagResult<Generation> {
    let text = json
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| RagError::upstream("invalid Ollama response: missing message content"))?
        .to_string();
    let tokens = json
        .get("eval_count")
        .and_then(|t| t.as_u64())
        .map(|t| t as usize)
        .unwrap_or_else(|| crate::chunk::estimate_tokens(&text));
    Ok(Generation {
        text,
        model: json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(requested_model)
            .to_string(),
        tokens,
    })
}

// ============ Fallback ============

pub struct FallbackGenerator {
    primary: Arc<dyn GenerationProvider>,
    secondary: Arc<dyn GenerationProvider>,
}

impl FallbackGenerator {
    pub fn new(primary: Arc<dyn GenerationProvider>, secondary: Arc<dyn GenerationProvider>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl GenerationProvider for FallbackGenerator {
    fn name(&self) -> &str {
        self.primary.name()
    }

    fn model(&self) -> &str {
        self.primary.model()
    }

    async fn generate(&self, request: &GenerationRequest) -> RagResult<Generation> {
        match self.primary.generate(request).await {
            Ok(generation) => Ok(generation),
            Err(e) => {
                tracing::warn!(
                    primary = self.primary.name(),
                    fallback = self.secondary.name(),
                    error = %e,
                    "primary LLM failed, trying fallback"
                );
                self.secondary.generate(request).await
            }
        }
    }
}

fn build_one(
    provider: &str,
    model: Option<&String>,
    url: Option<&String>,
    settings: &LlmConfig,
) -> RagResult<Arc<dyn GenerationProvider>> {
    let model = || {
        model
            .cloned()
            .ok_or_else(|| RagError::validation(format!("a model is required for '{}'", provider)))
    };
    match provider {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAIChatProvider::new(model()?, settings)?)),
        "ollama" => Ok(Arc::new(OllamaChatProvider::new(
            model()?,
            url.cloned(),
            settings,
        )?)),
        other => Err(RagError::validation(format!(
            "unknown LLM provider: {}",
            other
        ))),
    }
}

/// Build the configured generator, wrapped in a [`FallbackGenerator`] when
/// `[llm.fallback]` is set.
pub fn create_generator(settings: &LlmConfig) -> RagResult<Arc<dyn GenerationProvider>> {
    let primary = build_one(
        &settings.provider,
        settings.model.as_ref(),
        settings.url.as_ref(),
        settings,
    )?;
    match &settings.fallback {
        Some(LlmFallbackConfig {
            provider,
            model,
            url,
        }) => {
            let secondary = build_one(provider, model.as_ref(), url.as_ref(), settings)?;
            Ok(Arc::new(FallbackGenerator::new(primary, secondary)))
        }
        None => Ok(primary),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GenerationProvider for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn model(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _request: &GenerationRequest) -> RagResult<Generation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RagError::upstream("503"));
            }
            Ok(Generation {
                text: format!("answer from {}", self.name),
                model: "scripted".to_string(),
                tokens: 3,
            })
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            system: SYSTEM_PROMPT.to_string(),
            user: user_prompt("Source: a.txt\nContent: x", "what?"),
            max_tokens: 100,
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn test_fallback_used_on_primary_failure() {
        let primary = Arc::new(Scripted {
            name: "primary",
            fail: true,
            calls: AtomicUsize::new(0),
        });
        let secondary = Arc::new(Scripted {
            name: "secondary",
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let generator = FallbackGenerator::new(primary.clone(), secondary.clone());

        let out = generator.generate(&request()).await.unwrap();
        assert_eq!(out.text, "answer from secondary");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_skipped_on_primary_success() {
        let primary = Arc::new(Scripted {
            name: "primary",
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let secondary = Arc::new(Scripted {
            name: "secondary",
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let generator = FallbackGenerator::new(primary, secondary.clone());
        generator.generate(&request()).await.unwrap();
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_user_prompt_contains_context_and_question() {
        let prompt = user_prompt("Source: a.txt\nContent: refunds in 30 days", "refund window?");
        assert!(prompt.contains("Source: a.txt"));
        assert!(prompt.contains("User Question: refund window?"));
        assert!(SYSTEM_PROMPT.contains("Cite the source filename"));
    }

    #[test]
    fn test_parse_openai_chat() {
        let json = serde_json::json!({
            "model": "gpt-4o-mini-2024",
            "choices": [{ "message": { "role": "assistant", "content": "Thirty days." } }],
            "usage": { "completion_tokens": 4 }
        });
        let out = parse_openai_chat(&json, "gpt-4o-mini").unwrap();
        assert_eq!(out.text, "Thirty days.");
        assert_eq!(out.model, "gpt-4o-mini-2024");
        assert_eq!(out.tokens, 4);
        assert!(parse_openai_chat(&serde_json::json!({}), "m").is_err());
    }

    #[test]
    fn test_parse_ollama_chat_estimates_tokens() {
        let json = serde_json::json!({ "message": { "content": "12345678" } });
        let out = parse_ollama_chat(&json, "llama3").unwrap();
        assert_eq!(out.model, "llama3");
        assert_eq!(out.tokens, 2);
    }

    #[tokio::test]
    async fn test_disabled_generator() {
        let generator = create_generator(&LlmConfig::default()).unwrap();
        assert_eq!(generator.name(), "disabled");
        assert!(generator.generate(&request()).await.is_err());
    }
}
