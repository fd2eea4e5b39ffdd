pub mod assistant;
pub mod openai;
pub mod speech;
pub mod types;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::iter as stream_iter;

pub use assistant::{AssistantClient, AssistantError, Run, RunStatus};
pub use openai::OpenAiProvider;
pub use speech::{OpenAiSpeech, SpeechProvider, StubSpeech};
pub use types::*;

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse>;

    async fn stream(&self, _request: LlmRequest) -> Result<TokenStream> {
        anyhow::bail!("streaming not supported by this provider")
    }

    /// Whether this provider can also transcribe audio (used before falling
    /// back to the experiment's voice provider).
    fn supports_transcription(&self) -> bool {
        false
    }

    async fn transcribe_audio(&self, _audio: Vec<u8>, _filename: &str) -> Result<String> {
        anyhow::bail!("transcription not supported by this provider")
    }
}

// ============================================================
// Provider configuration
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OpenAI,
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.provider_type {
        ProviderType::OpenAI => {
            let key = config
                .api_key
                .as_ref()
                .ok_or_else(|| anyhow!("openai requires api_key"))?;
            let base_url = config
                .base_url
                .as_deref()
                .unwrap_or("https://api.openai.com/v1");
            Arc::new(OpenAiProvider::new(key.clone(), base_url))
        }
        ProviderType::Stub => Arc::new(StubProvider::default()),
    };
    Ok(provider)
}

// ============================================================
// Registries
// ============================================================

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("llm provider not found: {id}"))
    }
}

#[derive(Default, Clone)]
pub struct SpeechRegistry {
    providers: HashMap<String, Arc<dyn SpeechProvider>>,
}

impl SpeechRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn SpeechProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn SpeechProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("speech provider not found: {id}"))
    }
}

pub fn register_from_configs(
    registry: &mut ProviderRegistry,
    configs: &[ProviderConfig],
) -> Result<()> {
    for config in configs {
        let provider = create_provider(config)?;
        registry.register(&config.id, provider);
        tracing::info!(
            "registered llm provider: {} ({:?})",
            config.id,
            config.provider_type
        );
    }
    Ok(())
}

// ============================================================
// Stub provider for tests and offline runs
// ============================================================

/// Scripted provider: pops canned responses in order and records every
/// request it sees.
#[derive(Default)]
pub struct StubProvider {
    responses: Mutex<Vec<String>>,
    calls: Mutex<Vec<LlmRequest>>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl StubProvider {
    pub fn with_responses(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().rev().map(str::to_owned).collect()),
            calls: Mutex::new(Vec::new()),
            prompt_tokens: 30,
            completion_tokens: 20,
        }
    }

    pub fn calls(&self) -> Vec<LlmRequest> {
        self.calls.lock().expect("stub lock poisoned").clone()
    }

    fn next_response(&self, request: &LlmRequest) -> String {
        let mut responses = self.responses.lock().expect("stub lock poisoned");
        responses.pop().unwrap_or_else(|| {
            let user_text = request.messages.last().map(|m| m.text()).unwrap_or_default();
            format!("[stub:{}] {user_text}", request.model)
        })
    }
}

#[async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let text = self.next_response(&request);
        self.calls.lock().expect("stub lock poisoned").push(request);
        Ok(LlmResponse {
            text: text.clone(),
            content: vec![ContentBlock::Text { text }],
            input_tokens: Some(self.prompt_tokens),
            output_tokens: Some(self.completion_tokens),
            stop_reason: Some("stop".into()),
        })
    }

    async fn stream(&self, request: LlmRequest) -> Result<TokenStream> {
        let text = self.next_response(&request);
        self.calls.lock().expect("stub lock poisoned").push(request);

        let mut chunks: Vec<Result<StreamChunk>> = text
            .split_inclusive(' ')
            .map(|word| {
                Ok(StreamChunk {
                    delta: word.to_string(),
                    is_final: false,
                    input_tokens: None,
                    output_tokens: None,
                    stop_reason: None,
                })
            })
            .collect();
        chunks.push(Ok(StreamChunk {
            delta: String::new(),
            is_final: true,
            input_tokens: Some(self.prompt_tokens),
            output_tokens: Some(self.completion_tokens),
            stop_reason: Some("stop".into()),
        }));

        Ok(Box::pin(stream_iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn registry_get_unknown_fails() {
        let registry = ProviderRegistry::new();
        let err = registry.get("missing").err().unwrap();
        assert!(err.to_string().contains("llm provider not found: missing"));
    }

    #[test]
    fn registry_get_registered_succeeds() {
        let mut registry = ProviderRegistry::new();
        registry.register("stub", Arc::new(StubProvider::default()));
        assert!(registry.get("stub").is_ok());
    }

    #[tokio::test]
    async fn stub_provider_pops_scripted_responses() {
        let provider = StubProvider::with_responses(vec!["first", "second"]);
        let req = LlmRequest::simple("m".into(), None, "hi".into());
        assert_eq!(provider.chat(req.clone()).await.unwrap().text, "first");
        assert_eq!(provider.chat(req).await.unwrap().text, "second");
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn stub_provider_stream_reassembles_response() {
        let provider = StubProvider::with_responses(vec!["hello streaming world"]);
        let req = LlmRequest::simple("m".into(), None, "hi".into());
        let mut stream = provider.stream(req).await.unwrap();

        let mut collected = String::new();
        let mut got_final = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            if chunk.is_final {
                got_final = true;
                assert_eq!(chunk.output_tokens, Some(20));
            } else {
                collected.push_str(&chunk.delta);
            }
        }
        assert!(got_final);
        assert_eq!(collected, "hello streaming world");
    }

    #[tokio::test]
    async fn default_transcription_is_unsupported() {
        let provider = StubProvider::default();
        assert!(!provider.supports_transcription());
        assert!(provider
            .transcribe_audio(vec![1, 2, 3], "a.wav")
            .await
            .is_err());
    }

    #[test]
    fn create_provider_from_config() {
        let config = ProviderConfig {
            id: "openai".into(),
            provider_type: ProviderType::OpenAI,
            api_key: Some("sk-test".into()),
            base_url: None,
        };
        assert!(create_provider(&config).is_ok());

        let missing_key = ProviderConfig {
            id: "openai".into(),
            provider_type: ProviderType::OpenAI,
            api_key: None,
            base_url: None,
        };
        assert!(create_provider(&missing_key).is_err());
    }
}
