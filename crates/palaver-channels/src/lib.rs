//! Channel adapters: one per messaging platform, translating between the
//! platform's transport and the common message abstraction. Adapters hold no
//! durable state; everything persistent lives in the session store.

use async_trait::async_trait;
use palaver_schema::{ChannelPlatform, ContentKind, InboundMessage, SynthesizedAudio};
use thiserror::Error;

pub mod api;
pub mod facebook;
pub mod slack;
pub mod telegram;
pub mod web;
pub mod whatsapp;

pub use api::ApiAdapter;
pub use facebook::FacebookAdapter;
pub use slack::SlackAdapter;
pub use telegram::TelegramAdapter;
pub use web::WebAdapter;
pub use whatsapp::WhatsappAdapter;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Programming-contract violation (wrong adapter wiring, missing
    /// session precondition). Never retried.
    #[error("channel contract violation: {0}")]
    Contract(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("audio fetch failed: {0}")]
    Audio(String),
    #[error("voice replies not supported on {0}")]
    VoiceUnsupported(ChannelPlatform),
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        Self::Delivery(err.to_string())
    }
}

/// Common contract every platform variant implements. Inbound payloads are
/// parsed by the per-platform `parse_*` functions into [`InboundMessage`];
/// the adapter itself covers capability flags, outbound delivery and the
/// transcription/typing callbacks.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn platform(&self) -> ChannelPlatform;

    fn voice_replies_supported(&self) -> bool {
        false
    }

    fn supported_content(&self) -> &[ContentKind] {
        &[ContentKind::Text]
    }

    /// Retrieve the raw audio for a voice message, decoded to a form the
    /// transcription provider accepts.
    async fn fetch_audio(&self, _message: &InboundMessage) -> Result<Vec<u8>, ChannelError> {
        Err(ChannelError::Audio(
            "voice messages not supported on this channel".into(),
        ))
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), ChannelError>;

    async fn send_voice(
        &self,
        _chat_id: &str,
        _audio: &SynthesizedAudio,
    ) -> Result<(), ChannelError> {
        Err(ChannelError::VoiceUnsupported(self.platform()))
    }

    /// Transcription is about to start (e.g. show an upload indicator).
    async fn transcription_started(&self, _chat_id: &str) {}

    /// Transcription finished; adapters may echo the transcript.
    async fn transcription_finished(&self, _chat_id: &str, _transcript: &str) {}

    /// The user input is about to be handed to the model (typing indicator).
    async fn submit_input_to_llm(&self, _chat_id: &str) {}
}

/// Split long replies so each part fits within a platform's message-length
/// limit, preferring newline then whitespace boundaries.
pub fn split_text(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut rest = text;
    while rest.len() > limit {
        let mut end = floor_char_boundary(rest, limit);
        if end == 0 {
            // Limit smaller than the first character; take it whole.
            end = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let window = &rest[..end];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(char::is_whitespace))
            .filter(|&idx| idx > 0)
            .unwrap_or(window.len());
        parts.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
