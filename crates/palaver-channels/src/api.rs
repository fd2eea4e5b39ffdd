//! Generic API channel. The caller receives the reply synchronously; there
//! is no push transport to deliver through.

use async_trait::async_trait;
use palaver_schema::{ChannelPlatform, ContentKind};

use crate::{ChannelAdapter, ChannelError};

#[derive(Debug, Default)]
pub struct ApiAdapter;

#[async_trait]
impl ChannelAdapter for ApiAdapter {
    fn platform(&self) -> ChannelPlatform {
        ChannelPlatform::Api
    }

    fn supported_content(&self) -> &[ContentKind] {
        &[ContentKind::Text]
    }

    async fn send_text(&self, _chat_id: &str, _text: &str) -> Result<(), ChannelError> {
        // The handler's return value is the response body.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_schema::SynthesizedAudio;

    #[tokio::test]
    async fn api_adapter_rejects_voice_delivery() {
        let adapter = ApiAdapter;
        let audio = SynthesizedAudio {
            audio: vec![1],
            duration_secs: 0.4,
            format: "mp3".into(),
        };
        let err = adapter.send_voice("chat-1", &audio).await.err().unwrap();
        assert!(matches!(err, ChannelError::VoiceUnsupported(_)));
    }
}
