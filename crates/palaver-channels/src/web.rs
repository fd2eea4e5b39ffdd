//! Web widget channel. The UI reads replies straight from the chat history,
//! so the adapter performs no delivery of its own.

use async_trait::async_trait;
use palaver_schema::{ChannelPlatform, ContentKind};

use crate::{ChannelAdapter, ChannelError};

#[derive(Debug, Default)]
pub struct WebAdapter;

#[async_trait]
impl ChannelAdapter for WebAdapter {
    fn platform(&self) -> ChannelPlatform {
        ChannelPlatform::Web
    }

    fn supported_content(&self) -> &[ContentKind] {
        &[ContentKind::Text]
    }

    async fn send_text(&self, _chat_id: &str, _text: &str) -> Result<(), ChannelError> {
        // Appending the AI message to the history is the delivery.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn web_adapter_is_text_only_and_quiet() {
        let adapter = WebAdapter;
        assert_eq!(adapter.platform(), ChannelPlatform::Web);
        assert!(!adapter.voice_replies_supported());
        assert_eq!(adapter.supported_content(), &[ContentKind::Text]);
        adapter.send_text("chat-1", "reply").await.unwrap();
    }
}
