//! Facebook Messenger channel: webhook events in, Graph API sends out.

use async_trait::async_trait;
use palaver_schema::{ChannelPlatform, ContentKind, InboundMessage, MessageContent};

use crate::{split_text, ChannelAdapter, ChannelError};

/// Messenger caps a text message at 2000 characters.
pub const FACEBOOK_MESSAGE_LIMIT: usize = 2000;

const SUPPORTED: &[ContentKind] = &[ContentKind::Text, ContentKind::Voice];

/// Fields pulled out of the Messenger webhook envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacebookMessage {
    pub user_id: String,
    pub page_id: String,
    pub message: InboundMessage,
}

/// Parse a Messenger webhook body. Field paths are Meta's, verbatim:
/// `entry[0].messaging[0]` with `sender.id`, `recipient.id`, `message.text`
/// and `message.attachments[0].payload.url`.
pub fn parse_webhook(raw: &str) -> Result<Option<FacebookMessage>, ChannelError> {
    let data: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ChannelError::Contract(format!("invalid facebook webhook: {e}")))?;

    let Some(messaging) = data["entry"][0]["messaging"][0].as_object() else {
        return Ok(None);
    };

    let sender_id = messaging["sender"]["id"]
        .as_str()
        .ok_or_else(|| ChannelError::Contract("facebook webhook missing sender.id".into()))?;
    let page_id = messaging["recipient"]["id"]
        .as_str()
        .ok_or_else(|| ChannelError::Contract("facebook webhook missing recipient.id".into()))?;

    let message = &messaging["message"];
    let attachments = message["attachments"].as_array();
    let content = match attachments.and_then(|a| a.first()) {
        Some(attachment) => {
            let kind = attachment["type"].as_str().unwrap_or("unknown");
            let url = attachment["payload"]["url"].as_str().unwrap_or_default();
            if kind == "audio" {
                MessageContent::Voice {
                    media_id: url.to_string(),
                }
            } else {
                MessageContent::Unsupported {
                    content_type: kind.to_string(),
                }
            }
        }
        None => MessageContent::Text {
            body: message["text"].as_str().unwrap_or_default().to_string(),
        },
    };

    Ok(Some(FacebookMessage {
        user_id: sender_id.to_string(),
        page_id: page_id.to_string(),
        message: InboundMessage {
            chat_id: sender_id.to_string(),
            content,
            message_id: message["mid"].as_str().map(str::to_owned),
            channel_ref: None,
            thread_id: None,
        },
    }))
}

pub struct FacebookAdapter {
    page_id: String,
    page_access_token: String,
    http: reqwest::Client,
    api_base: String,
}

impl FacebookAdapter {
    pub fn new(page_id: impl Into<String>, page_access_token: impl Into<String>) -> Self {
        Self {
            page_id: page_id.into(),
            page_access_token: page_access_token.into(),
            http: reqwest::Client::new(),
            api_base: "https://graph.facebook.com/v19.0".into(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ChannelAdapter for FacebookAdapter {
    fn platform(&self) -> ChannelPlatform {
        ChannelPlatform::Facebook
    }

    fn supported_content(&self) -> &[ContentKind] {
        SUPPORTED
    }

    async fn fetch_audio(&self, message: &InboundMessage) -> Result<Vec<u8>, ChannelError> {
        let MessageContent::Voice { media_id } = &message.content else {
            return Err(ChannelError::Contract(
                "fetch_audio called for a non-voice message".into(),
            ));
        };

        // Attachment URLs are pre-signed; no extra auth needed.
        let resp = self
            .http
            .get(media_id)
            .send()
            .await
            .map_err(|e| ChannelError::Audio(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ChannelError::Audio(format!(
                "attachment fetch returned {}",
                resp.status()
            )));
        }
        Ok(resp
            .bytes()
            .await
            .map_err(|e| ChannelError::Audio(e.to_string()))?
            .to_vec())
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let url = format!("{}/{}/messages", self.api_base, self.page_id);
        for part in split_text(text, FACEBOOK_MESSAGE_LIMIT) {
            let resp = self
                .http
                .post(&url)
                .query(&[("access_token", self.page_access_token.as_str())])
                .json(&serde_json::json!({
                    "recipient": {"id": chat_id},
                    "messaging_type": "RESPONSE",
                    "message": {"text": part},
                }))
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(ChannelError::Delivery(format!(
                    "graph send returned {status}: {body}"
                )));
            }
        }
        Ok(())
    }

    async fn transcription_finished(&self, chat_id: &str, transcript: &str) {
        let echo = format!("I heard: \"{transcript}\"");
        if let Err(err) = self.send_text(chat_id, &echo).await {
            tracing::warn!("failed to echo facebook transcript: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn webhook(message: serde_json::Value) -> String {
        serde_json::json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "time": 1690000000,
                "messaging": [{
                    "sender": {"id": "user-9"},
                    "recipient": {"id": "page-1"},
                    "timestamp": 1690000000,
                    "message": message
                }]
            }]
        })
        .to_string()
    }

    #[test]
    fn parse_text_webhook() {
        let raw = webhook(serde_json::json!({"mid": "m-1", "text": "Hi there"}));
        let parsed = parse_webhook(&raw).unwrap().expect("message expected");
        assert_eq!(parsed.user_id, "user-9");
        assert_eq!(parsed.page_id, "page-1");
        assert_eq!(parsed.message.body(), Some("Hi there"));
        assert_eq!(parsed.message.message_id.as_deref(), Some("m-1"));
    }

    #[test]
    fn parse_audio_attachment_webhook() {
        let raw = webhook(serde_json::json!({
            "mid": "m-2",
            "attachments": [{
                "type": "audio",
                "payload": {"url": "https://cdn.fbsbx.com/audio.mp4"}
            }]
        }));
        let parsed = parse_webhook(&raw).unwrap().unwrap();
        assert_eq!(
            parsed.message.content,
            MessageContent::Voice {
                media_id: "https://cdn.fbsbx.com/audio.mp4".into()
            }
        );
    }

    #[test]
    fn parse_image_attachment_is_unsupported() {
        let raw = webhook(serde_json::json!({
            "attachments": [{
                "type": "image",
                "payload": {"url": "https://cdn.fbsbx.com/pic.jpg"}
            }]
        }));
        let parsed = parse_webhook(&raw).unwrap().unwrap();
        assert_eq!(
            parsed.message.content,
            MessageContent::Unsupported {
                content_type: "image".into()
            }
        );
    }

    #[test]
    fn parse_non_message_event_is_none() {
        let raw = serde_json::json!({"object": "page", "entry": [{"id": "x"}]}).to_string();
        assert!(parse_webhook(&raw).unwrap().is_none());
    }

    #[tokio::test]
    async fn send_text_posts_to_graph_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/page-1/messages"))
            .and(query_param("access_token", "tok"))
            .and(body_partial_json(serde_json::json!({
                "recipient": {"id": "user-9"},
                "message": {"text": "hello"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "recipient_id": "user-9", "message_id": "mid.1"
            })))
            .mount(&server)
            .await;

        let adapter = FacebookAdapter::new("page-1", "tok").with_api_base(server.uri());
        adapter.send_text("user-9", "hello").await.unwrap();
    }

    #[tokio::test]
    async fn send_text_surfaces_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/page-1/messages"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad token"))
            .mount(&server)
            .await;

        let adapter = FacebookAdapter::new("page-1", "tok").with_api_base(server.uri());
        assert!(matches!(
            adapter.send_text("user-9", "hello").await,
            Err(ChannelError::Delivery(_))
        ));
    }
}
