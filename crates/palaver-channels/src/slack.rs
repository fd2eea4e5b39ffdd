//! Slack channel: Events API payloads in, Web API sends out. Replies are
//! always addressed to a thread, derived from the inbound message or from
//! the session's persisted external conversation id.

use async_trait::async_trait;
use palaver_schema::{ChannelPlatform, ContentKind, InboundMessage, MessageContent};
use serde::Deserialize;

use crate::{split_text, ChannelAdapter, ChannelError};

pub const SLACK_MESSAGE_LIMIT: usize = 4000;

/// Events API envelope (subset).
#[derive(Debug, Deserialize)]
pub struct EventCallback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub event: Option<SlackEvent>,
}

#[derive(Debug, Deserialize)]
pub struct SlackEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    /// Present on messages posted by bots (including ourselves).
    #[serde(default)]
    pub bot_id: Option<String>,
}

/// Parse an event callback into the common message shape. Bot messages and
/// non-message events yield `None`.
pub fn parse_event(raw: &str) -> Result<Option<InboundMessage>, ChannelError> {
    let envelope: EventCallback = serde_json::from_str(raw)
        .map_err(|e| ChannelError::Contract(format!("invalid slack event: {e}")))?;
    if envelope.kind != "event_callback" {
        return Ok(None);
    }
    let Some(event) = envelope.event else {
        return Ok(None);
    };
    if event.kind != "message" || event.bot_id.is_some() {
        return Ok(None);
    }
    let (Some(channel), Some(user)) = (event.channel, event.user) else {
        return Ok(None);
    };

    // Replies belong in the thread rooted at the triggering message.
    let thread_ts = event.thread_ts.or_else(|| event.ts.clone());

    Ok(Some(InboundMessage {
        chat_id: user,
        content: MessageContent::Text {
            body: event.text.unwrap_or_default(),
        },
        message_id: event.ts,
        channel_ref: Some(channel),
        thread_id: thread_ts,
    }))
}

/// Compose the session's external conversation id from channel and thread.
pub fn session_external_id(channel_id: &str, thread_ts: &str) -> String {
    format!("{channel_id}:{thread_ts}")
}

/// Inverse of [`session_external_id`].
pub fn parse_session_external_id(external_id: &str) -> Result<(String, String), ChannelError> {
    external_id
        .split_once(':')
        .map(|(channel, thread)| (channel.to_string(), thread.to_string()))
        .ok_or_else(|| {
            ChannelError::Contract(format!("malformed slack external id: {external_id}"))
        })
}

pub struct SlackAdapter {
    bot_token: String,
    /// Target resolved at construction: from the inbound message, or from
    /// the session's external id when no message is in hand.
    channel_id: Option<String>,
    thread_ts: Option<String>,
    /// Listener-managed flows send replies themselves.
    send_response_to_user: bool,
    http: reqwest::Client,
    api_base: String,
}

impl SlackAdapter {
    pub fn for_message(bot_token: impl Into<String>, message: &InboundMessage) -> Self {
        Self {
            bot_token: bot_token.into(),
            channel_id: message.channel_ref.clone(),
            thread_ts: message.thread_id.clone(),
            send_response_to_user: true,
            http: reqwest::Client::new(),
            api_base: "https://slack.com/api".into(),
        }
    }

    pub fn for_session(
        bot_token: impl Into<String>,
        external_id: &str,
    ) -> Result<Self, ChannelError> {
        let (channel_id, thread_ts) = parse_session_external_id(external_id)?;
        Ok(Self {
            bot_token: bot_token.into(),
            channel_id: Some(channel_id),
            thread_ts: Some(thread_ts),
            send_response_to_user: true,
            http: reqwest::Client::new(),
            api_base: "https://slack.com/api".into(),
        })
    }

    pub fn silent(mut self) -> Self {
        self.send_response_to_user = false;
        self
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn platform(&self) -> ChannelPlatform {
        ChannelPlatform::Slack
    }

    fn supported_content(&self) -> &[ContentKind] {
        &[ContentKind::Text]
    }

    async fn send_text(&self, _chat_id: &str, text: &str) -> Result<(), ChannelError> {
        if !self.send_response_to_user {
            return Ok(());
        }
        let channel = self.channel_id.as_deref().ok_or_else(|| {
            ChannelError::Contract("slack adapter has no channel to reply to".into())
        })?;

        let url = format!("{}/chat.postMessage", self.api_base);
        for part in split_text(text, SLACK_MESSAGE_LIMIT) {
            let mut body = serde_json::json!({"channel": channel, "text": part});
            if let Some(thread_ts) = &self.thread_ts {
                body["thread_ts"] = serde_json::Value::String(thread_ts.clone());
            }
            let resp = self
                .http
                .post(&url)
                .bearer_auth(&self.bot_token)
                .json(&body)
                .send()
                .await?;
            let reply: PostMessageResponse = resp
                .json()
                .await
                .map_err(|e| ChannelError::Delivery(e.to_string()))?;
            if !reply.ok {
                return Err(ChannelError::Delivery(format!(
                    "chat.postMessage failed: {}",
                    reply.error.unwrap_or_else(|| "unknown error".into())
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event_json(event: serde_json::Value) -> String {
        serde_json::json!({
            "type": "event_callback",
            "team_id": "T1",
            "event": event
        })
        .to_string()
    }

    #[test]
    fn parse_channel_message() {
        let raw = event_json(serde_json::json!({
            "type": "message",
            "channel": "C123",
            "user": "U789",
            "text": "hello bot",
            "ts": "1712000000.000100"
        }));
        let msg = parse_event(&raw).unwrap().expect("message expected");
        assert_eq!(msg.chat_id, "U789");
        assert_eq!(msg.channel_ref.as_deref(), Some("C123"));
        // A top-level message roots its own thread.
        assert_eq!(msg.thread_id.as_deref(), Some("1712000000.000100"));
    }

    #[test]
    fn parse_thread_reply_keeps_root_thread() {
        let raw = event_json(serde_json::json!({
            "type": "message",
            "channel": "C123",
            "user": "U789",
            "text": "follow-up",
            "ts": "1712000010.000200",
            "thread_ts": "1712000000.000100"
        }));
        let msg = parse_event(&raw).unwrap().unwrap();
        assert_eq!(msg.thread_id.as_deref(), Some("1712000000.000100"));
    }

    #[test]
    fn bot_messages_are_ignored() {
        let raw = event_json(serde_json::json!({
            "type": "message",
            "channel": "C123",
            "bot_id": "B1",
            "text": "echo"
        }));
        assert!(parse_event(&raw).unwrap().is_none());
    }

    #[test]
    fn url_verification_is_not_a_message() {
        let raw = serde_json::json!({
            "type": "url_verification",
            "challenge": "abc"
        })
        .to_string();
        assert!(parse_event(&raw).unwrap().is_none());
    }

    #[test]
    fn external_id_round_trip() {
        let id = session_external_id("C123", "1712.100");
        assert_eq!(id, "C123:1712.100");
        let (channel, thread) = parse_session_external_id(&id).unwrap();
        assert_eq!(channel, "C123");
        assert_eq!(thread, "1712.100");
        assert!(parse_session_external_id("no-separator").is_err());
    }

    #[tokio::test]
    async fn send_text_targets_the_thread() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .and(body_partial_json(serde_json::json!({
                "channel": "C123",
                "thread_ts": "1712.100"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})),
            )
            .mount(&server)
            .await;

        let message = InboundMessage {
            chat_id: "U789".into(),
            content: MessageContent::Text { body: "hi".into() },
            message_id: None,
            channel_ref: Some("C123".into()),
            thread_id: Some("1712.100".into()),
        };
        let adapter = SlackAdapter::for_message("xoxb-1", &message).with_api_base(server.uri());
        adapter.send_text("U789", "reply").await.unwrap();
    }

    #[tokio::test]
    async fn send_text_reports_api_level_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": false, "error": "channel_not_found"
            })))
            .mount(&server)
            .await;

        let adapter = SlackAdapter::for_session("xoxb-1", "C404:1712.1")
            .unwrap()
            .with_api_base(server.uri());
        let err = adapter.send_text("U1", "reply").await.err().unwrap();
        assert!(err.to_string().contains("channel_not_found"));
    }

    #[tokio::test]
    async fn silent_adapter_skips_delivery() {
        let message = InboundMessage {
            chat_id: "U789".into(),
            content: MessageContent::Text { body: "hi".into() },
            message_id: None,
            channel_ref: Some("C123".into()),
            thread_id: None,
        };
        // No mock server mounted: a real send would fail loudly.
        let adapter = SlackAdapter::for_message("xoxb-1", &message)
            .silent()
            .with_api_base("http://127.0.0.1:1");
        adapter.send_text("U789", "reply").await.unwrap();
    }
}
