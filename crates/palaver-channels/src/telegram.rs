//! Telegram channel: Bot API webhook updates in, Bot API sends out.

use async_trait::async_trait;
use palaver_schema::{
    ChannelPlatform, ContentKind, InboundMessage, MessageContent, SynthesizedAudio,
};
use serde::Deserialize;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId, InputFile};

use crate::{split_text, ChannelAdapter, ChannelError};

/// Bot API hard limit for a single text message.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

const SUPPORTED: &[ContentKind] = &[ContentKind::Text, ContentKind::Voice];

// ============================================================
// Wire shapes (Bot API Update JSON)
// ============================================================

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<UpdateMessage>,
    /// Bot membership changes; not user messages.
    #[serde(default)]
    pub my_chat_member: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMessage {
    pub message_id: i64,
    pub chat: UpdateChat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub voice: Option<UpdateVoice>,
    #[serde(default)]
    pub photo: Option<serde_json::Value>,
    #[serde(default)]
    pub sticker: Option<serde_json::Value>,
    #[serde(default)]
    pub document: Option<serde_json::Value>,
    #[serde(default)]
    pub video: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateVoice {
    pub file_id: String,
    #[serde(default)]
    pub duration: u32,
}

/// Parse a webhook update into the common message shape.
///
/// Returns `Ok(None)` for updates that are not user messages, notably
/// `my_chat_member` membership changes, which must be silently ignored.
pub fn parse_update(raw: &str) -> Result<Option<InboundMessage>, ChannelError> {
    let update: Update = serde_json::from_str(raw)
        .map_err(|e| ChannelError::Contract(format!("invalid telegram update: {e}")))?;

    if update.my_chat_member.is_some() {
        return Ok(None);
    }
    let Some(message) = update.message else {
        return Ok(None);
    };

    let content = if let Some(text) = message.text {
        MessageContent::Text { body: text }
    } else if let Some(voice) = message.voice {
        MessageContent::Voice {
            media_id: voice.file_id,
        }
    } else {
        let content_type = if message.photo.is_some() {
            "photo"
        } else if message.sticker.is_some() {
            "sticker"
        } else if message.document.is_some() {
            "document"
        } else if message.video.is_some() {
            "video"
        } else {
            "unknown"
        };
        MessageContent::Unsupported {
            content_type: content_type.into(),
        }
    };

    Ok(Some(InboundMessage {
        chat_id: message.chat.id.to_string(),
        content,
        message_id: Some(message.message_id.to_string()),
        channel_ref: None,
        thread_id: None,
    }))
}

pub struct TelegramAdapter {
    bot: Bot,
    token: String,
    http: reqwest::Client,
    api_base: String,
}

impl TelegramAdapter {
    pub fn new(bot_token: impl Into<String>) -> Self {
        let token = bot_token.into();
        Self {
            bot: Bot::new(&token),
            token,
            http: reqwest::Client::new(),
            api_base: "https://api.telegram.org".into(),
        }
    }

    /// Point the file-fetch API somewhere else (tests).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn chat(&self, chat_id: &str) -> Result<ChatId, ChannelError> {
        chat_id
            .parse::<i64>()
            .map(ChatId)
            .map_err(|_| ChannelError::Contract(format!("invalid telegram chat id: {chat_id}")))
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn platform(&self) -> ChannelPlatform {
        ChannelPlatform::Telegram
    }

    fn voice_replies_supported(&self) -> bool {
        true
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

        // Two-step fetch: resolve the file path, then download it from the
        // authenticated file endpoint.
        let meta_url = format!("{}/bot{}/getFile", self.api_base, self.token);
        let resp = self
            .http
            .get(meta_url)
            .query(&[("file_id", media_id.as_str())])
            .send()
            .await
            .map_err(|e| ChannelError::Audio(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ChannelError::Audio(format!(
                "getFile returned {}",
                resp.status()
            )));
        }
        let meta: GetFileResponse = resp
            .json()
            .await
            .map_err(|e| ChannelError::Audio(e.to_string()))?;

        let file_url = format!(
            "{}/file/bot{}/{}",
            self.api_base, self.token, meta.result.file_path
        );
        let audio = self
            .http
            .get(file_url)
            .send()
            .await
            .map_err(|e| ChannelError::Audio(e.to_string()))?;
        if !audio.status().is_success() {
            return Err(ChannelError::Audio(format!(
                "file download returned {}",
                audio.status()
            )));
        }
        Ok(audio
            .bytes()
            .await
            .map_err(|e| ChannelError::Audio(e.to_string()))?
            .to_vec())
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let chat = self.chat(chat_id)?;
        for part in split_text(text, TELEGRAM_MESSAGE_LIMIT) {
            self.bot
                .send_message(chat, part)
                .await
                .map_err(|e| ChannelError::Delivery(e.to_string()))?;
        }
        Ok(())
    }

    async fn send_voice(
        &self,
        chat_id: &str,
        audio: &SynthesizedAudio,
    ) -> Result<(), ChannelError> {
        let chat = self.chat(chat_id)?;
        let file = InputFile::memory(audio.audio.clone()).file_name(format!("voice.{}", audio.format));
        self.bot
            .send_voice(chat, file)
            .await
            .map_err(|e| ChannelError::Delivery(e.to_string()))?;
        Ok(())
    }

    async fn transcription_started(&self, chat_id: &str) {
        if let Ok(chat) = self.chat(chat_id) {
            let _ = self.bot.send_chat_action(chat, ChatAction::UploadVoice).await;
        }
    }

    async fn transcription_finished(&self, chat_id: &str, transcript: &str) {
        if let Ok(chat) = self.chat(chat_id) {
            let _ = self
                .bot
                .send_message(chat, format!("I heard: {transcript}"))
                .await;
        }
    }

    async fn submit_input_to_llm(&self, chat_id: &str) {
        if let Ok(chat) = self.chat(chat_id) {
            let _ = self.bot.send_chat_action(chat, ChatAction::Typing).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct GetFileResponse {
    result: FileMeta,
}

#[derive(Debug, Deserialize)]
struct FileMeta {
    file_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn update_json(extra: &str) -> String {
        format!(
            r#"{{
                "update_id": 432101234,
                "message": {{
                    "message_id": 576,
                    "from": {{"id": 1234567891, "is_bot": false, "first_name": "Chris"}},
                    "chat": {{"id": 1234567891, "type": "private"}},
                    "date": 1690376696{extra}
                }}
            }}"#
        )
    }

    #[test]
    fn parse_text_update() {
        let msg = parse_update(&update_json(r#", "text": "Hi there""#))
            .unwrap()
            .expect("message expected");
        assert_eq!(msg.chat_id, "1234567891");
        assert_eq!(msg.body(), Some("Hi there"));
        assert_eq!(msg.message_id.as_deref(), Some("576"));
    }

    #[test]
    fn parse_voice_update() {
        let msg = parse_update(&update_json(
            r#", "voice": {"file_id": "AwACAgI", "duration": 3, "mime_type": "audio/ogg"}"#,
        ))
        .unwrap()
        .expect("message expected");
        match msg.content {
            MessageContent::Voice { media_id } => assert_eq!(media_id, "AwACAgI"),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn parse_sticker_update_is_unsupported() {
        let msg = parse_update(&update_json(
            r#", "sticker": {"file_id": "xyz", "width": 512, "height": 512}"#,
        ))
        .unwrap()
        .expect("message expected");
        assert_eq!(
            msg.content,
            MessageContent::Unsupported {
                content_type: "sticker".into()
            }
        );
    }

    #[test]
    fn chat_member_updates_are_ignored() {
        let raw = r#"{
            "update_id": 1,
            "my_chat_member": {
                "chat": {"id": 99, "type": "private"},
                "new_chat_member": {"status": "kicked"}
            }
        }"#;
        assert!(parse_update(raw).unwrap().is_none());
    }

    #[test]
    fn malformed_update_is_a_contract_error() {
        assert!(matches!(
            parse_update("not json"),
            Err(ChannelError::Contract(_))
        ));
    }

    #[tokio::test]
    async fn fetch_audio_resolves_file_then_downloads() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bot123:abc/getFile"))
            .and(query_param("file_id", "AwACAgI"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": {"file_id": "AwACAgI", "file_path": "voice/file_1.oga"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file/bot123:abc/voice/file_1.oga"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ogg-bytes".to_vec()))
            .mount(&server)
            .await;

        let adapter = TelegramAdapter::new("123:abc").with_api_base(server.uri());
        let message = InboundMessage {
            chat_id: "1".into(),
            content: MessageContent::Voice {
                media_id: "AwACAgI".into(),
            },
            message_id: None,
            channel_ref: None,
            thread_id: None,
        };
        let audio = adapter.fetch_audio(&message).await.unwrap();
        assert_eq!(audio, b"ogg-bytes");
    }

    #[tokio::test]
    async fn fetch_audio_rejects_text_messages() {
        let adapter = TelegramAdapter::new("123:abc");
        let message = InboundMessage::text("1", "hello");
        assert!(matches!(
            adapter.fetch_audio(&message).await,
            Err(ChannelError::Contract(_))
        ));
    }

    #[test]
    fn capabilities() {
        let adapter = TelegramAdapter::new("123:abc");
        assert!(adapter.voice_replies_supported());
        assert_eq!(
            adapter.supported_content(),
            &[ContentKind::Text, ContentKind::Voice]
        );
        assert_eq!(adapter.platform(), ChannelPlatform::Telegram);
    }
}
