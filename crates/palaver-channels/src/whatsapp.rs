//! WhatsApp channel over Twilio's messaging API.

use async_trait::async_trait;
use palaver_schema::{ChannelPlatform, ContentKind, InboundMessage, MessageContent};
use serde::Deserialize;

use crate::{split_text, ChannelAdapter, ChannelError};

/// Twilio rejects message bodies longer than this.
pub const WHATSAPP_MESSAGE_LIMIT: usize = 1600;

const SUPPORTED: &[ContentKind] = &[ContentKind::Text, ContentKind::Voice];

/// Twilio webhook form payload (field names are Twilio's, verbatim).
#[derive(Debug, Clone, Deserialize)]
pub struct TwilioMessage {
    #[serde(rename = "MessageSid")]
    pub message_sid: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Body", default)]
    pub body: String,
    #[serde(rename = "NumMedia", default)]
    pub num_media: Option<String>,
    #[serde(rename = "MediaUrl0", default)]
    pub media_url0: Option<String>,
    #[serde(rename = "MediaContentType0", default)]
    pub media_content_type0: Option<String>,
}

impl TwilioMessage {
    /// The business number the message was addressed to, without the
    /// `whatsapp:` scheme. Used to look up the experiment channel.
    pub fn to_number(&self) -> &str {
        strip_scheme(&self.to)
    }
}

fn strip_scheme(number: &str) -> &str {
    number.strip_prefix("whatsapp:").unwrap_or(number)
}

pub fn parse_twilio(message: &TwilioMessage) -> InboundMessage {
    let has_media = message
        .num_media
        .as_deref()
        .and_then(|n| n.parse::<u32>().ok())
        .unwrap_or(0)
        > 0;

    let content = if has_media {
        let content_type = message.media_content_type0.clone().unwrap_or_default();
        if content_type.starts_with("audio") {
            MessageContent::Voice {
                media_id: message.media_url0.clone().unwrap_or_default(),
            }
        } else {
            MessageContent::Unsupported { content_type }
        }
    } else {
        MessageContent::Text {
            body: message.body.clone(),
        }
    };

    InboundMessage {
        chat_id: strip_scheme(&message.from).to_string(),
        content,
        message_id: Some(message.message_sid.clone()),
        channel_ref: None,
        thread_id: None,
    }
}

pub struct WhatsappAdapter {
    /// Business number replies are sent from.
    number: String,
    account_sid: String,
    auth_token: String,
    http: reqwest::Client,
    api_base: String,
}

impl WhatsappAdapter {
    pub fn new(
        number: impl Into<String>,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            number: number.into(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            http: reqwest::Client::new(),
            api_base: "https://api.twilio.com".into(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ChannelAdapter for WhatsappAdapter {
    fn platform(&self) -> ChannelPlatform {
        ChannelPlatform::Whatsapp
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

        // Twilio media URLs require account credentials.
        let resp = self
            .http
            .get(media_id)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(|e| ChannelError::Audio(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ChannelError::Audio(format!(
                "media fetch returned {}",
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
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        );
        for part in split_text(text, WHATSAPP_MESSAGE_LIMIT) {
            let resp = self
                .http
                .post(&url)
                .basic_auth(&self.account_sid, Some(&self.auth_token))
                .form(&[
                    ("From", format!("whatsapp:{}", self.number)),
                    ("To", format!("whatsapp:{chat_id}")),
                    ("Body", part),
                ])
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(ChannelError::Delivery(format!(
                    "twilio send returned {status}: {body}"
                )));
            }
        }
        Ok(())
    }

    async fn transcription_finished(&self, chat_id: &str, transcript: &str) {
        let echo = format!("I heard: \"{transcript}\"");
        if let Err(err) = self.send_text(chat_id, &echo).await {
            tracing::warn!("failed to echo whatsapp transcript: {err}");
        }
    }
}
