use serde::{Deserialize, Serialize};

pub mod experiment;
pub mod gating;

pub use experiment::*;
pub use gating::{consent_transition, GatingAction, SessionStatus};

/// Sentinel message that ends the current session and starts a new one.
pub const RESET_COMMAND: &str = "/reset";

/// The only affirmative reply recognised during consent gating.
pub const USER_CONSENT_TEXT: &str = "1";

pub const UNSUPPORTED_MESSAGE_BOT_PROMPT: &str = "\
Tell the user (in the language being spoken) that they sent an unsupported message. \
You only support {supported_types} messages types. Respond only with the message for the user";

pub const GENERIC_ERROR_BOT_PROMPT: &str = "\
Tell the user that something went wrong while processing their message and that they \
should try again later";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPlatform {
    Web,
    Telegram,
    Whatsapp,
    Facebook,
    Slack,
    Api,
}

impl ChannelPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Telegram => "telegram",
            Self::Whatsapp => "whatsapp",
            Self::Facebook => "facebook",
            Self::Slack => "slack",
            Self::Api => "api",
        }
    }
}

impl std::fmt::Display for ChannelPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message content kinds a channel can declare support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Voice,
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Voice => f.write_str("voice"),
        }
    }
}

/// Payload of an inbound message after platform-specific parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MessageContent {
    Text { body: String },
    Voice { media_id: String },
    /// Recognised but unsupported payload. `content_type` is the platform's
    /// unparsed type tag, kept for the system history entry.
    Unsupported { content_type: String },
}

impl MessageContent {
    pub fn kind(&self) -> Option<ContentKind> {
        match self {
            Self::Text { .. } => Some(ContentKind::Text),
            Self::Voice { .. } => Some(ContentKind::Voice),
            Self::Unsupported { .. } => None,
        }
    }
}

/// A transport message normalised into the common shape all channels share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Stable per-user identifier on the platform (phone number, chat id,
    /// page-scoped user id). Doubles as the participant identifier.
    pub chat_id: String,
    pub content: MessageContent,
    /// Platform message id, where the platform has one (used for reply_to).
    #[serde(default)]
    pub message_id: Option<String>,
    /// Conversation container distinct from the user id (Slack channel).
    #[serde(default)]
    pub channel_ref: Option<String>,
    /// Thread marker within the conversation (Slack thread_ts).
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl InboundMessage {
    pub fn text(chat_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            content: MessageContent::Text { body: body.into() },
            message_id: None,
            channel_ref: None,
            thread_id: None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { body } => Some(body),
            _ => None,
        }
    }
}

/// Entry types in a session's message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMessageType {
    Human,
    Ai,
    System,
}

impl ChatMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Ai => "ai",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "human" => Some(Self::Human),
            "ai" => Some(Self::Ai),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Output of one generation pass through the runnable pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainOutput {
    pub output: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl ChainOutput {
    pub fn empty() -> Self {
        Self {
            output: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

/// Events handed to the external trigger queue as a session progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaticTrigger {
    ParticipantJoined,
    ConversationStart,
    NewHumanMessage,
    ConversationEnd,
}

/// Synthesized speech ready for delivery through a channel transport.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub audio: Vec<u8>,
    pub duration_secs: f32,
    pub format: String,
}
