//! Experiment and channel configuration.
//!
//! Experiments are read-only configuration from the engine's point of view:
//! they are loaded at startup and never mutated by message handling.

use serde::{Deserialize, Serialize};

use crate::ChannelPlatform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceResponseBehaviour {
    Always,
    Reciprocal,
    Never,
}

impl Default for VoiceResponseBehaviour {
    fn default() -> Self {
        Self::Never
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentForm {
    pub consent_text: String,
    pub confirmation_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreSurvey {
    /// Survey URL; `{session}` is replaced with the session's external id.
    pub url: String,
    /// Shown with the link; `{survey_link}` is replaced with the final URL.
    pub confirmation_text: String,
}

impl PreSurvey {
    pub fn link(&self, session_external_id: &str) -> String {
        self.url.replace("{session}", session_external_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Speech provider id in the provider registry.
    pub provider: String,
    pub synthetic_voice: String,
}

/// Configuration bundle for one conversational experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub team: String,
    pub name: String,
    pub prompt_text: String,
    /// LLM provider id in the provider registry.
    pub llm_provider: String,
    pub llm: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_token_limit")]
    pub max_token_limit: usize,
    /// Agent tool names; non-empty enables agent mode.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Provider-hosted assistant reference; takes precedence over tools.
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub assistant_instructions: Option<String>,
    #[serde(default)]
    pub consent_form: Option<ConsentForm>,
    #[serde(default)]
    pub pre_survey: Option<PreSurvey>,
    #[serde(default)]
    pub seed_message: Option<String>,
    #[serde(default)]
    pub source_material: Option<String>,
    /// Applied to the raw user text before it reaches the model;
    /// `{input}` marks the insertion point.
    #[serde(default)]
    pub input_formatter: Option<String>,
    #[serde(default)]
    pub voice: Option<VoiceConfig>,
    #[serde(default)]
    pub voice_response_behaviour: VoiceResponseBehaviour,
    #[serde(default)]
    pub conversational_consent_enabled: bool,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_token_limit() -> usize {
    8192
}

impl Experiment {
    pub fn tools_enabled(&self) -> bool {
        !self.tools.is_empty()
    }
}

/// Platform transport configuration for one experiment channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "platform")]
pub enum ChannelTransport {
    Web,
    Api,
    Telegram {
        bot_token: String,
    },
    Whatsapp {
        number: String,
        account_sid: String,
        auth_token: String,
    },
    Facebook {
        page_id: String,
        page_access_token: String,
        verify_token: String,
    },
    Slack {
        bot_token: String,
    },
}

impl ChannelTransport {
    pub fn platform(&self) -> ChannelPlatform {
        match self {
            Self::Web => ChannelPlatform::Web,
            Self::Api => ChannelPlatform::Api,
            Self::Telegram { .. } => ChannelPlatform::Telegram,
            Self::Whatsapp { .. } => ChannelPlatform::Whatsapp,
            Self::Facebook { .. } => ChannelPlatform::Facebook,
            Self::Slack { .. } => ChannelPlatform::Slack,
        }
    }
}

/// Binding of an experiment to a messaging platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentChannel {
    pub id: String,
    pub experiment_id: String,
    #[serde(flatten)]
    pub transport: ChannelTransport,
}

impl ExperimentChannel {
    pub fn platform(&self) -> ChannelPlatform {
        self.transport.platform()
    }
}

/// Parent/child routing edge; the keyword tags messages produced by the
/// child experiment inside the parent's conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRoute {
    pub parent_id: String,
    pub child_id: String,
    pub keyword: String,
}
