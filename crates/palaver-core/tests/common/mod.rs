//! Shared fixtures: a scripted channel adapter and config builders.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use palaver_channels::{ChannelAdapter, ChannelError};
use palaver_core::{builtin_tools, ChannelGateway, RecordingSink};
use palaver_provider::{ProviderRegistry, SpeechRegistry, StubProvider, StubSpeech};
use palaver_schema::{
    ChannelPlatform, ContentKind, Experiment, ExperimentChannel, InboundMessage, MessageContent,
    SynthesizedAudio,
};
use palaver_store::SessionStore;

/// Adapter double: records outbound traffic, serves scripted audio.
pub struct TestAdapter {
    pub platform: ChannelPlatform,
    pub voice_supported: bool,
    pub supported: Vec<ContentKind>,
    pub audio: Option<Vec<u8>>,
    pub sent_texts: Mutex<Vec<String>>,
    pub sent_voice: Mutex<Vec<SynthesizedAudio>>,
    pub echoed_transcripts: Mutex<Vec<String>>,
}

impl Default for TestAdapter {
    fn default() -> Self {
        Self {
            platform: ChannelPlatform::Telegram,
            voice_supported: true,
            supported: vec![ContentKind::Text, ContentKind::Voice],
            audio: Some(b"ogg-bytes".to_vec()),
            sent_texts: Mutex::new(Vec::new()),
            sent_voice: Mutex::new(Vec::new()),
            echoed_transcripts: Mutex::new(Vec::new()),
        }
    }
}

impl TestAdapter {
    pub fn texts(&self) -> Vec<String> {
        self.sent_texts.lock().unwrap().clone()
    }

    pub fn last_text(&self) -> String {
        self.texts().last().cloned().unwrap_or_default()
    }

    pub fn voice_count(&self) -> usize {
        self.sent_voice.lock().unwrap().len()
    }
}

#[async_trait]
impl ChannelAdapter for TestAdapter {
    fn platform(&self) -> ChannelPlatform {
        self.platform
    }

    fn voice_replies_supported(&self) -> bool {
        self.voice_supported
    }

    fn supported_content(&self) -> &[ContentKind] {
        &self.supported
    }

    async fn fetch_audio(&self, _message: &InboundMessage) -> Result<Vec<u8>, ChannelError> {
        self.audio
            .clone()
            .ok_or_else(|| ChannelError::Audio("scripted fetch failure".into()))
    }

    async fn send_text(&self, _chat_id: &str, text: &str) -> Result<(), ChannelError> {
        self.sent_texts.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_voice(
        &self,
        _chat_id: &str,
        audio: &SynthesizedAudio,
    ) -> Result<(), ChannelError> {
        self.sent_voice.lock().unwrap().push(audio.clone());
        Ok(())
    }

    async fn transcription_finished(&self, _chat_id: &str, transcript: &str) {
        self.echoed_transcripts
            .lock()
            .unwrap()
            .push(transcript.to_string());
    }
}

pub fn experiment() -> Experiment {
    serde_json::from_value(serde_json::json!({
        "id": "exp-1",
        "team": "acme",
        "name": "TestExperiment",
        "prompt_text": "You are a helpful assistant",
        "llm_provider": "stub",
        "llm": "test-model"
    }))
    .unwrap()
}

pub fn experiment_with_consent(survey: bool) -> Experiment {
    let mut exp = experiment();
    exp.conversational_consent_enabled = true;
    exp.consent_form = Some(palaver_schema::ConsentForm {
        consent_text: "We collect your answers for research.".into(),
        confirmation_text: "Reply 1 to continue".into(),
    });
    if survey {
        exp.pre_survey = Some(palaver_schema::PreSurvey {
            url: "https://example.com/survey?session={session}".into(),
            confirmation_text: "Please complete {survey_link} and reply 1".into(),
        });
    }
    exp
}

pub fn channel(platform: &str) -> ExperimentChannel {
    let mut value = serde_json::json!({
        "id": format!("ch-{platform}"),
        "experiment_id": "exp-1",
        "platform": platform,
    });
    if platform == "telegram" {
        value["bot_token"] = serde_json::json!("123:abc");
    }
    serde_json::from_value(value).unwrap()
}

pub struct Fixture {
    pub store: SessionStore,
    pub gateway: ChannelGateway,
    pub llm: Arc<StubProvider>,
    pub speech: Arc<StubSpeech>,
    pub triggers: Arc<RecordingSink>,
}

/// Gateway wired to in-memory collaborators. `responses` scripts the LLM.
pub fn fixture(responses: Vec<&str>) -> Fixture {
    fixture_with_speech(responses, StubSpeech::with_transcript("what I said"))
}

pub fn fixture_with_speech(responses: Vec<&str>, speech: StubSpeech) -> Fixture {
    let store = SessionStore::open_in_memory().unwrap();
    let llm = Arc::new(StubProvider::with_responses(responses));
    let speech = Arc::new(speech);
    let triggers = Arc::new(RecordingSink::default());

    let mut providers = ProviderRegistry::new();
    providers.register("stub", llm.clone());
    let mut speech_registry = SpeechRegistry::new();
    speech_registry.register("stub-speech", speech.clone());

    let gateway = ChannelGateway::new(
        store.clone(),
        providers,
        speech_registry,
        builtin_tools(&store),
        triggers.clone(),
    )
    .with_check_interval_ms(0);

    Fixture {
        store,
        gateway,
        llm,
        speech,
        triggers,
    }
}

pub fn text_message(chat_id: &str, body: &str) -> InboundMessage {
    InboundMessage::text(chat_id, body)
}

pub fn voice_message(chat_id: &str) -> InboundMessage {
    InboundMessage {
        chat_id: chat_id.into(),
        content: MessageContent::Voice {
            media_id: "file-1".into(),
        },
        message_id: None,
        channel_ref: None,
        thread_id: None,
    }
}

pub fn sticker_message(chat_id: &str) -> InboundMessage {
    InboundMessage {
        chat_id: chat_id.into(),
        content: MessageContent::Unsupported {
            content_type: "sticker".into(),
        },
        message_id: None,
        channel_ref: None,
        thread_id: None,
    }
}
