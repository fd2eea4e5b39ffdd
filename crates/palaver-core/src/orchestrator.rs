//! The shared message-handling state machine: session resolution, consent
//! gating, transcription, generation dispatch and reply delivery. Platform
//! specifics stay behind the channel adapter.

use std::sync::Arc;

use palaver_channels::ChannelAdapter;
use palaver_provider::{AssistantClient, ProviderRegistry, SpeechRegistry};
use palaver_schema::{
    consent_transition, ChannelPlatform, ChatMessageType, Experiment, ExperimentChannel,
    GatingAction, InboundMessage, MessageContent, SessionStatus, StaticTrigger, VoiceConfig,
    VoiceResponseBehaviour, GENERIC_ERROR_BOT_PROMPT, RESET_COMMAND,
    UNSUPPORTED_MESSAGE_BOT_PROMPT, USER_CONSENT_TEXT,
};
use palaver_schema::SynthesizedAudio;
use palaver_store::{SessionRecord, SessionStore};

use crate::error::CoreError;
use crate::events::TriggerSink;
use crate::runnables::{create_experiment_runnable, RunnableContext, RunnableOptions};
use crate::tools::ToolRegistry;

pub struct ChannelGateway {
    store: SessionStore,
    providers: ProviderRegistry,
    speech: SpeechRegistry,
    tools: ToolRegistry,
    assistant: Option<AssistantClient>,
    triggers: Arc<dyn TriggerSink>,
    check_every_ms: u64,
}

impl ChannelGateway {
    pub fn new(
        store: SessionStore,
        providers: ProviderRegistry,
        speech: SpeechRegistry,
        tools: ToolRegistry,
        triggers: Arc<dyn TriggerSink>,
    ) -> Self {
        Self {
            store,
            providers,
            speech,
            tools,
            assistant: None,
            triggers,
            check_every_ms: 1000,
        }
    }

    pub fn with_assistant_client(mut self, client: AssistantClient) -> Self {
        self.assistant = Some(client);
        self
    }

    pub fn with_check_interval_ms(mut self, ms: u64) -> Self {
        self.check_every_ms = ms;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Handle one inbound user message end to end and return the reply text
    /// (embedded/API channels hand it straight back to the caller).
    ///
    /// A generation cancelled mid-stream is not an error: it yields an
    /// empty reply, leaving any already-committed side effects in place.
    pub async fn handle_inbound(
        &self,
        experiment: &Experiment,
        channel: &ExperimentChannel,
        adapter: &dyn ChannelAdapter,
        message: &InboundMessage,
    ) -> Result<String, CoreError> {
        match self
            .handle_message(experiment, channel, adapter, message)
            .await
        {
            Err(CoreError::GenerationCancelled(_)) => Ok(String::new()),
            other => other,
        }
    }

    async fn handle_message(
        &self,
        experiment: &Experiment,
        channel: &ExperimentChannel,
        adapter: &dyn ChannelAdapter,
        message: &InboundMessage,
    ) -> Result<String, CoreError> {
        let platform = adapter.platform();
        // Voice transcription is expensive; extract the query once, at the
        // first step that needs it.
        let mut query_cache: Option<String> = None;

        let session = self
            .ensure_session(experiment, channel, adapter, message, &mut query_cache)
            .await?;

        if !message_supported(adapter, message) {
            return self
                .handle_unsupported(experiment, adapter, &session, message)
                .await;
        }

        if platform != ChannelPlatform::Web {
            let query = self
                .user_query(&mut query_cache, experiment, adapter, &session, message)
                .await?;
            if query == RESET_COMMAND {
                // Web handles resets through its own flow; for everyone else
                // the reset was already applied during session resolution.
                return Ok(String::new());
            }
        }

        // Consent gating only applies off the embedded widget; the widget's
        // own UI flow collects consent before the session exists.
        let gating_active =
            experiment.conversational_consent_enabled && platform != ChannelPlatform::Web;
        if gating_active {
            if session.status.requires_gating() {
                let query = self
                    .user_query(&mut query_cache, experiment, adapter, &session, message)
                    .await?;
                self.handle_gating(experiment, adapter, &session, message, &query)
                    .await?;
                return Ok(String::new());
            }
        } else {
            self.store
                .update_status(session.id, SessionStatus::Active)
                .await?;
        }

        self.triggers
            .enqueue(session.id, StaticTrigger::NewHumanMessage)
            .await;

        let query = self
            .user_query(&mut query_cache, experiment, adapter, &session, message)
            .await?;
        adapter.submit_input_to_llm(&message.chat_id).await;

        let runnable = self.runnable(experiment, &session, platform)?;
        let result = runnable.invoke(&query, &RunnableOptions::default()).await?;
        self.store.reset_ping_count(session.id).await?;

        self.dispatch_reply(experiment, adapter, message, &result.output)
            .await?;
        Ok(result.output)
    }

    // ============================================================
    // Session resolution
    // ============================================================

    async fn ensure_session(
        &self,
        experiment: &Experiment,
        channel: &ExperimentChannel,
        adapter: &dyn ChannelAdapter,
        message: &InboundMessage,
        query_cache: &mut Option<String>,
    ) -> Result<SessionRecord, CoreError> {
        let platform = adapter.platform();
        let existing = self
            .store
            .latest_session(&experiment.id, &message.chat_id)
            .await?;

        let Some(session) = existing else {
            // Web and Slack sessions are created through dedicated entry
            // points before any message handling.
            if matches!(platform, ChannelPlatform::Web | ChannelPlatform::Slack) {
                return Err(CoreError::Handler(format!(
                    "{platform} channel requires an existing session"
                )));
            }
            let (participant, _) = self
                .store
                .find_or_create_participant(&experiment.team, &message.chat_id, None)
                .await?;
            let session = self
                .create_session(experiment, channel, participant.id)
                .await?;
            self.triggers
                .enqueue(session.id, StaticTrigger::ParticipantJoined)
                .await;
            return Ok(session);
        };

        let query = self
            .user_query(query_cache, experiment, adapter, &session, message)
            .await?;
        if query == RESET_COMMAND && self.store.has_human_message(session.chat_id).await? {
            self.store.end_session(session.id).await?;
            self.triggers
                .enqueue(session.id, StaticTrigger::ConversationEnd)
                .await;
            return self
                .create_session(experiment, channel, session.participant_id)
                .await;
        }
        Ok(session)
    }

    async fn create_session(
        &self,
        experiment: &Experiment,
        channel: &ExperimentChannel,
        participant_id: i64,
    ) -> Result<SessionRecord, CoreError> {
        let session = self
            .store
            .create_session(
                &experiment.team,
                &experiment.id,
                Some(&channel.id),
                participant_id,
                SessionStatus::Setup,
                None,
            )
            .await?;
        self.triggers
            .enqueue(session.id, StaticTrigger::ConversationStart)
            .await;
        Ok(session)
    }

    /// Entry point for the embedded web widget: sessions are created by the
    /// UI flow and start out ACTIVE.
    pub async fn start_web_session(
        &self,
        experiment: &Experiment,
        channel: &ExperimentChannel,
        participant_identifier: &str,
        participant_user: Option<&str>,
        timezone: Option<&str>,
    ) -> Result<SessionRecord, CoreError> {
        self.start_session(
            experiment,
            channel,
            participant_identifier,
            participant_user,
            SessionStatus::Active,
            None,
            timezone,
        )
        .await
    }

    /// Entry point for Slack: the listener creates the session with the
    /// thread's external conversation id attached.
    pub async fn start_slack_session(
        &self,
        experiment: &Experiment,
        channel: &ExperimentChannel,
        participant_identifier: &str,
        external_session_id: &str,
    ) -> Result<SessionRecord, CoreError> {
        self.start_session(
            experiment,
            channel,
            participant_identifier,
            None,
            SessionStatus::Active,
            Some(external_session_id),
            None,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_session(
        &self,
        experiment: &Experiment,
        channel: &ExperimentChannel,
        participant_identifier: &str,
        participant_user: Option<&str>,
        status: SessionStatus,
        external_session_id: Option<&str>,
        timezone: Option<&str>,
    ) -> Result<SessionRecord, CoreError> {
        if participant_identifier.is_empty() {
            return Err(CoreError::Handler(
                "participant identifier must be specified".into(),
            ));
        }
        if let Some(user) = participant_user {
            if user != participant_identifier {
                return Err(CoreError::Handler(format!(
                    "user {user} cannot impersonate participant {participant_identifier}"
                )));
            }
        }

        let (participant, _) = self
            .store
            .find_or_create_participant(&experiment.team, participant_identifier, participant_user)
            .await?;
        let session = self
            .store
            .create_session(
                &experiment.team,
                &experiment.id,
                Some(&channel.id),
                participant.id,
                status,
                external_session_id,
            )
            .await?;

        if let Some(tz) = timezone {
            let mut data = serde_json::Map::new();
            data.insert("timezone".into(), serde_json::json!(tz));
            self.store
                .update_participant_data(participant.id, &experiment.id, data)
                .await?;
        }

        if self
            .store
            .session_count(&experiment.id, participant_identifier)
            .await?
            == 1
        {
            self.triggers
                .enqueue(session.id, StaticTrigger::ParticipantJoined)
                .await;
        }
        self.triggers
            .enqueue(session.id, StaticTrigger::ConversationStart)
            .await;

        // The seed reply lands in the history, which is how embedded
        // channels deliver it.
        if let Some(seed) = experiment.seed_message.clone() {
            self.generate_response_for_user(
                experiment,
                &session,
                channel.platform(),
                &seed,
            )
            .await?;
        }

        Ok(session)
    }

    // ============================================================
    // Query extraction and transcription
    // ============================================================

    async fn user_query(
        &self,
        cache: &mut Option<String>,
        experiment: &Experiment,
        adapter: &dyn ChannelAdapter,
        session: &SessionRecord,
        message: &InboundMessage,
    ) -> Result<String, CoreError> {
        if let Some(query) = cache {
            return Ok(query.clone());
        }
        let query = match &message.content {
            MessageContent::Text { body } => body.clone(),
            MessageContent::Voice { .. } => {
                self.voice_transcript(experiment, adapter, session, message)
                    .await?
            }
            MessageContent::Unsupported { .. } => String::new(),
        };
        *cache = Some(query.clone());
        Ok(query)
    }

    async fn voice_transcript(
        &self,
        experiment: &Experiment,
        adapter: &dyn ChannelAdapter,
        session: &SessionRecord,
        message: &InboundMessage,
    ) -> Result<String, CoreError> {
        adapter.transcription_started(&message.chat_id).await;

        match self.fetch_and_transcribe(experiment, adapter, message).await {
            Ok(transcript) => {
                adapter
                    .transcription_finished(&message.chat_id, &transcript)
                    .await;
                Ok(transcript)
            }
            Err(err) => {
                tracing::error!("transcription failed: {err}");
                self.inform_user_of_error(experiment, adapter, session, message)
                    .await;
                Err(err)
            }
        }
    }

    async fn fetch_and_transcribe(
        &self,
        experiment: &Experiment,
        adapter: &dyn ChannelAdapter,
        message: &InboundMessage,
    ) -> Result<String, CoreError> {
        let audio = adapter.fetch_audio(message).await?;

        let llm = self.providers.get(&experiment.llm_provider)?;
        if llm.supports_transcription() {
            return llm
                .transcribe_audio(audio, "voice.ogg")
                .await
                .map_err(CoreError::Other);
        }
        if let Some(voice) = &experiment.voice {
            let speech = self.speech.get(&voice.provider)?;
            if speech.supports_transcription() {
                return speech
                    .transcribe_audio(audio, "voice.ogg")
                    .await
                    .map_err(CoreError::Other);
            }
        }
        Err(CoreError::Handler(
            "no configured provider supports transcription".into(),
        ))
    }

    /// Tell the user something went wrong, in the bot's own words. The
    /// original failure is reported by the caller.
    async fn inform_user_of_error(
        &self,
        experiment: &Experiment,
        adapter: &dyn ChannelAdapter,
        session: &SessionRecord,
        message: &InboundMessage,
    ) {
        let notice = self
            .generate_response_for_user(
                experiment,
                session,
                adapter.platform(),
                GENERIC_ERROR_BOT_PROMPT,
            )
            .await;
        match notice {
            Ok(text) => {
                if let Err(err) = self
                    .dispatch_reply(experiment, adapter, message, &text)
                    .await
                {
                    tracing::warn!("failed to deliver error notice: {err}");
                }
            }
            Err(err) => tracing::warn!("failed to generate error notice: {err}"),
        }
    }

    // ============================================================
    // Consent gating
    // ============================================================

    async fn handle_gating(
        &self,
        experiment: &Experiment,
        adapter: &dyn ChannelAdapter,
        session: &SessionRecord,
        message: &InboundMessage,
        query: &str,
    ) -> Result<(), CoreError> {
        // Gating messages bypass the pipeline, so the HUMAN entry is
        // appended here.
        self.store
            .append_message(session.chat_id, ChatMessageType::Human, query, &[])
            .await?;

        let gave_consent = query.trim() == USER_CONSENT_TEXT;
        let has_survey = experiment.pre_survey.is_some();
        let Some((next, action)) = consent_transition(session.status, gave_consent, has_survey)
        else {
            return Ok(());
        };
        self.store.update_status(session.id, next).await?;

        match action {
            GatingAction::AskConsent => {
                let form = experiment.consent_form.as_ref().ok_or_else(|| {
                    CoreError::Handler(
                        "conversational consent is enabled but no consent form is configured"
                            .into(),
                    )
                })?;
                let text = format!("{}\n\n{}", form.consent_text, form.confirmation_text);
                self.store
                    .append_message(session.chat_id, ChatMessageType::Ai, &text, &[])
                    .await?;
                adapter.send_text(&message.chat_id, &text).await?;
            }
            GatingAction::AskSurvey => {
                let survey = experiment.pre_survey.as_ref().ok_or_else(|| {
                    CoreError::Handler("survey step reached without a configured pre-survey".into())
                })?;
                let link = survey.link(&session.external_id);
                let text = survey.confirmation_text.replace("{survey_link}", &link);
                self.store
                    .append_message(session.chat_id, ChatMessageType::Ai, &text, &[])
                    .await?;
                adapter.send_text(&message.chat_id, &text).await?;
            }
            GatingAction::StartConversation => {
                if let Some(seed) = experiment.seed_message.clone() {
                    let response = self
                        .generate_response_for_user(
                            experiment,
                            session,
                            adapter.platform(),
                            &seed,
                        )
                        .await?;
                    self.dispatch_reply(experiment, adapter, message, &response)
                        .await?;
                }
            }
        }
        Ok(())
    }

    // ============================================================
    // Unsupported content
    // ============================================================

    async fn handle_unsupported(
        &self,
        experiment: &Experiment,
        adapter: &dyn ChannelAdapter,
        session: &SessionRecord,
        message: &InboundMessage,
    ) -> Result<String, CoreError> {
        let content_type = match &message.content {
            MessageContent::Unsupported { content_type } => content_type.clone(),
            MessageContent::Voice { .. } => "voice".into(),
            MessageContent::Text { .. } => "text".into(),
        };
        self.store
            .append_message(
                session.chat_id,
                ChatMessageType::System,
                &format!("The user sent an unsupported message type: {content_type}"),
                &[],
            )
            .await?;

        let supported = adapter
            .supported_content()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = UNSUPPORTED_MESSAGE_BOT_PROMPT.replace("{supported_types}", &supported);
        let text = self
            .generate_response_for_user(experiment, session, adapter.platform(), &prompt)
            .await?;
        adapter.send_text(&message.chat_id, &text).await?;
        Ok(text)
    }

    // ============================================================
    // Generation and delivery
    // ============================================================

    fn runnable(
        &self,
        experiment: &Experiment,
        session: &SessionRecord,
        platform: ChannelPlatform,
    ) -> Result<crate::runnables::ExperimentRunnable, CoreError> {
        let llm = self.providers.get(&experiment.llm_provider)?;
        let ctx = RunnableContext {
            store: self.store.clone(),
            llm,
            tools: self.tools.clone(),
            assistant: self.assistant.clone(),
            platform,
            check_every_ms: self.check_every_ms,
        };
        Ok(create_experiment_runnable(
            experiment.clone(),
            session.clone(),
            ctx,
        ))
    }

    async fn generate_response_for_user(
        &self,
        experiment: &Experiment,
        session: &SessionRecord,
        platform: ChannelPlatform,
        prompt: &str,
    ) -> Result<String, CoreError> {
        let runnable = self.runnable(experiment, session, platform)?;
        let result = runnable
            .invoke(prompt, &RunnableOptions::without_input_history())
            .await?;
        Ok(result.output)
    }

    /// Deliver a bot reply, choosing voice or text per the experiment's
    /// voice-response policy. Synthesis failures fall back to text.
    async fn dispatch_reply(
        &self,
        experiment: &Experiment,
        adapter: &dyn ChannelAdapter,
        message: &InboundMessage,
        text: &str,
    ) -> Result<(), CoreError> {
        let user_sent_voice = matches!(message.content, MessageContent::Voice { .. });

        if adapter.voice_replies_supported() {
            if let Some(voice) = &experiment.voice {
                let reply_with_voice = match experiment.voice_response_behaviour {
                    VoiceResponseBehaviour::Always => true,
                    VoiceResponseBehaviour::Reciprocal => user_sent_voice,
                    VoiceResponseBehaviour::Never => false,
                };
                if reply_with_voice {
                    match self.synthesize(voice, text).await {
                        Ok(audio) => {
                            adapter.send_voice(&message.chat_id, &audio).await?;
                            return Ok(());
                        }
                        Err(err) => {
                            tracing::error!(
                                "voice synthesis failed, falling back to text: {err}"
                            );
                        }
                    }
                }
            }
        }
        adapter.send_text(&message.chat_id, text).await?;
        Ok(())
    }

    async fn synthesize(
        &self,
        voice: &VoiceConfig,
        text: &str,
    ) -> Result<SynthesizedAudio, CoreError> {
        let speech = self.speech.get(&voice.provider)?;
        speech
            .synthesize_voice(text, &voice.synthetic_voice)
            .await
            .map_err(CoreError::Other)
    }
}

fn message_supported(adapter: &dyn ChannelAdapter, message: &InboundMessage) -> bool {
    message
        .content
        .kind()
        .map(|kind| adapter.supported_content().contains(&kind))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_channels::ApiAdapter;
    use palaver_schema::ContentKind;

    #[test]
    fn unsupported_detection_uses_adapter_capabilities() {
        let adapter = ApiAdapter;
        let text = InboundMessage::text("1", "hello");
        assert!(message_supported(&adapter, &text));

        let voice = InboundMessage {
            chat_id: "1".into(),
            content: MessageContent::Voice {
                media_id: "m".into(),
            },
            message_id: None,
            channel_ref: None,
            thread_id: None,
        };
        assert!(!message_supported(&adapter, &voice));

        let sticker = InboundMessage {
            chat_id: "1".into(),
            content: MessageContent::Unsupported {
                content_type: "sticker".into(),
            },
            message_id: None,
            channel_ref: None,
            thread_id: None,
        };
        assert!(!message_supported(&adapter, &sticker));
    }

    #[test]
    fn content_kind_of_unsupported_is_none() {
        let content = MessageContent::Unsupported {
            content_type: ContentKind::Voice.to_string(),
        };
        assert!(content.kind().is_none());
    }
}
