//! Generation strategies. One is picked per experiment configuration:
//! a provider-hosted assistant thread when the experiment references an
//! assistant, a tool-calling agent when tools are enabled, and a plain
//! single-turn completion otherwise.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use palaver_provider::{
    AssistantClient, AssistantError, ContentBlock, LlmMessage, LlmProvider, LlmRequest, RunStatus,
};
use palaver_schema::{ChainOutput, ChannelPlatform, ChatMessageType, Experiment};
use palaver_store::{SessionRecord, SessionStore, METADATA_THREAD_ID};
use regex::Regex;
use tokio_stream::StreamExt;

use crate::error::CoreError;
use crate::history::{compress_chat_history, to_llm_messages};
use crate::prompt;
use crate::tools::ToolRegistry;

/// Hard bound on one agent invocation, tool calls included.
pub const AGENT_MAX_EXECUTION_SECS: u64 = 120;
const AGENT_MAX_ITERATIONS: usize = 10;
const ASSISTANT_MAX_ATTEMPTS: usize = 3;
const MAX_COMPLETION_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct RunnableOptions {
    pub save_input_to_history: bool,
    pub save_output_to_history: bool,
    /// Tag the AI turn with the route keyword when this experiment runs as
    /// a sub-route of the session's experiment.
    pub add_experiment_tag: bool,
}

impl Default for RunnableOptions {
    fn default() -> Self {
        Self {
            save_input_to_history: true,
            save_output_to_history: true,
            add_experiment_tag: false,
        }
    }
}

impl RunnableOptions {
    pub fn without_input_history() -> Self {
        Self {
            save_input_to_history: false,
            ..Self::default()
        }
    }
}

/// Collaborators a runnable needs beyond the experiment and session.
#[derive(Clone)]
pub struct RunnableContext {
    pub store: SessionStore,
    pub llm: Arc<dyn LlmProvider>,
    pub tools: ToolRegistry,
    pub assistant: Option<AssistantClient>,
    pub platform: ChannelPlatform,
    /// Minimum interval between cancellation-flag polls.
    pub check_every_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Simple,
    Agent,
    Assistant,
}

pub struct ExperimentRunnable {
    experiment: Experiment,
    session: SessionRecord,
    ctx: RunnableContext,
    strategy: Strategy,
}

/// Pick the generation strategy from the experiment configuration.
pub fn create_experiment_runnable(
    experiment: Experiment,
    session: SessionRecord,
    ctx: RunnableContext,
) -> ExperimentRunnable {
    let strategy = if experiment.assistant_id.is_some() {
        Strategy::Assistant
    } else if experiment.tools_enabled() {
        Strategy::Agent
    } else {
        Strategy::Simple
    };
    ExperimentRunnable {
        experiment,
        session,
        ctx,
        strategy,
    }
}

impl ExperimentRunnable {
    pub async fn invoke(
        &self,
        input: &str,
        options: &RunnableOptions,
    ) -> Result<ChainOutput, CoreError> {
        match self.strategy {
            Strategy::Simple => self.invoke_simple(input, options).await,
            Strategy::Agent => self.invoke_agent(input, options).await,
            Strategy::Assistant => self.invoke_assistant(input, options).await,
        }
    }

    // ============================================================
    // Shared pieces
    // ============================================================

    /// Web sessions without a linked platform user are unauthorized; every
    /// other channel's transport already identifies the user.
    fn is_unauthorized_participant(&self) -> bool {
        self.ctx.platform == ChannelPlatform::Web && self.session.participant_user.is_none()
    }

    async fn participant_data(&self) -> Result<(String, Option<String>), CoreError> {
        let data = self
            .ctx
            .store
            .participant_data(self.session.participant_id, &self.experiment.id)
            .await?;
        let timezone = data
            .get("timezone")
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        if self.is_unauthorized_participant() {
            return Ok((String::new(), timezone));
        }

        let mut data = data;
        let scheduled = self.ctx.store.scheduled_messages(self.session.id).await?;
        if !scheduled.is_empty() {
            let rendered: Vec<serde_json::Value> = scheduled
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "message": s.message,
                        "due_at": prompt::pretty_date(s.due_at, timezone.as_deref()),
                    })
                })
                .collect();
            data.insert("scheduled_messages".into(), serde_json::Value::Array(rendered));
        }

        let rendered = if data.is_empty() {
            String::new()
        } else {
            serde_json::Value::Object(data).to_string()
        };
        Ok((rendered, timezone))
    }

    async fn save_message(
        &self,
        message_type: ChatMessageType,
        content: &str,
        add_experiment_tag: bool,
    ) -> Result<(), CoreError> {
        let mut tags = Vec::new();
        if add_experiment_tag {
            if let Some(keyword) = self
                .ctx
                .store
                .route_keyword(
                    &self.session.team,
                    &self.session.experiment_id,
                    &self.experiment.id,
                )
                .await?
            {
                tags.push(keyword);
            }
        }
        self.ctx
            .store
            .append_message(self.session.chat_id, message_type, content, &tags)
            .await?;
        Ok(())
    }

    /// History and system prompt for the in-process strategies.
    async fn build_conversation(
        &self,
        input: &str,
    ) -> Result<(String, Vec<LlmMessage>), CoreError> {
        let (participant_data, timezone) = self.participant_data().await?;
        let system = prompt::system_prompt(
            &self.experiment,
            &participant_data,
            Utc::now(),
            timezone.as_deref(),
        );

        let log = self.ctx.store.messages(self.session.chat_id).await?;
        let compressed = compress_chat_history(&log, self.experiment.max_token_limit);
        let mut messages = to_llm_messages(&compressed);
        messages.push(LlmMessage::user(prompt::format_input(&self.experiment, input)));
        Ok((system, messages))
    }

    /// Rate-limited read of the durable cancellation flag.
    async fn chat_is_cancelled(
        &self,
        last_check: &mut Option<Instant>,
    ) -> Result<bool, CoreError> {
        if let Some(at) = last_check {
            if at.elapsed() < Duration::from_millis(self.ctx.check_every_ms) {
                return Ok(false);
            }
        }
        *last_check = Some(Instant::now());
        Ok(self.ctx.store.chat_cancelled(self.session.chat_id).await?)
    }

    // ============================================================
    // Simple completion
    // ============================================================

    async fn invoke_simple(
        &self,
        input: &str,
        options: &RunnableOptions,
    ) -> Result<ChainOutput, CoreError> {
        let (system, messages) = self.build_conversation(input).await?;
        if options.save_input_to_history {
            self.save_message(ChatMessageType::Human, input, false)
                .await?;
        }

        let request = LlmRequest {
            model: self.experiment.llm.clone(),
            system: Some(system),
            messages,
            temperature: self.experiment.temperature,
            max_tokens: MAX_COMPLETION_TOKENS,
            tools: vec![],
        };

        let mut stream = self
            .ctx
            .llm
            .stream(request)
            .await
            .map_err(|e| CoreError::Generation(e.to_string()))?;

        let mut output = String::new();
        let mut prompt_tokens = 0;
        let mut completion_tokens = 0;
        let mut last_check: Option<Instant> = None;
        let mut cancelled = false;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CoreError::Generation(e.to_string()))?;
            if let Some(t) = chunk.input_tokens {
                prompt_tokens = t;
            }
            if let Some(t) = chunk.output_tokens {
                completion_tokens = t;
            }
            if chunk.is_final {
                continue;
            }
            output.push_str(&chunk.delta);
            if self.chat_is_cancelled(&mut last_check).await? {
                cancelled = true;
                break;
            }
        }

        let result = ChainOutput {
            output,
            prompt_tokens,
            completion_tokens,
        };
        if cancelled {
            return Err(CoreError::GenerationCancelled(result));
        }
        if options.save_output_to_history {
            self.save_message(
                ChatMessageType::Ai,
                &result.output,
                options.add_experiment_tag,
            )
            .await?;
        }
        Ok(result)
    }

    // ============================================================
    // Tool-calling agent
    // ============================================================

    async fn invoke_agent(
        &self,
        input: &str,
        options: &RunnableOptions,
    ) -> Result<ChainOutput, CoreError> {
        let (system, messages) = self.build_conversation(input).await?;
        if options.save_input_to_history {
            self.save_message(ChatMessageType::Human, input, false)
                .await?;
        }

        let loop_result = tokio::time::timeout(
            Duration::from_secs(AGENT_MAX_EXECUTION_SECS),
            self.agent_loop(system, messages),
        )
        .await
        .map_err(|_| {
            CoreError::Generation(format!(
                "agent execution exceeded {AGENT_MAX_EXECUTION_SECS}s"
            ))
        })??;

        let (result, cancelled) = loop_result;
        if cancelled {
            return Err(CoreError::GenerationCancelled(result));
        }
        if options.save_output_to_history {
            self.save_message(
                ChatMessageType::Ai,
                &result.output,
                options.add_experiment_tag,
            )
            .await?;
        }
        Ok(result)
    }

    async fn agent_loop(
        &self,
        system: String,
        mut messages: Vec<LlmMessage>,
    ) -> Result<(ChainOutput, bool), CoreError> {
        let tools = self.ctx.tools.defs(&self.experiment.tools);
        let mut prompt_tokens = 0u32;
        let mut completion_tokens = 0u32;
        let mut last_check: Option<Instant> = None;

        for _ in 0..AGENT_MAX_ITERATIONS {
            let request = LlmRequest {
                model: self.experiment.llm.clone(),
                system: Some(system.clone()),
                messages: messages.clone(),
                temperature: self.experiment.temperature,
                max_tokens: MAX_COMPLETION_TOKENS,
                tools: tools.clone(),
            };
            let response = self
                .ctx
                .llm
                .chat(request)
                .await
                .map_err(|e| CoreError::Generation(e.to_string()))?;
            prompt_tokens += response.input_tokens.unwrap_or(0);
            completion_tokens += response.output_tokens.unwrap_or(0);

            let calls: Vec<(String, String, serde_json::Value)> = response
                .tool_calls()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            if calls.is_empty() {
                let result = ChainOutput {
                    output: response.text,
                    prompt_tokens,
                    completion_tokens,
                };
                return Ok((result, false));
            }

            messages.push(LlmMessage {
                role: "assistant".into(),
                content: response.content.clone(),
            });
            for (id, name, input) in calls {
                let outcome = self.ctx.tools.execute(&name, &self.session, input).await;
                let (content, is_error) = match outcome {
                    Ok(content) => (content, false),
                    Err(err) => {
                        tracing::warn!(tool = %name, "tool execution failed: {err}");
                        (err.to_string(), true)
                    }
                };
                messages.push(LlmMessage {
                    role: "user".into(),
                    content: vec![ContentBlock::ToolResult {
                        tool_use_id: id,
                        content,
                        is_error,
                    }],
                });
            }

            if self.chat_is_cancelled(&mut last_check).await? {
                let result = ChainOutput {
                    output: String::new(),
                    prompt_tokens,
                    completion_tokens,
                };
                return Ok((result, true));
            }
        }
        Err(CoreError::Generation(
            "agent exceeded maximum tool iterations".into(),
        ))
    }

    // ============================================================
    // Hosted assistant thread
    // ============================================================

    async fn invoke_assistant(
        &self,
        input: &str,
        options: &RunnableOptions,
    ) -> Result<ChainOutput, CoreError> {
        let client = self.ctx.assistant.as_ref().ok_or_else(|| {
            CoreError::Handler("experiment references an assistant but no client is configured".into())
        })?;
        let assistant_id = self.experiment.assistant_id.clone().ok_or_else(|| {
            CoreError::Handler("assistant strategy requires an assistant id".into())
        })?;
        let assistant_id = assistant_id.as_str();

        if options.save_input_to_history {
            self.save_message(ChatMessageType::Human, input, false)
                .await?;
        }

        // The thread API has no separate dynamic-instruction injection, so
        // participant data is re-interpolated into the full instructions on
        // every call.
        let (participant_data, _) = self.participant_data().await?;
        let template = self
            .experiment
            .assistant_instructions
            .clone()
            .unwrap_or_else(|| self.experiment.prompt_text.clone());
        let instructions = template.replace("{participant_data}", &participant_data);
        let formatted = prompt::format_input(&self.experiment, input);

        let mut thread_id = self
            .ctx
            .store
            .chat_metadata(self.session.chat_id)
            .await?
            .get(METADATA_THREAD_ID)
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        for _ in 0..ASSISTANT_MAX_ATTEMPTS {
            let current_thread = match &thread_id {
                Some(id) => id.clone(),
                None => {
                    let id = client
                        .create_thread()
                        .await
                        .map_err(|e| CoreError::Generation(e.to_string()))?;
                    self.ctx
                        .store
                        .set_chat_metadata(
                            self.session.chat_id,
                            METADATA_THREAD_ID,
                            serde_json::json!(id),
                        )
                        .await?;
                    thread_id = Some(id.clone());
                    id
                }
            };

            match self
                .assistant_turn(client, &current_thread, assistant_id, &instructions, &formatted)
                .await
            {
                Ok(result) => {
                    if options.save_output_to_history {
                        self.save_message(
                            ChatMessageType::Ai,
                            &result.output,
                            options.add_experiment_tag,
                        )
                        .await?;
                    }
                    return Ok(result);
                }
                Err(TurnError::RunCancelled) => {
                    return Err(CoreError::GenerationCancelled(ChainOutput::empty()));
                }
                Err(TurnError::ThreadBusy { thread, run }) => {
                    if thread != current_thread {
                        return Err(CoreError::Generation(format!(
                            "thread id mismatch: {thread} != {current_thread}"
                        )));
                    }
                    self.cancel_stuck_run(client, &thread, &run).await?;
                }
                Err(TurnError::Fatal(message)) => {
                    return Err(CoreError::Generation(message));
                }
            }
        }
        Err(CoreError::Generation(format!(
            "failed to get assistant response after {ASSISTANT_MAX_ATTEMPTS} retries"
        )))
    }

    async fn assistant_turn(
        &self,
        client: &AssistantClient,
        thread_id: &str,
        assistant_id: &str,
        instructions: &str,
        input: &str,
    ) -> Result<ChainOutput, TurnError> {
        client
            .add_message(thread_id, input)
            .await
            .map_err(classify_assistant_error)?;
        let run = client
            .create_run(thread_id, assistant_id, Some(instructions))
            .await
            .map_err(classify_assistant_error)?;
        let run = client
            .wait_for_run(thread_id, &run.id)
            .await
            .map_err(classify_assistant_error)?;

        match run.status {
            RunStatus::Completed => {
                let output = client
                    .latest_assistant_message(thread_id)
                    .await
                    .map_err(classify_assistant_error)?;
                let (prompt_tokens, completion_tokens) = run
                    .usage
                    .map(|u| (u.prompt_tokens, u.completion_tokens))
                    .unwrap_or((0, 0));
                Ok(ChainOutput {
                    output,
                    prompt_tokens,
                    completion_tokens,
                })
            }
            // Cancelled by another actor: a cancellation outcome, not a
            // failure, with zero token counts.
            RunStatus::Cancelled => Err(TurnError::RunCancelled),
            other => {
                let detail = run
                    .last_error
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_default();
                Err(TurnError::Fatal(format!(
                    "assistant run ended with status {other:?} {detail}"
                )))
            }
        }
    }

    async fn cancel_stuck_run(
        &self,
        client: &AssistantClient,
        thread_id: &str,
        run_id: &str,
    ) -> Result<(), CoreError> {
        tracing::info!("cancelling run {run_id} in thread {thread_id}");
        let mut run = client
            .cancel_run(thread_id, run_id)
            .await
            .map_err(|e| CoreError::Generation(e.to_string()))?;
        while run.status == RunStatus::Cancelling {
            tokio::time::sleep(client.poll_interval).await;
            run = client
                .retrieve_run(thread_id, run_id)
                .await
                .map_err(|e| CoreError::Generation(e.to_string()))?;
        }
        Ok(())
    }
}

enum TurnError {
    /// The specific retryable pattern: a new message was rejected because a
    /// prior run on the thread is still active.
    ThreadBusy { thread: String, run: String },
    RunCancelled,
    Fatal(String),
}

fn thread_busy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(thread_\w+) while a run (run_\w+) is active").expect("valid regex")
    })
}

fn classify_assistant_error(err: AssistantError) -> TurnError {
    let message = err.message();
    if err.is_bad_request() {
        if let Some(captures) = thread_busy_re().captures(&message) {
            return TurnError::ThreadBusy {
                thread: captures[1].to_string(),
                run: captures[2].to_string(),
            };
        }
    }
    if message.contains("cancelling") || message.contains("cancelled") {
        return TurnError::RunCancelled;
    }
    TurnError::Fatal(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_busy_pattern_extracts_ids() {
        let message =
            "Can't add messages to thread_abc123 while a run run_xyz789 is active.";
        let captures = thread_busy_re().captures(message).unwrap();
        assert_eq!(&captures[1], "thread_abc123");
        assert_eq!(&captures[2], "run_xyz789");
    }

    #[test]
    fn unrelated_bad_request_is_fatal() {
        let err = AssistantError::Api {
            status: 400,
            message: "invalid assistant id".into(),
        };
        assert!(matches!(classify_assistant_error(err), TurnError::Fatal(_)));
    }

    #[test]
    fn cancelled_wording_maps_to_cancellation() {
        let err = AssistantError::Api {
            status: 400,
            message: "Cannot act on run while it is cancelling".into(),
        };
        assert!(matches!(
            classify_assistant_error(err),
            TurnError::RunCancelled
        ));
    }

    #[tokio::test]
    async fn strategy_selection_priority() {
        let store = SessionStore::open_in_memory().unwrap();
        let (participant, _) = store
            .find_or_create_participant("acme", "123", None)
            .await
            .unwrap();
        let session = store
            .create_session(
                "acme",
                "exp-1",
                None,
                participant.id,
                palaver_schema::SessionStatus::Active,
                None,
            )
            .await
            .unwrap();
        let ctx = RunnableContext {
            store,
            llm: Arc::new(palaver_provider::StubProvider::default()),
            tools: ToolRegistry::new(),
            assistant: None,
            platform: ChannelPlatform::Telegram,
            check_every_ms: 1000,
        };
        let base: Experiment = serde_json::from_value(serde_json::json!({
            "id": "exp-1", "team": "acme", "name": "T",
            "prompt_text": "p", "llm_provider": "stub", "llm": "m"
        }))
        .unwrap();

        let mut with_assistant = base.clone();
        with_assistant.assistant_id = Some("asst_1".into());
        with_assistant.tools = vec!["one-off-reminder".into()];
        let runnable =
            create_experiment_runnable(with_assistant, session.clone(), ctx.clone());
        assert_eq!(runnable.strategy, Strategy::Assistant);

        let mut with_tools = base.clone();
        with_tools.tools = vec!["one-off-reminder".into()];
        let runnable = create_experiment_runnable(with_tools, session.clone(), ctx.clone());
        assert_eq!(runnable.strategy, Strategy::Agent);

        let runnable = create_experiment_runnable(base, session, ctx);
        assert_eq!(runnable.strategy, Strategy::Simple);
    }
}
