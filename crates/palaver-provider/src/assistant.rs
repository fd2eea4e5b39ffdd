//! Client for provider-hosted assistant threads.
//!
//! The conversation context lives on the provider's side: a thread id is
//! persisted per chat and reused across turns. Submitting a message while a
//! prior run on the same thread is still active fails with a structural
//! 400; callers recover by cancelling the stuck run and retrying.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssistantError {
    /// Non-2xx reply from the provider; `message` is the body's error text.
    #[error("assistant api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("assistant request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("assistant reply missing from thread {0}")]
    MissingReply(String),
}

impl AssistantError {
    /// Whether this is the HTTP 400 class where the body may describe an
    /// active run blocking the thread.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::Api { status: 400, .. })
    }

    pub fn message(&self) -> String {
        match self {
            Self::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Failed | Self::Completed | Self::Incomplete | Self::Expired
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    pub thread_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub usage: Option<RunUsage>,
    #[serde(default)]
    pub last_error: Option<RunError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AssistantClient {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    /// Sleep between run-status polls.
    pub poll_interval: std::time::Duration,
}

impl AssistantClient {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            poll_interval: std::time::Duration::from_millis(1000),
        }
    }

    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_base))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn check<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, AssistantError> {
        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(AssistantError::Api {
                status: status.as_u16(),
                message,
            });
        }
        resp.json().await.map_err(AssistantError::from)
    }

    pub async fn create_thread(&self) -> Result<String, AssistantError> {
        let resp = self
            .request(reqwest::Method::POST, "/threads")
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let thread: ThreadObject = Self::check(resp).await?;
        Ok(thread.id)
    }

    /// Append a user message to the thread. Fails with a 400 naming the
    /// blocking run while another run on the thread is still active.
    pub async fn add_message(&self, thread_id: &str, content: &str) -> Result<(), AssistantError> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/threads/{thread_id}/messages"),
            )
            .json(&serde_json::json!({"role": "user", "content": content}))
            .send()
            .await?;
        let _: serde_json::Value = Self::check(resp).await?;
        Ok(())
    }

    pub async fn create_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        instructions: Option<&str>,
    ) -> Result<Run, AssistantError> {
        let mut body = serde_json::json!({"assistant_id": assistant_id});
        if let Some(instructions) = instructions {
            body["instructions"] = serde_json::Value::String(instructions.to_string());
        }
        let resp = self
            .request(reqwest::Method::POST, &format!("/threads/{thread_id}/runs"))
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await
    }

    pub async fn retrieve_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<Run, AssistantError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/threads/{thread_id}/runs/{run_id}"),
            )
            .send()
            .await?;
        Self::check(resp).await
    }

    pub async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AssistantError> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/threads/{thread_id}/runs/{run_id}/cancel"),
            )
            .send()
            .await?;
        Self::check(resp).await
    }

    /// Block until the run leaves its non-terminal states, sleeping
    /// `poll_interval` between checks.
    pub async fn wait_for_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AssistantError> {
        loop {
            let run = self.retrieve_run(thread_id, run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Newest assistant message text on the thread.
    pub async fn latest_assistant_message(
        &self,
        thread_id: &str,
    ) -> Result<String, AssistantError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/threads/{thread_id}/messages?order=desc&limit=10"),
            )
            .send()
            .await?;
        let list: MessageList = Self::check(resp).await?;
        list.data
            .into_iter()
            .find(|m| m.role == "assistant")
            .map(|m| {
                m.content
                    .into_iter()
                    .filter_map(|c| c.text.map(|t| t.value))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .ok_or_else(|| AssistantError::MissingReply(thread_id.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ThreadObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    role: String,
    content: Vec<MessageContentPart>,
}

#[derive(Debug, Deserialize)]
struct MessageContentPart {
    #[serde(default)]
    text: Option<MessageText>,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}
