//! Agent tools: capabilities the model can call in agent mode. Tools act on
//! the session (scheduling reminders, updating participant memory) through
//! the store.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::DateTime;
use palaver_provider::ToolDef;
use palaver_store::{SessionRecord, SessionStore};

#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(
        &self,
        session: &SessionRecord,
        input: serde_json::Value,
    ) -> Result<String>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Definitions for the named tools, skipping unknown names.
    pub fn defs(&self, names: &[String]) -> Vec<ToolDef> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDef {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    pub async fn execute(
        &self,
        name: &str,
        session: &SessionRecord,
        input: serde_json::Value,
    ) -> Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow!("unknown tool: {name}"))?;
        tool.execute(session, input).await
    }
}

/// Schedules a single reminder message for the participant.
pub struct OneOffReminderTool {
    store: SessionStore,
}

impl OneOffReminderTool {
    pub const NAME: &'static str = "one-off-reminder";

    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AgentTool for OneOffReminderTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Schedule a one-off reminder message to be sent to the user at a given time."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {"type": "string", "description": "Reminder text to deliver"},
                "due_at": {"type": "string", "description": "RFC 3339 timestamp for delivery"}
            },
            "required": ["message", "due_at"]
        })
    }

    async fn execute(
        &self,
        session: &SessionRecord,
        input: serde_json::Value,
    ) -> Result<String> {
        let message = input
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("reminder requires a message"))?;
        let due_raw = input
            .get("due_at")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("reminder requires due_at"))?;
        let due_at = DateTime::parse_from_rfc3339(due_raw)
            .map_err(|e| anyhow!("invalid due_at: {e}"))?
            .with_timezone(&chrono::Utc);

        self.store
            .insert_scheduled_message(session.id, message, due_at)
            .await?;
        Ok(format!("Reminder scheduled for {due_raw}"))
    }
}

/// Stores a key-value fact about the participant (timezone, name, custom
/// fields) scoped to the experiment.
pub struct UpdateParticipantDataTool {
    store: SessionStore,
}

impl UpdateParticipantDataTool {
    pub const NAME: &'static str = "update-participant-data";

    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AgentTool for UpdateParticipantDataTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Remember a fact about the user, stored as a key-value pair."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": {"type": "string"},
                "value": {"type": "string"}
            },
            "required": ["key", "value"]
        })
    }

    async fn execute(
        &self,
        session: &SessionRecord,
        input: serde_json::Value,
    ) -> Result<String> {
        let key = input
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("update requires a key"))?;
        let value = input
            .get("value")
            .cloned()
            .ok_or_else(|| anyhow!("update requires a value"))?;

        let mut data = serde_json::Map::new();
        data.insert(key.to_string(), value);
        self.store
            .update_participant_data(session.participant_id, &session.experiment_id, data)
            .await?;
        Ok(format!("Stored {key}"))
    }
}

/// Registry with the built-in tools wired to the store.
pub fn builtin_tools(store: &SessionStore) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(OneOffReminderTool::new(store.clone())));
    registry.register(Arc::new(UpdateParticipantDataTool::new(store.clone())));
    registry
}
