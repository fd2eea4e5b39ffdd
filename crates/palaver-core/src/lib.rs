pub mod error;
pub mod events;
pub mod history;
pub mod orchestrator;
pub mod prompt;
pub mod runnables;
pub mod tools;

pub use error::CoreError;
pub use events::{NullSink, RecordingSink, TriggerQueue, TriggerSink};
pub use orchestrator::ChannelGateway;
pub use runnables::{
    create_experiment_runnable, ExperimentRunnable, RunnableContext, RunnableOptions,
    AGENT_MAX_EXECUTION_SECS,
};
pub use tools::{builtin_tools, AgentTool, OneOffReminderTool, ToolRegistry, UpdateParticipantDataTool};
