//! Conversation memory: turning the persisted chat log into model messages,
//! compressed to fit the experiment's token budget.

use palaver_provider::LlmMessage;
use palaver_schema::ChatMessageType;
use palaver_store::ChatMessageRecord;

/// Approximate token count from text (chars / 4). Actual tokenization
/// varies by model; the budget is advisory.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Drop oldest turns until the remaining history fits `max_token_limit`.
/// A limit of 0 disables compression. The newest message always survives.
pub fn compress_chat_history(
    messages: &[ChatMessageRecord],
    max_token_limit: usize,
) -> Vec<ChatMessageRecord> {
    if max_token_limit == 0 || messages.is_empty() {
        return messages.to_vec();
    }

    let mut start = 0;
    let mut total: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
    while total > max_token_limit && start < messages.len() - 1 {
        total -= estimate_tokens(&messages[start].content);
        start += 1;
    }
    messages[start..].to_vec()
}

/// Map chat log entries onto provider message roles.
pub fn to_llm_messages(messages: &[ChatMessageRecord]) -> Vec<LlmMessage> {
    messages
        .iter()
        .map(|m| match m.message_type {
            ChatMessageType::Human => LlmMessage::user(m.content.clone()),
            ChatMessageType::Ai => LlmMessage::assistant(m.content.clone()),
            ChatMessageType::System => LlmMessage::system(m.content.clone()),
        })
        .collect()
}
