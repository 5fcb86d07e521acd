//! Bounded conversation history with a pinned system prompt.

use std::collections::VecDeque;

use super::types::{Message, Role};

/// Characters per token in the rough estimate.
const CHARS_PER_TOKEN: usize = 4;

/// Flat cost added for every message.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Rough token count of `text`: one token per four characters, and at
/// least one for any non-empty text.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() / CHARS_PER_TOKEN).max(1)
}

/// Rough token count of a message, including the calls it issues.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|call| {
            let arguments = serde_json::to_string(&call.arguments).unwrap_or_default();
            estimate_tokens(&call.name) + estimate_tokens(&arguments)
        })
        .sum();
    MESSAGE_OVERHEAD_TOKENS + estimate_tokens(&message.content) + calls
}

/// Message history owned by one executor.
///
/// The system prompt is pinned outside the bounded window. When the window
/// exceeds `max_messages`, or the estimated tokens of prompt plus window
/// exceed a non-zero `max_tokens`, the oldest messages are evicted first.
/// The last user message and everything after it are always kept. A tool
/// message left at the head after eviction is evicted as well, since the
/// assistant message that issued its call is gone.
#[derive(Debug, Clone)]
pub struct ConversationState {
    system: Option<Message>,
    messages: VecDeque<Message>,
    max_messages: usize,
    max_tokens: usize,
}

impl ConversationState {
    pub fn new(system_prompt: Option<String>, max_messages: usize) -> Self {
        Self {
            system: system_prompt.map(Message::system),
            messages: VecDeque::new(),
            max_messages: max_messages.max(1),
            max_tokens: 0,
        }
    }

    /// Also bound the history by estimated tokens. 0 disables the budget.
    #[must_use]
    pub fn with_token_budget(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self.enforce_bound();
        self
    }

    /// Replace the pinned system prompt.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system = Some(Message::system(prompt));
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system.as_ref().map(|m| m.content.as_str())
    }

    /// Append one message and enforce the bound.
    pub fn push(&mut self, message: Message) {
        self.messages.push_back(message);
        self.enforce_bound();
    }

    /// Append several messages as one unit, then enforce the bound.
    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
        self.enforce_bound();
    }

    fn enforce_bound(&mut self) {
        // Without a user turn only the newest message is protected.
        let mut evictable = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or_else(|| self.messages.len().saturating_sub(1));

        let mut tokens = self.estimated_tokens();
        while evictable > 0 && self.over_bound(tokens) {
            if let Some(evicted) = self.messages.pop_front() {
                tokens = tokens.saturating_sub(estimate_message_tokens(&evicted));
            }
            evictable -= 1;
        }
        self.drop_orphaned_tool_messages(evictable);
    }

    fn over_bound(&self, tokens: usize) -> bool {
        self.messages.len() > self.max_messages || (self.max_tokens > 0 && tokens > self.max_tokens)
    }

    fn drop_orphaned_tool_messages(&mut self, limit: usize) {
        let mut remaining = limit;
        while remaining > 0 && self.messages.front().is_some_and(|m| m.role == Role::Tool) {
            self.messages.pop_front();
            remaining -= 1;
        }
    }

    /// Full history as sent to a provider: system prompt first.
    pub fn snapshot(&self) -> Vec<Message> {
        self.system
            .iter()
            .chain(self.messages.iter())
            .cloned()
            .collect()
    }

    /// Messages in the bounded window (system prompt excluded).
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.back()
    }

    /// Number of messages in the bounded window.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub const fn max_messages(&self) -> usize {
        self.max_messages
    }

    pub const fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Estimated tokens of the system prompt plus the window.
    pub fn estimated_tokens(&self) -> usize {
        self.system
            .iter()
            .chain(self.messages.iter())
            .map(estimate_message_tokens)
            .sum()
    }

    /// Drop all history but keep the system prompt.
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
