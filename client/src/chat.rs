use crate::protocol::ChatMessage;

/// Ephemeral chat feed for one session: append-only, arrival order, no
/// deduplication. Nothing survives a reload.
#[derive(Default)]
pub struct ChatFeed {
    schedule_id: u64,
    messages: Vec<ChatMessage>,
}

impl ChatFeed {
    pub fn new(schedule_id: u64) -> Self {
        Self {
            schedule_id,
            messages: Vec::new(),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Append a client-injected lifecycle notice.
    pub fn push_system(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::system(self.schedule_id, text));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

/// Trim outbound chat input; empty submissions are a no-op.
pub fn compose_outbound(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
