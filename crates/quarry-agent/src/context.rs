use quarry_core::{Message, Role};

/// Manages the context window for LLM calls.
/// Keeps the system prompt and the first (task) message pinned and drops the
/// oldest turns in between once `max_messages` is exceeded.
pub struct ContextWindow {
    messages: Vec<Message>,
    system_prompt: Option<String>,
    max_messages: usize,
}

impl ContextWindow {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            system_prompt: None,
            max_messages: max_messages.max(2),
        }
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = Some(prompt.into());
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.truncate();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The full prompt: system message first, then the conversation.
    pub fn to_prompt(&self) -> Vec<Message> {
        let mut prompt = Vec::with_capacity(self.messages.len() + 1);
        if let Some(sys) = &self.system_prompt {
            prompt.push(Message::new(Role::System, sys.clone()));
        }
        prompt.extend(self.messages.iter().cloned());
        prompt
    }

    fn truncate(&mut self) {
        if self.messages.len() > self.max_messages {
            let excess = self.messages.len() - self.max_messages;
            self.messages.drain(1..=excess);
        }
    }

    /// Rough token estimation (4 chars ≈ 1 token).
    pub fn estimated_tokens(&self) -> usize {
        let sys_tokens = self
            .system_prompt
            .as_ref()
            .map(|s| s.len() / 4)
            .unwrap_or(0);
        let msg_tokens: usize = self.messages.iter().map(|m| m.content.len() / 4).sum();
        sys_tokens + msg_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation_keeps_task_message() {
        let mut ctx = ContextWindow::new(3);
        ctx.set_system_prompt("sys");
        ctx.push(Message::user("task"));
        for i in 0..5 {
            ctx.push(Message::assistant(format!("turn {i}")));
        }
        let contents: Vec<&str> = ctx.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["task", "turn 3", "turn 4"]);

        let prompt = ctx.to_prompt();
        assert_eq!(prompt[0].role, Role::System);
        assert_eq!(prompt.len(), 4);
    }

    #[test]
    fn test_estimated_tokens() {
        let mut ctx = ContextWindow::new(10);
        ctx.set_system_prompt("a".repeat(40));
        ctx.push(Message::user("b".repeat(80)));
        assert_eq!(ctx.estimated_tokens(), 30);
    }
}
