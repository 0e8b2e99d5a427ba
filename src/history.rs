//! Conversation turn history.
//!
//! Append-only within a session. The persona system turn is always first and
//! survives `reset()`; it is included in every completion request but never
//! shown on a display surface.

use serde::{Deserialize, Serialize};

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// Ordered, append-only sequence of turns, owned by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct History {
    turns: Vec<Turn>,
}

impl History {
    /// Create a history seeded with the persona system turn.
    pub fn new(persona: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::new(Role::System, persona)],
        }
    }

    /// Append a user turn.
    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::new(Role::User, text));
    }

    /// Append an empty assistant turn that fragments will fill in.
    pub fn push_assistant_placeholder(&mut self) {
        self.turns.push(Turn::new(Role::Assistant, ""));
    }

    /// Set the text of the trailing assistant turn to the full accumulated
    /// value. No-op when the last turn is not an assistant turn.
    ///
    /// Replacing rather than appending keeps the reduction idempotent under
    /// retried or duplicated fragments.
    pub fn set_assistant_text(&mut self, text: &str) {
        if let Some(last) = self.turns.last_mut()
            && last.role == Role::Assistant
        {
            last.text.clear();
            last.text.push_str(text);
        }
    }

    /// Text of the trailing assistant turn, if the last turn is one.
    pub fn last_assistant_text(&self) -> Option<&str> {
        match self.turns.last() {
            Some(turn) if turn.role == Role::Assistant => Some(&turn.text),
            _ => None,
        }
    }

    /// All turns in order, system turn first.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Turns visible on a display surface (the system turn is hidden).
    pub fn visible_turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|t| t.role != Role::System)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Reset to just the initial system turn.
    pub fn reset(&mut self) {
        self.turns.truncate(1);
    }
}
