//! Shared data types flowing between the call session's tasks.

use serde::{Deserialize, Serialize};

/// One inbound or outbound chunk of telephony audio: μ-law bytes plus the
/// per-call monotonically increasing sequence number.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// One speech-recognition result for a call, ordered by `sequence`.
/// A final event closes the current utterance window.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    pub sequence: u64,
    pub confidence: Option<f32>,
}

/// A finalized caller turn: the unit the agent decides to respond to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    /// Sequence number of the finalizing transcript event.
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message of LLM context, in the chat-completions wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Echo of the provider's tool_calls array on assistant messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), tool_call_id: None, tool_calls: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), tool_call_id: None, tool_calls: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// The assistant message that requested a tool invocation, echoed back
    /// so the provider can pair it with the tool result.
    pub fn assistant_tool_calls(tool_calls: serde_json::Value) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_call_id: None,
            tool_calls: Some(tool_calls),
        }
    }

    pub fn tool(content: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: None,
        }
    }
}

/// Bounded short-term conversational memory: the last N (utterance, reply)
/// exchanges, oldest first.
#[derive(Debug, Default)]
pub struct ConversationHistory {
    exchanges: std::collections::VecDeque<(String, String)>,
    max_turns: usize,
}

impl ConversationHistory {
    pub fn new(max_turns: usize) -> Self {
        Self { exchanges: std::collections::VecDeque::new(), max_turns }
    }

    pub fn push(&mut self, utterance: String, reply: String) {
        self.exchanges.push_back((utterance, reply));
        while self.exchanges.len() > self.max_turns {
            self.exchanges.pop_front();
        }
    }

    /// Render the retained exchanges as alternating user/assistant messages.
    pub fn as_messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.exchanges.len() * 2);
        for (utterance, reply) in &self.exchanges {
            out.push(ChatMessage::user(utterance.clone()));
            out.push(ChatMessage::assistant(reply.clone()));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
