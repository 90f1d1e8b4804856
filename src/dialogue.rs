//! Conversation transcript
//!
//! One [`Dialogue`] per session, appended only by the dispatcher. Turns are
//! rendered into provider chat messages on demand, with retrieved memory
//! folded into the system prompt.

use serde::{Deserialize, Serialize};

use crate::providers::llm::{ChatMessage, ToolCallPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One entry in the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), tool_call_id: None, tool_calls: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), tool_call_id: None, tool_calls: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), tool_call_id: None, tool_calls: None }
    }

    /// Assistant turn carrying a tool-call record and no spoken content.
    pub fn assistant_tool_call(calls: Vec<ToolCallPayload>) -> Self {
        Self { role: Role::Assistant, content: String::new(), tool_call_id: None, tool_calls: Some(calls) }
    }

    /// Tool-result turn answering the assistant call with the given id.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

/// Ordered transcript, starting with exactly one system turn.
#[derive(Debug, Default)]
pub struct Dialogue {
    turns: Vec<Turn>,
}

impl Dialogue {
    pub fn new(system_prompt: &str) -> Self {
        Self { turns: vec![Turn::system(system_prompt)] }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Last `n` non-system turns, oldest first. Used by the intent classifier.
    pub fn tail(&self, n: usize) -> Vec<&Turn> {
        let non_system: Vec<&Turn> =
            self.turns.iter().filter(|t| t.role != Role::System).collect();
        let skip = non_system.len().saturating_sub(n);
        non_system.into_iter().skip(skip).collect()
    }

    /// Render provider messages, prepending retrieved memory to the system
    /// prompt when present.
    pub fn render_with_memory(&self, memory: &str) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .map(|turn| {
                let mut msg = match turn.role {
                    Role::System if !memory.is_empty() => ChatMessage::system(format!(
                        "{}\n\n相关记忆：\n{}",
                        turn.content, memory
                    )),
                    _ => ChatMessage {
                        role: turn.role.as_str().to_string(),
                        content: Some(turn.content.clone()),
                        tool_calls: None,
                        tool_call_id: None,
                    },
                };
                msg.tool_calls = turn.tool_calls.clone();
                msg.tool_call_id = turn.tool_call_id.clone();
                if turn.tool_calls.is_some() && turn.content.is_empty() {
                    // Assistant tool-call records carry no spoken content.
                    msg.content = None;
                }
                msg
            })
            .collect()
    }

    pub fn render(&self) -> Vec<ChatMessage> {
        self.render_with_memory("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::llm::FunctionPayload;

    #[test]
    fn starts_with_system_turn() {
        let d = Dialogue::new("你是一个语音助手");
        assert_eq!(d.turns().len(), 1);
        assert_eq!(d.turns()[0].role, Role::System);
    }

    #[test]
    fn memory_is_folded_into_system_prompt() {
        let mut d = Dialogue::new("base prompt");
        d.push(Turn::user("你好"));
        let msgs = d.render_with_memory("用户喜欢爵士乐");
        assert!(msgs[0].content.as_deref().unwrap().contains("相关记忆"));
        assert!(msgs[0].content.as_deref().unwrap().contains("爵士乐"));

        let plain = d.render();
        assert_eq!(plain[0].content.as_deref(), Some("base prompt"));
    }

    #[test]
    fn tool_turns_reference_the_call_id() {
        let mut d = Dialogue::new("sys");
        d.push(Turn::user("把音量调到50"));
        let call = ToolCallPayload {
            id: "call-1".into(),
            r#type: "function".into(),
            function: FunctionPayload { name: "set_device_property".into(), arguments: "{}".into() },
        };
        d.push(Turn::assistant_tool_call(vec![call]));
        d.push(Turn::tool_result("call-1", "音量已设置"));

        let msgs = d.render();
        assert!(msgs[2].tool_calls.is_some());
        assert!(msgs[2].content.is_none());
        assert_eq!(msgs[3].tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn tail_skips_system_turn() {
        let mut d = Dialogue::new("sys");
        d.push(Turn::user("a"));
        d.push(Turn::assistant("b"));
        d.push(Turn::user("c"));
        let tail = d.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "b");
        assert_eq!(tail[1].content, "c");
    }
}
