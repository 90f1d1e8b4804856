//! Tool registry
//!
//! Process-wide registry of callable tools, populated at bootstrap and shared
//! by every session. Each tool exposes a name, a JSON-schema parameter
//! description for the LLM, and a handler receiving the session (for the
//! capability registry, music library and outbound channel) plus parsed
//! arguments.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::providers::llm::{FunctionDefinition, ToolDefinition};
use crate::server::session::{ServerFrame, SessionShared};

/// What the dispatcher should do with a tool's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Speak this text as a synthetic assistant turn and stop.
    Response(String),
    /// Record the tool result and re-enter generation for a phrased reply.
    ReqLlm(String),
    /// No such tool; surfaced to the caller, transcript untouched.
    NotFound(String),
}

/// A parsed, ready-to-dispatch tool call.
#[derive(Debug, Clone)]
pub struct ToolCallData {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> serde_json::Value;
    async fn invoke(&self, session: &Arc<SessionShared>, arguments: &serde_json::Value)
        -> Result<Action>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SetDeviceProperty));
        registry.register(Arc::new(QueryDeviceState));
        registry.register(Arc::new(PlayMusic));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Schemas advertised to the LLM in tool-enabled mode.
    pub fn schemas(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                r#type: "function".to_string(),
                function: FunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters(),
                },
            })
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub async fn dispatch(&self, session: &Arc<SessionShared>, call: &ToolCallData) -> Action {
        let Some(tool) = self.tools.get(&call.name) else {
            return Action::NotFound(format!("没有找到名为 {} 的工具", call.name));
        };
        info!("executing tool {}", call.name);
        match tool.invoke(session, &call.arguments).await {
            Ok(action) => action,
            Err(e) => {
                warn!("tool {} failed: {}", call.name, e);
                Action::Response(format!("操作失败：{}", e))
            }
        }
    }
}

// ─── Built-in tools ──────────────────────────────────────────

/// Invoke a method on a declared device capability (emits an iot command).
struct SetDeviceProperty;

#[async_trait]
impl Tool for SetDeviceProperty {
    fn name(&self) -> &str {
        "set_device_property"
    }

    fn description(&self) -> &str {
        "控制设备，比如调整音量、开关设备。需要设备名称、方法名称和参数。"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "设备能力名称，例如 Speaker"},
                "method": {"type": "string", "description": "要调用的方法，例如 SetVolume"},
                "parameters": {"type": "object", "description": "方法参数"}
            },
            "required": ["name", "method"]
        })
    }

    async fn invoke(
        &self,
        session: &Arc<SessionShared>,
        arguments: &serde_json::Value,
    ) -> Result<Action> {
        let name = arguments.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        let method = arguments.get("method").and_then(|v| v.as_str()).unwrap_or_default();
        let parameters =
            arguments.get("parameters").cloned().unwrap_or_else(|| serde_json::json!({}));

        let command = session.iot.read().await.build_command(name, method, parameters);
        match command {
            Some(command) => {
                session.send_frame(ServerFrame::Iot { commands: vec![command] }).await;
                Ok(Action::ReqLlm(format!("已向设备 {} 发送 {} 指令", name, method)))
            }
            None => Ok(Action::Response(format!("设备 {} 不支持 {} 操作", name, method))),
        }
    }
}

/// Read back a declared property value.
struct QueryDeviceState;

#[async_trait]
impl Tool for QueryDeviceState {
    fn name(&self) -> &str {
        "query_device_state"
    }

    fn description(&self) -> &str {
        "查询设备的当前状态，比如音量、开关。需要设备名称和属性名称。"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "设备能力名称"},
                "property": {"type": "string", "description": "属性名称"}
            },
            "required": ["name", "property"]
        })
    }

    async fn invoke(
        &self,
        session: &Arc<SessionShared>,
        arguments: &serde_json::Value,
    ) -> Result<Action> {
        let name = arguments.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        let property = arguments.get("property").and_then(|v| v.as_str()).unwrap_or_default();
        match session.iot.read().await.property(name, property) {
            Some(value) => {
                Ok(Action::ReqLlm(format!("设备 {} 的 {} 当前为 {}", name, property, value)))
            }
            None => Ok(Action::Response(format!("没有找到设备 {} 的 {} 状态", name, property))),
        }
    }
}

/// Queue a local music file for playback. The playback path announces itself,
/// so a successful call needs no spoken response of its own.
struct PlayMusic;

#[async_trait]
impl Tool for PlayMusic {
    fn name(&self) -> &str {
        "play_music"
    }

    fn description(&self) -> &str {
        "播放本地音乐。可以指定歌名，不指定则随机播放。"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "song_name": {"type": "string", "description": "要播放的歌曲名称，可选"}
            }
        })
    }

    async fn invoke(
        &self,
        session: &Arc<SessionShared>,
        arguments: &serde_json::Value,
    ) -> Result<Action> {
        let requested = arguments.get("song_name").and_then(|v| v.as_str());
        session.music.play(session, requested).await?;
        Ok(Action::Response(String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_schemas_are_complete() {
        let registry = ToolRegistry::with_builtins();
        let schemas = registry.schemas();
        let names: Vec<&str> = schemas.iter().map(|d| d.function.name.as_str()).collect();
        assert_eq!(names, vec!["play_music", "query_device_state", "set_device_property"]);
        for def in &schemas {
            assert_eq!(def.r#type, "function");
            assert!(!def.function.description.is_empty());
            assert_eq!(def.function.parameters["type"], "object");
        }
    }
}
