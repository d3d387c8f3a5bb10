//! Inbound hook events
//!
//! Tool calls arrive either as a native tool name or wrapped in a generic
//! MCP `call_tool` invocation carrying `server_name`/`tool_name` in its
//! arguments. The shape is resolved once into [`ToolInvocation`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    BeforeTool,
    AfterTool,
    PromptSubmit,
    Stop,
    PreCompact,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::SessionEnd => "session_end",
            EventKind::BeforeTool => "before_tool",
            EventKind::AfterTool => "after_tool",
            EventKind::PromptSubmit => "prompt_submit",
            EventKind::Stop => "stop",
            EventKind::PreCompact => "pre_compact",
        }
    }

    /// Key under which workflow triggers for this event are declared.
    pub fn trigger_key(&self) -> String {
        format!("on_{}", self.as_str())
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.strip_prefix("on_").unwrap_or(name);
        match name {
            "session_start" => Some(EventKind::SessionStart),
            "session_end" => Some(EventKind::SessionEnd),
            "before_tool" => Some(EventKind::BeforeTool),
            "after_tool" => Some(EventKind::AfterTool),
            "prompt_submit" => Some(EventKind::PromptSubmit),
            "stop" => Some(EventKind::Stop),
            "pre_compact" => Some(EventKind::PreCompact),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool call shape, resolved once at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolInvocation {
    Native {
        name: String,
    },
    Mcp {
        /// Raw wrapper tool name (`call_tool` or `<prefix>__call_tool`)
        wrapper: String,
        server: Option<String>,
        tool: Option<String>,
    },
}

pub fn is_call_tool_wrapper(name: &str) -> bool {
    name == "call_tool" || name.ends_with("__call_tool")
}

impl ToolInvocation {
    pub fn resolve(tool_name: &str, tool_input: &Value) -> Self {
        if !is_call_tool_wrapper(tool_name) {
            return ToolInvocation::Native {
                name: tool_name.to_string(),
            };
        }

        // Some clients nest the call under `arguments`
        let field = |key: &str| {
            tool_input
                .get(key)
                .or_else(|| tool_input.get("arguments").and_then(|a| a.get(key)))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        ToolInvocation::Mcp {
            wrapper: tool_name.to_string(),
            server: field("server_name"),
            tool: field("tool_name"),
        }
    }

    /// Raw tool name as reported by the client.
    pub fn raw_name(&self) -> &str {
        match self {
            ToolInvocation::Native { name } => name,
            ToolInvocation::Mcp { wrapper, .. } => wrapper,
        }
    }

    pub fn mcp_server(&self) -> Option<&str> {
        match self {
            ToolInvocation::Mcp { server, .. } => server.as_deref(),
            ToolInvocation::Native { .. } => None,
        }
    }

    pub fn mcp_tool(&self) -> Option<&str> {
        match self {
            ToolInvocation::Mcp { tool, .. } => tool.as_deref(),
            ToolInvocation::Native { .. } => None,
        }
    }
}

/// A hook event as received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    pub kind: EventKind,
    pub session_id: String,
    #[serde(default)]
    pub tool: Option<ToolInvocation>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl HookEvent {
    pub fn new(kind: EventKind, session_id: &str) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            tool: None,
            data: Map::new(),
        }
    }

    pub fn tool_call(kind: EventKind, session_id: &str, tool_name: &str, tool_input: Value) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            tool: Some(ToolInvocation::resolve(tool_name, &tool_input)),
            data: Map::new(),
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.tool.as_ref().map(ToolInvocation::raw_name)
    }
}

/// Wire form of a hook event before tool shape resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct RawHookEvent {
    pub event: String,
    pub session_id: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl RawHookEvent {
    pub fn into_event(self) -> Option<HookEvent> {
        let kind = EventKind::parse(&self.event)?;
        let input = self.tool_input.unwrap_or(Value::Null);
        let tool = self
            .tool_name
            .map(|name| ToolInvocation::resolve(&name, &input));
        Some(HookEvent {
            kind,
            session_id: self.session_id,
            tool,
            data: self.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_native_tool_resolution() {
        let tool = ToolInvocation::resolve("Edit", &json!({"file_path": "a.rs"}));
        assert_eq!(tool, ToolInvocation::Native { name: "Edit".to_string() });
        assert_eq!(tool.mcp_server(), None);
    }

    #[test]
    fn test_mcp_wrapper_resolution() {
        let tool = ToolInvocation::resolve(
            "mcp__gantry__call_tool",
            &json!({"server_name": "tasks", "tool_name": "close_task"}),
        );
        assert_eq!(tool.mcp_server(), Some("tasks"));
        assert_eq!(tool.mcp_tool(), Some("close_task"));
        assert_eq!(tool.raw_name(), "mcp__gantry__call_tool");

        let nested = ToolInvocation::resolve(
            "call_tool",
            &json!({"arguments": {"server_name": "memory", "tool_name": "search"}}),
        );
        assert_eq!(nested.mcp_server(), Some("memory"));
    }

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!(EventKind::parse("after_tool"), Some(EventKind::AfterTool));
        assert_eq!(EventKind::parse("on_session_start"), Some(EventKind::SessionStart));
        assert_eq!(EventKind::parse("bogus"), None);
        assert_eq!(EventKind::SessionStart.trigger_key(), "on_session_start");
    }

    #[test]
    fn test_raw_event_conversion() {
        let raw: RawHookEvent = serde_json::from_value(json!({
            "event": "before_tool",
            "session_id": "s1",
            "tool_name": "Bash",
            "tool_input": {"command": "ls"}
        }))
        .unwrap();
        let event = raw.into_event().unwrap();
        assert_eq!(event.kind, EventKind::BeforeTool);
        assert_eq!(event.tool_name(), Some("Bash"));
    }
}
