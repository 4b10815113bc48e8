use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use crate::core::registry::{Priority, SessionId};
use crate::core::{AgentMuxError, ToolKind};

/// Messages a client sends over the control channel. `type` is parsed by
/// hand rather than through a tagged-enum derive because `start_<tool>`
/// encodes the tool name directly in the tag rather than in a field.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    CreateSession {
        name: Option<String>,
        working_dir: Option<String>,
    },
    JoinSession {
        session_id: SessionId,
    },
    LeaveSession,
    Start {
        tool: ToolKind,
        cols: Option<u16>,
        rows: Option<u16>,
        dangerously_skip_permissions: bool,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Stop,
    SetPriority {
        sessions: Vec<(SessionId, Priority)>,
    },
    FlowControl {
        paused: bool,
    },
    Ping,
}

impl ClientMessage {
    pub fn parse(value: &Value) -> Result<Self, AgentMuxError> {
        let ty = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentMuxError::Validation("message missing 'type'".into()))?;

        if let Some(tool_name) = ty.strip_prefix("start_") {
            let tool = ToolKind::from_str_opt(tool_name)
                .ok_or_else(|| AgentMuxError::Validation(format!("unknown tool '{tool_name}'")))?;
            return Ok(Self::Start {
                tool,
                cols: value.get("cols").and_then(Value::as_u64).map(|v| v as u16),
                rows: value.get("rows").and_then(Value::as_u64).map(|v| v as u16),
                dangerously_skip_permissions: value
                    .get("dangerouslySkipPermissions")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }

        match ty {
            "create_session" => Ok(Self::CreateSession {
                name: value.get("name").and_then(Value::as_str).map(String::from),
                working_dir: value.get("workingDir").and_then(Value::as_str).map(String::from),
            }),
            "join_session" => {
                let session_id = value
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| AgentMuxError::Validation("join_session requires a valid 'sessionId'".into()))?;
                Ok(Self::JoinSession { session_id })
            }
            "leave_session" => Ok(Self::LeaveSession),
            "input" => {
                let data = value
                    .get("data")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AgentMuxError::Validation("input requires a string 'data'".into()))?
                    .to_string();
                Ok(Self::Input { data })
            }
            "resize" => {
                let cols = value
                    .get("cols")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| AgentMuxError::Validation("resize requires 'cols'".into()))? as u16;
                let rows = value
                    .get("rows")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| AgentMuxError::Validation("resize requires 'rows'".into()))? as u16;
                if cols == 0 || rows == 0 || cols > 500 || rows > 500 {
                    return Err(AgentMuxError::Validation("cols/rows must be in 1..=500".into()));
                }
                Ok(Self::Resize { cols, rows })
            }
            "stop" => Ok(Self::Stop),
            "set_priority" => {
                let entries = value
                    .get("sessions")
                    .and_then(Value::as_array)
                    .ok_or_else(|| AgentMuxError::Validation("set_priority requires a 'sessions' array".into()))?;
                let mut sessions = Vec::with_capacity(entries.len());
                for entry in entries {
                    let session_id = entry
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| AgentMuxError::Validation("set_priority entry requires a valid 'sessionId'".into()))?;
                    let priority = match entry.get("priority").and_then(Value::as_str) {
                        Some("background") => Priority::Background,
                        Some("foreground") | None => Priority::Foreground,
                        Some(other) => return Err(AgentMuxError::Validation(format!("unknown priority '{other}'"))),
                    };
                    sessions.push((session_id, priority));
                }
                Ok(Self::SetPriority { sessions })
            }
            "flow_control" => {
                let paused = value
                    .get("paused")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| AgentMuxError::Validation("flow_control requires boolean 'paused'".into()))?;
                Ok(Self::FlowControl { paused })
            }
            "ping" => Ok(Self::Ping),
            other => Err(AgentMuxError::Validation(format!("unknown message type '{other}'"))),
        }
    }
}

/// Messages the server sends back over the control channel. Output itself
/// travels as binary WebSocket frames, never through this enum.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: u64,
    },
    Error {
        message: String,
    },
    SessionCreated {
        session_id: SessionId,
        name: String,
        working_dir: PathBuf,
    },
    SessionJoined {
        session_id: SessionId,
        backlog_chunks: usize,
    },
    SessionLeft {
        session_id: SessionId,
    },
    SessionActivity {
        session_id: SessionId,
    },
    SessionDeleted {
        session_id: SessionId,
    },
    ToolStarted {
        session_id: SessionId,
        tool: ToolKind,
    },
    ToolStopped {
        session_id: SessionId,
        tool: ToolKind,
    },
    Exit {
        session_id: SessionId,
        code: Option<i32>,
        signal: Option<i32>,
    },
    ServerRestarting {
        reason: String,
    },
    MemoryWarning {
        resident_bytes: u64,
    },
    Pong,
}
