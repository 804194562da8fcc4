//! JSON protocol spoken between an agent and the orchestration server.
//!
//! Every frame is an [`Envelope`]; the payload stays opaque until the
//! `type` tag says how to read it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Closed set of envelope tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    RegisterAck,
    Heartbeat,
    HeartbeatAck,
    TaskAssign,
    TaskAccepted,
    TaskRejected,
    TaskStop,
    StreamEvent,
    TaskComplete,
    FileRead,
    FileReadResp,
    TreeRead,
    TreeReadResp,
    ProjectCreate,
    ProjectCreateResp,
}

impl MessageType {
    pub const ALL: [MessageType; 16] = [
        MessageType::Register,
        MessageType::RegisterAck,
        MessageType::Heartbeat,
        MessageType::HeartbeatAck,
        MessageType::TaskAssign,
        MessageType::TaskAccepted,
        MessageType::TaskRejected,
        MessageType::TaskStop,
        MessageType::StreamEvent,
        MessageType::TaskComplete,
        MessageType::FileRead,
        MessageType::FileReadResp,
        MessageType::TreeRead,
        MessageType::TreeReadResp,
        MessageType::ProjectCreate,
        MessageType::ProjectCreateResp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Register => "register",
            MessageType::RegisterAck => "register_ack",
            MessageType::Heartbeat => "heartbeat",
            MessageType::HeartbeatAck => "heartbeat_ack",
            MessageType::TaskAssign => "task_assign",
            MessageType::TaskAccepted => "task_accepted",
            MessageType::TaskRejected => "task_rejected",
            MessageType::TaskStop => "task_stop",
            MessageType::StreamEvent => "stream_event",
            MessageType::TaskComplete => "task_complete",
            MessageType::FileRead => "file_read",
            MessageType::FileReadResp => "file_read_resp",
            MessageType::TreeRead => "tree_read",
            MessageType::TreeReadResp => "tree_read_resp",
            MessageType::ProjectCreate => "project_create",
            MessageType::ProjectCreateResp => "project_create_resp",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == tag)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    /// Wall clock milliseconds at the time the frame was written
    #[serde(default)]
    pub ts: i64,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.as_str().to_string(),
            payload: serde_json::to_value(payload)?,
            ts: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Frame)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::parse(&self.kind)
    }

    /// Deserialize the payload into a concrete body.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| ProtocolError::Payload {
            kind: self.kind.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Frame(#[source] serde_json::Error),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("unexpected {0} from server")]
    Unexpected(MessageType),
    #[error("bad {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Messages the server sends to an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    RegisterAck(RegisterAck),
    HeartbeatAck,
    TaskAssign(TaskAssign),
    TaskStop(TaskStop),
    FileRead(FileRead),
    TreeRead(TreeRead),
    ProjectCreate(ProjectCreate),
}

impl Inbound {
    pub fn decode(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let kind = envelope
            .message_type()
            .ok_or_else(|| ProtocolError::UnknownType(envelope.kind.clone()))?;
        match kind {
            MessageType::RegisterAck => Ok(Inbound::RegisterAck(envelope.decode()?)),
            MessageType::HeartbeatAck => Ok(Inbound::HeartbeatAck),
            MessageType::TaskAssign => Ok(Inbound::TaskAssign(envelope.decode()?)),
            MessageType::TaskStop => Ok(Inbound::TaskStop(envelope.decode()?)),
            MessageType::FileRead => Ok(Inbound::FileRead(envelope.decode()?)),
            MessageType::TreeRead => Ok(Inbound::TreeRead(envelope.decode()?)),
            MessageType::ProjectCreate => Ok(Inbound::ProjectCreate(envelope.decode()?)),
            other => Err(ProtocolError::Unexpected(other)),
        }
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Inbound::RegisterAck(_) => MessageType::RegisterAck,
            Inbound::HeartbeatAck => MessageType::HeartbeatAck,
            Inbound::TaskAssign(_) => MessageType::TaskAssign,
            Inbound::TaskStop(_) => MessageType::TaskStop,
            Inbound::FileRead(_) => MessageType::FileRead,
            Inbound::TreeRead(_) => MessageType::TreeRead,
            Inbound::ProjectCreate(_) => MessageType::ProjectCreate,
        }
    }
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub workspaces: Vec<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claudecode_models: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opencode_models: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    pub max_concurrent: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: String,
    pub active_sessions: usize,
    pub load: f64,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claudecode_models: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opencode_models: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

/// A unit of work assigned by the server. Both agents read the same body;
/// the deploy agent only looks at the deploy related fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskAssign {
    pub session_id: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_turns: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool: String,
    #[serde(default)]
    pub auto_deploy: bool,
    #[serde(default)]
    pub deploy_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRejected {
    pub session_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStop {
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskComplete {
    pub session_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl TaskComplete {
    pub fn done(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            status: TaskStatus::Done,
            error: String::new(),
        }
    }

    pub fn failed(session_id: &str, error: impl std::fmt::Display) -> Self {
        let mut error = error.to_string();
        if error.is_empty() {
            error = "task failed".to_string();
        }
        Self {
            session_id: session_id.to_string(),
            status: TaskStatus::Error,
            error,
        }
    }
}

/// Progress reported while a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    System {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Assistant {
        text: String,
    },
    Tool {
        text: String,
        tool_name: String,
        /// JSON encoded arguments as the tool received them
        #[serde(default, skip_serializing_if = "String::is_empty")]
        tool_input: String,
    },
    User {
        text: String,
    },
    Error {
        text: String,
    },
    Result(RunMetrics),
}

/// Terminal (or per step) accounting for a coding run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub num_turns: u64,
    #[serde(default)]
    pub done: bool,
}

impl StreamEvent {
    pub fn system(text: impl Into<String>) -> Self {
        StreamEvent::System {
            text: text.into(),
            session_id: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        StreamEvent::Error { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        StreamEvent::Assistant { text: text.into() }
    }

    pub fn tool(name: impl Into<String>, input: impl Into<String>, text: impl Into<String>) -> Self {
        StreamEvent::Tool {
            text: text.into(),
            tool_name: name.into(),
            tool_input: input.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::System { .. } => "system",
            StreamEvent::Assistant { .. } => "assistant",
            StreamEvent::Tool { .. } => "tool",
            StreamEvent::User { .. } => "user",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Result(_) => "result",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            StreamEvent::System { text, .. }
            | StreamEvent::Assistant { text }
            | StreamEvent::Tool { text, .. }
            | StreamEvent::User { text }
            | StreamEvent::Error { text } => text,
            StreamEvent::Result(metrics) => &metrics.text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEventPayload {
    pub session_id: String,
    pub event: StreamEvent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileRead {
    pub request_id: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileReadResp {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeRead {
    pub request_id: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub max_depth: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeReadResp {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<DirNode>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectCreate {
    pub request_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectCreateResp {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// One entry of a project tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirNode {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DirNode>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_message_type_tags() {
        for kind in MessageType::ALL {
            let encoded = serde_json::to_value(kind).unwrap();
            assert_eq!(encoded, json!(kind.as_str()));
            assert_eq!(MessageType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageType::parse("bogus"), None);
    }

    #[test]
    fn test_envelope_stamps_time() {
        let before = chrono::Utc::now().timestamp_millis();
        let env = Envelope::new(
            MessageType::TaskAccepted,
            &TaskAccepted {
                session_id: "abc".to_string(),
            },
        )
        .unwrap();
        assert_eq!(env.kind, "task_accepted");
        assert_eq!(env.payload, json!({"session_id": "abc"}));
        assert!(env.ts >= before);
    }

    #[test]
    fn test_decode_task_assign_with_defaults() {
        let text = r#"{"type":"task_assign","payload":{"session_id":"abc","project":"proj1","prompt":"hello"},"ts":1}"#;
        let env = Envelope::from_text(text).unwrap();
        match Inbound::decode(&env).unwrap() {
            Inbound::TaskAssign(task) => {
                assert_eq!(task.session_id, "abc");
                assert_eq!(task.project, "proj1");
                assert_eq!(task.max_turns, 0);
                assert!(!task.auto_deploy);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_and_unexpected() {
        let env = Envelope::from_text(r#"{"type":"mystery","payload":{}}"#).unwrap();
        assert!(matches!(
            Inbound::decode(&env),
            Err(ProtocolError::UnknownType(t)) if t == "mystery"
        ));

        let env = Envelope::from_text(r#"{"type":"heartbeat","payload":{}}"#).unwrap();
        assert!(matches!(
            Inbound::decode(&env),
            Err(ProtocolError::Unexpected(MessageType::Heartbeat))
        ));
    }

    #[test]
    fn test_decode_bad_payload() {
        let env = Envelope::from_text(r#"{"type":"task_stop","payload":{"nope":1}}"#).unwrap();
        assert!(matches!(
            Inbound::decode(&env),
            Err(ProtocolError::Payload { .. })
        ));
        assert!(Envelope::from_text("not json").is_err());
    }

    #[test]
    fn test_stream_event_wire_shape() {
        let event = StreamEvent::tool("Write", r#"{"file_path":"a.txt"}"#, "✏️ 写入 a.txt");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "tool",
                "text": "✏️ 写入 a.txt",
                "tool_name": "Write",
                "tool_input": "{\"file_path\":\"a.txt\"}"
            })
        );

        let result = StreamEvent::Result(RunMetrics {
            cost_usd: 0.5,
            tokens_in: 10,
            tokens_out: 20,
            duration_ms: 1200.0,
            num_turns: 3,
            done: true,
            ..Default::default()
        });
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["type"], "result");
        assert_eq!(value["done"], true);
        assert_eq!(value["num_turns"], 3);
        assert_eq!(value.get("text"), None);
    }

    #[test]
    fn test_task_complete_error_never_empty() {
        let complete = TaskComplete::failed("s", "");
        assert_eq!(complete.status, TaskStatus::Error);
        assert!(!complete.error.is_empty());

        let done = serde_json::to_value(TaskComplete::done("s")).unwrap();
        assert_eq!(done, json!({"session_id": "s", "status": "done"}));
    }

    #[test]
    fn test_dir_node_omits_empty_fields() {
        let node = DirNode {
            name: "src".to_string(),
            path: "proj/src".to_string(),
            is_dir: true,
            size: None,
            children: vec![],
        };
        assert_eq!(
            serde_json::to_value(&node).unwrap(),
            json!({"name": "src", "path": "proj/src", "is_dir": true})
        );
    }
}
