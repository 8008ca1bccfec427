use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::codec::JsonCodec;

/// Codec for the workspace event protocol.
pub type WorkspaceCodec = JsonCodec<EventSubscription, WorkspaceEvent>;

/// Request sent once per session, right after the token frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventSubscription {
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<EventKind>,
}

impl EventSubscription {
    /// Subscribes to every event in a workspace.
    pub fn workspace(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            session_ids: Vec::new(),
            kinds: Vec::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_ids.push(session_id.into());
        self
    }

    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kinds.push(kind);
        self
    }
}

/// Event families a subscription can filter on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Session,
    Agent,
    Message,
    Tool,
    Terminal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Disconnected,
}

/// Inbound event decoded from each binary frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkspaceEvent {
    Connected {
        server_time_ms: u64,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    SessionUpdated {
        session_id: String,
        status: String,
        workspace_path: String,
    },
    AgentStatus {
        session_id: String,
        status: AgentStatus,
    },
    TextDelta {
        session_id: String,
        message_id: String,
        delta: String,
    },
    ToolStart {
        session_id: String,
        tool_call_id: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    ToolEnd {
        session_id: String,
        tool_call_id: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        is_error: bool,
    },
    TerminalOutput {
        session_id: String,
        terminal_id: String,
        data: String,
    },
}

impl WorkspaceEvent {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Session the event belongs to, if it is session-scoped.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Connected { .. } => None,
            Self::Error { session_id, .. } => session_id.as_deref(),
            Self::SessionUpdated { session_id, .. }
            | Self::AgentStatus { session_id, .. }
            | Self::TextDelta { session_id, .. }
            | Self::ToolStart { session_id, .. }
            | Self::ToolEnd { session_id, .. }
            | Self::TerminalOutput { session_id, .. } => Some(session_id),
        }
    }
}

impl EventSubscription {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::stream::codec::Codec;

    #[test]
    fn subscription_omits_empty_filters() {
        let encoded = EventSubscription::workspace("ws-1").to_bytes().expect("encode");
        assert_eq!(
            serde_json::from_slice::<Value>(&encoded).expect("json"),
            json!({"workspace_id": "ws-1"})
        );
    }

    #[test]
    fn subscription_filters_use_snake_case() {
        let request = EventSubscription::workspace("ws-1")
            .with_session("ses-9")
            .with_kind(EventKind::Terminal);
        let encoded = WorkspaceCodec::new().encode(&request).expect("encode");
        assert_eq!(
            serde_json::from_slice::<Value>(&encoded).expect("json"),
            json!({"workspace_id": "ws-1", "session_ids": ["ses-9"], "kinds": ["terminal"]})
        );
        assert_eq!(EventSubscription::from_bytes(&encoded).expect("decode"), request);
    }

    #[test]
    fn decodes_tagged_tool_end_event() {
        let bytes = br#"{"type":"tool_end","session_id":"s1","tool_call_id":"c1","tool_name":"bash","is_error":false}"#;
        let event = WorkspaceCodec::new().decode(bytes).expect("decode");
        assert_eq!(
            event,
            WorkspaceEvent::ToolEnd {
                session_id: "s1".to_string(),
                tool_call_id: "c1".to_string(),
                tool_name: "bash".to_string(),
                result: None,
                is_error: false,
            }
        );
        assert_eq!(event.session_id(), Some("s1"));
    }

    #[test]
    fn unknown_event_type_is_a_decode_error() {
        let bytes = br#"{"type":"not_a_real_event"}"#;
        assert!(WorkspaceCodec::new().decode(bytes).is_err());
    }

    #[test]
    fn agent_status_event_round_trips_through_bytes() {
        let event = WorkspaceEvent::AgentStatus {
            session_id: "s2".to_string(),
            status: AgentStatus::Busy,
        };
        let bytes = event.to_bytes().expect("encode");
        assert_eq!(WorkspaceEvent::from_bytes(&bytes).expect("decode"), event);
    }
}
