use serde::{Deserialize, Serialize};
use serde_json::Value;

use valet_core::types::ChatMessage;

/// Raw inbound frame — parse the `type` discriminator first, then extract
/// the typed body. Keeping the body loose lets the gateway tell "unknown
/// frame type" (error frame, connection stays open) apart from "malformed
/// JSON" (protocol error).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

/// `{"type":"identify","email":...}` — first frame on the session tier.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentifyFrame {
    pub email: String,
}

/// `{"type":"auth","email":...,"password":...}` — first frame on the auth tier.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthFrame {
    pub email: String,
    pub password: String,
}

/// `{"type":"message","payload":{"text":...}}` — one user turn.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageFrame {
    pub text: String,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn as_identify(&self) -> Option<IdentifyFrame> {
        if self.frame_type != "identify" {
            return None;
        }
        serde_json::from_value(Value::Object(self.rest.clone())).ok()
    }

    pub fn as_auth(&self) -> Option<AuthFrame> {
        if self.frame_type != "auth" {
            return None;
        }
        serde_json::from_value(Value::Object(self.rest.clone())).ok()
    }

    pub fn as_message(&self) -> Option<MessageFrame> {
        if self.frame_type != "message" {
            return None;
        }
        let payload = self.rest.get("payload")?;
        serde_json::from_value(payload.clone()).ok()
    }
}

/// Server → client frame. Wire shape: `{"type": <tag>, "payload": {...}}`,
/// except the auth-tier results which are flat (`auth_success` has no body,
/// `auth_fail` carries a top-level `reason`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    IdentifySuccess { payload: IdentifySuccessPayload },
    IdentifyFail { payload: FailPayload },
    AuthSuccess,
    AuthFail { reason: String },
    Text { payload: TextPayload },
    Status { payload: StatusPayload },
    ToolResult { payload: ToolResultPayload },
    RePromptContext { payload: RePromptPayload },
    Error { payload: ErrorPayload },
    End { payload: EmptyPayload },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifySuccessPayload {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPayload {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: String,
    pub tool: String,
    pub message: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool_name: String,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RePromptPayload {
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptyPayload {}

impl ServerFrame {
    pub fn identify_success(session_id: impl Into<String>) -> Self {
        Self::IdentifySuccess {
            payload: IdentifySuccessPayload {
                session_id: session_id.into(),
            },
        }
    }

    pub fn identify_fail(message: impl Into<String>) -> Self {
        Self::IdentifyFail {
            payload: FailPayload {
                message: message.into(),
            },
        }
    }

    pub fn auth_success() -> Self {
        Self::AuthSuccess
    }

    pub fn auth_fail(reason: impl Into<String>) -> Self {
        Self::AuthFail {
            reason: reason.into(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            payload: TextPayload {
                content: content.into(),
            },
        }
    }

    /// Tool intent observed in the model output — sent before execution.
    pub fn calling_tool(tool: impl Into<String>, arguments: Value) -> Self {
        let tool = tool.into();
        Self::Status {
            payload: StatusPayload {
                state: "calling_tool".to_string(),
                message: format!("Attempting to use tool: {tool}"),
                tool,
                arguments,
            },
        }
    }

    pub fn tool_result(tool_name: impl Into<String>, result: Value) -> Self {
        Self::ToolResult {
            payload: ToolResultPayload {
                tool_name: tool_name.into(),
                result,
            },
        }
    }

    pub fn re_prompt_context(message: ChatMessage) -> Self {
        Self::RePromptContext {
            payload: RePromptPayload { message },
        }
    }

    pub fn error(message: impl Into<String>, details: Option<Value>) -> Self {
        Self::Error {
            payload: ErrorPayload {
                message: message.into(),
                details,
            },
        }
    }

    pub fn end() -> Self {
        Self::End {
            payload: EmptyPayload {},
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The `identify` frame the auth tier synthesizes for the inner session
/// gateway once the client's credentials check out.
pub fn encode_identify(email: &str) -> String {
    serde_json::json!({ "type": "identify", "email": email }).to_string()
}
