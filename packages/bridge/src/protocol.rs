//! Wire model for the agent subprocess's line-delimited message protocol.
//!
//! Every stdout line is one JSON message with a `type` discriminator.
//! Stream traffic (`system` / `assistant` / `user` / `result` /
//! `stream_event`) flows into the session message router; control traffic
//! (`control_request` / `control_response` / `control_cancel_request`) is
//! handled at the process layer and never reaches the router.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const MESSAGE_TYPE_SYSTEM: &str = "system";
pub const MESSAGE_TYPE_ASSISTANT: &str = "assistant";
pub const MESSAGE_TYPE_USER: &str = "user";
pub const MESSAGE_TYPE_RESULT: &str = "result";
pub const MESSAGE_TYPE_STREAM_EVENT: &str = "stream_event";
pub const MESSAGE_TYPE_CONTROL_REQUEST: &str = "control_request";
pub const MESSAGE_TYPE_CONTROL_RESPONSE: &str = "control_response";
pub const MESSAGE_TYPE_CONTROL_CANCEL: &str = "control_cancel_request";

pub const SYSTEM_SUBTYPE_TASK_NOTIFICATION: &str = "task_notification";

pub fn message_type(message: &Value) -> Option<&str> {
    message.get("type").and_then(Value::as_str)
}

pub fn message_subtype(message: &Value) -> Option<&str> {
    message.get("subtype").and_then(Value::as_str)
}

/// The "system, subtype = task notification" shape is the only out-of-band
/// message class: it must be acted on even when no turn is in progress.
pub fn is_task_notification(message: &Value) -> bool {
    message_type(message) == Some(MESSAGE_TYPE_SYSTEM)
        && message_subtype(message) == Some(SYSTEM_SUBTYPE_TASK_NOTIFICATION)
}

/// Content blocks of `assistant` / `user` messages, as an ordered list of
/// raw values. Payload shapes are not statically guaranteed, so blocks stay
/// `Value` and are interpreted per block type at the use site.
pub fn message_content_blocks(message: &Value) -> Vec<Value> {
    message
        .get("message")
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

pub fn block_type(block: &Value) -> Option<&str> {
    block.get("type").and_then(Value::as_str)
}

/// A `tool_use` content block: the subprocess asking to run (or reporting
/// that the model invoked) a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

impl ToolUseBlock {
    pub fn from_value(block: &Value) -> Option<Self> {
        if !matches!(
            block_type(block),
            Some("tool_use") | Some("server_tool_use") | Some("mcp_tool_use")
        ) {
            return None;
        }
        Some(Self {
            id: block.get("id").and_then(Value::as_str)?.to_string(),
            name: block.get("name").and_then(Value::as_str)?.to_string(),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        })
    }
}

/// A `tool_result` content block. `content` may be a plain string or an
/// array of result content variants; both shapes occur on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub is_error: Option<bool>,
}

impl ToolResultBlock {
    pub fn from_value(block: &Value) -> Option<Self> {
        let block_type = block_type(block)?;
        if block_type != "tool_result" && !block_type.ends_with("_tool_result") {
            return None;
        }
        Some(Self {
            tool_use_id: block
                .get("tool_use_id")
                .and_then(Value::as_str)?
                .to_string(),
            content: block.get("content").cloned(),
            is_error: block.get("is_error").and_then(Value::as_bool),
        })
    }

    /// Flattened text of the result content, for tools whose output is
    /// consumed as a single string.
    pub fn content_text(&self) -> String {
        match &self.content {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Control traffic
// ---------------------------------------------------------------------------

/// Control requests the bridge sends to the subprocess.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum OutboundControlRequest {
    Initialize {
        #[serde(skip_serializing_if = "Option::is_none")]
        hooks: Option<Value>,
    },
    Interrupt,
    SetPermissionMode {
        mode: String,
    },
}

pub fn control_request_envelope(request_id: &str, request: &OutboundControlRequest) -> Value {
    json!({
        "type": MESSAGE_TYPE_CONTROL_REQUEST,
        "request_id": request_id,
        "request": request,
    })
}

/// Control requests the subprocess sends to the bridge.
#[derive(Debug, Clone)]
pub enum InboundControlRequest {
    CanUseTool(CanUseToolRequest),
    HookCallback(HookCallbackRequest),
    Unknown { subtype: String },
}

#[derive(Debug, Clone)]
pub struct CanUseToolRequest {
    pub tool_name: String,
    pub input: Value,
    /// Rule suggestions the subprocess proposes for future auto-approval.
    pub permission_suggestions: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct HookCallbackRequest {
    pub callback_id: String,
    pub input: Value,
}

impl InboundControlRequest {
    pub fn from_value(request: &Value) -> Option<Self> {
        let subtype = request.get("subtype").and_then(Value::as_str)?;
        match subtype {
            "can_use_tool" => Some(Self::CanUseTool(CanUseToolRequest {
                tool_name: request
                    .get("tool_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: request.get("input").cloned().unwrap_or(Value::Null),
                permission_suggestions: request.get("permission_suggestions").cloned(),
            })),
            "hook_callback" => Some(Self::HookCallback(HookCallbackRequest {
                callback_id: request
                    .get("callback_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: request.get("input").cloned().unwrap_or(Value::Null),
            })),
            other => Some(Self::Unknown {
                subtype: other.to_string(),
            }),
        }
    }
}

pub fn control_request_id(message: &Value) -> Option<&str> {
    message.get("request_id").and_then(Value::as_str)
}

pub fn control_request_payload(message: &Value) -> Option<&Value> {
    message.get("request")
}

/// `control_response` correlation id, present for both success and error
/// responses.
pub fn control_response_id(message: &Value) -> Option<&str> {
    message
        .get("response")
        .and_then(|response| response.get("request_id"))
        .and_then(Value::as_str)
}

pub fn control_success_envelope(request_id: &str, response: Value) -> Value {
    json!({
        "type": MESSAGE_TYPE_CONTROL_RESPONSE,
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        }
    })
}

pub fn control_error_envelope(request_id: &str, error: &str) -> Value {
    json!({
        "type": MESSAGE_TYPE_CONTROL_RESPONSE,
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": error,
        }
    })
}

/// Permission decision as the subprocess consumes it in a `can_use_tool`
/// control response.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionResultWire {
    Allow {
        updated_input: Option<Value>,
        updated_permissions: Option<Value>,
    },
    Deny {
        message: String,
        interrupt: bool,
    },
}

impl PermissionResultWire {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Allow {
                updated_input,
                updated_permissions,
            } => {
                let mut obj = Map::new();
                obj.insert("behavior".to_string(), Value::String("allow".to_string()));
                if let Some(input) = updated_input {
                    obj.insert("updatedInput".to_string(), input.clone());
                }
                if let Some(permissions) = updated_permissions {
                    obj.insert("updatedPermissions".to_string(), permissions.clone());
                }
                Value::Object(obj)
            }
            Self::Deny { message, interrupt } => json!({
                "behavior": "deny",
                "message": message,
                "interrupt": interrupt,
            }),
        }
    }
}

/// Prompt turn input as a `user` message on the subprocess stdin.
pub fn user_prompt_message(session_id: &str, content: Vec<Value>) -> Value {
    json!({
        "type": MESSAGE_TYPE_USER,
        "session_id": session_id,
        "message": {
            "role": "user",
            "content": content,
        }
    })
}
