use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    MethodNotFound,
    SessionNotFound,
    SessionAlreadyExists,
    AgentProcessExited,
    StreamError,
    Aborted,
    Timeout,
}

impl ErrorType {
    /// JSON-RPC error code for this error class. Standard codes for the
    /// envelope-level failures, implementation-defined codes below -32000
    /// for the rest.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            Self::InvalidRequest => -32602,
            Self::MethodNotFound => -32601,
            Self::SessionNotFound => -32001,
            Self::SessionAlreadyExists => -32002,
            Self::AgentProcessExited => -32003,
            Self::StreamError => -32004,
            Self::Aborted => -32800,
            Self::Timeout => -32005,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("method not found: {method}")]
    MethodNotFound { method: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("session already exists: {session_id}")]
    SessionAlreadyExists { session_id: String },
    #[error("agent process exited")]
    AgentProcessExited {
        exit_code: Option<i32>,
        message: Option<String>,
    },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("aborted")]
    Aborted,
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl BridgeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::MethodNotFound { .. } => ErrorType::MethodNotFound,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::SessionAlreadyExists { .. } => ErrorType::SessionAlreadyExists,
            Self::AgentProcessExited { .. } => ErrorType::AgentProcessExited,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Aborted => ErrorType::Aborted,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    /// JSON-RPC error object for a response envelope.
    pub fn to_json_rpc_error(&self) -> Value {
        let mut data = serde_json::Map::new();
        match self {
            Self::SessionNotFound { session_id } | Self::SessionAlreadyExists { session_id } => {
                data.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::AgentProcessExited { exit_code, message } => {
                if let Some(code) = exit_code {
                    data.insert("exitCode".to_string(), Value::from(*code));
                }
                if let Some(message) = message {
                    data.insert("detail".to_string(), Value::String(message.clone()));
                }
            }
            _ => {}
        }

        let mut error = json!({
            "code": self.error_type().json_rpc_code(),
            "message": self.to_string(),
        });
        if !data.is_empty() {
            error["data"] = Value::Object(data);
        }
        error
    }
}
