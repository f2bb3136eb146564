//! File-backed session history store.
//!
//! One JSONL transcript per session under the state directory: a `meta`
//! line first, then one line per recorded entry. Opaque to the core —
//! sessions only append; the `_acpbridge` extension methods expose
//! list/read/delete.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use acp_bridge_error::BridgeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug)]
pub struct HistoryStore {
    root: PathBuf,
}

impl HistoryStore {
    pub fn new(root: PathBuf) -> Result<Self, BridgeError> {
        fs::create_dir_all(&root).map_err(|err| BridgeError::StreamError {
            message: format!("failed to create history dir {}: {err}", root.display()),
        })?;
        Ok(Self { root })
    }

    pub fn default_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("acp-bridge")
            .join("sessions")
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        // Session ids are opaque strings; keep the file name safe.
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.jsonl"))
    }

    pub fn create(&self, session_id: &str, cwd: &str, created_at: i64) -> Result<(), BridgeError> {
        let meta = json!({
            "type": "meta",
            "sessionId": session_id,
            "cwd": cwd,
            "createdAt": created_at,
        });
        self.append(session_id, &meta)
    }

    pub fn append(&self, session_id: &str, entry: &Value) -> Result<(), BridgeError> {
        let path = self.path_for(session_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| BridgeError::StreamError {
                message: format!("failed to open transcript {}: {err}", path.display()),
            })?;
        let line = serde_json::to_string(entry).map_err(|err| BridgeError::StreamError {
            message: format!("failed to serialize transcript entry: {err}"),
        })?;
        writeln!(file, "{line}").map_err(|err| BridgeError::StreamError {
            message: format!("failed to append transcript {}: {err}", path.display()),
        })
    }

    /// All transcript entries for one session, oldest first.
    pub fn read(&self, session_id: &str) -> Result<Vec<Value>, BridgeError> {
        let path = self.path_for(session_id);
        let raw = fs::read_to_string(&path).map_err(|_| BridgeError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Session summaries, most recently updated first.
    pub fn list(&self) -> Result<Vec<SessionSummary>, BridgeError> {
        let entries = fs::read_dir(&self.root).map_err(|err| BridgeError::StreamError {
            message: format!("failed to list history dir {}: {err}", self.root.display()),
        })?;

        let mut summaries = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            let mut lines = raw.lines().filter(|line| !line.trim().is_empty());
            let Some(meta) = lines.next().and_then(|line| serde_json::from_str::<Value>(line).ok())
            else {
                continue;
            };
            if meta.get("type").and_then(Value::as_str) != Some("meta") {
                continue;
            }
            let Some(session_id) = meta.get("sessionId").and_then(Value::as_str) else {
                continue;
            };
            let created_at = meta.get("createdAt").and_then(Value::as_i64).unwrap_or(0);
            let mut updated_at = created_at;
            let mut title = None;
            for line in lines {
                let Ok(entry) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                if let Some(at) = entry.get("at").and_then(Value::as_i64) {
                    updated_at = at;
                }
                if let Some(entry_title) = entry.get("title").and_then(Value::as_str) {
                    title = Some(entry_title.to_string());
                }
            }
            summaries.push(SessionSummary {
                session_id: session_id.to_string(),
                cwd: meta
                    .get("cwd")
                    .and_then(Value::as_str)
                    .unwrap_or("/")
                    .to_string(),
                title,
                created_at,
                updated_at,
            });
        }

        summaries.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        Ok(summaries)
    }

    pub fn delete(&self, session_id: &str) -> Result<(), BridgeError> {
        let path = self.path_for(session_id);
        fs::remove_file(&path).map_err(|_| BridgeError::SessionNotFound {
            session_id: session_id.to_string(),
        })
    }
}
