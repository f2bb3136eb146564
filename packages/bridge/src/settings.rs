//! Settings / permission-rule store.
//!
//! Read-mostly external collaborator: a JSON settings file with permission
//! rules, consulted by the pre-tool hook in front of the negotiator. The
//! bridge never writes this file — it only emits suggested rule updates
//! that the client persists.
//!
//! Rule syntax: `"ToolName"` matches every invocation of the tool;
//! `"ToolName(specifier)"` additionally matches the tool's salient input
//! field, with a trailing `*` doing prefix matching (`Bash(git:*)`,
//! `Read(/etc/*)`).

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use acp_bridge_error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDecision {
    Allow,
    Deny,
    Ask,
}

impl RuleDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Ask => "ask",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PermissionCheck {
    pub decision: RuleDecision,
    /// The raw rule string that matched, if any.
    pub rule: Option<String>,
}

#[derive(Debug, Clone)]
struct PermissionRule {
    raw: String,
    tool_name: String,
    specifier: Option<String>,
}

impl PermissionRule {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once('(') {
            Some((tool_name, rest)) => {
                let specifier = rest.strip_suffix(')')?;
                Some(Self {
                    raw: raw.to_string(),
                    tool_name: tool_name.to_string(),
                    specifier: Some(specifier.to_string()),
                })
            }
            None => Some(Self {
                raw: raw.to_string(),
                tool_name: raw.to_string(),
                specifier: None,
            }),
        }
    }

    fn matches(&self, tool_name: &str, input: &Value) -> bool {
        if self.tool_name != tool_name {
            return false;
        }
        let Some(specifier) = &self.specifier else {
            return true;
        };
        let Some(salient) = salient_input(tool_name, input) else {
            return false;
        };
        match specifier.strip_suffix('*') {
            Some(prefix) => salient.starts_with(prefix.trim_end_matches(':')),
            None => salient == *specifier,
        }
    }
}

/// The input field rules match against, per tool.
fn salient_input<'a>(tool_name: &str, input: &'a Value) -> Option<&'a str> {
    let key = match tool_name {
        "Bash" => "command",
        "WebFetch" => "url",
        "WebSearch" => "query",
        "Glob" | "Grep" => "pattern",
        _ => "file_path",
    };
    input
        .get(key)
        .and_then(Value::as_str)
        .or_else(|| input.get("path").and_then(Value::as_str))
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    permissions: PermissionsSection,
}

#[derive(Debug, Default, Deserialize)]
struct PermissionsSection {
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
    #[serde(default)]
    ask: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SettingsStore {
    allow: Vec<PermissionRule>,
    deny: Vec<PermissionRule>,
    ask: Vec<PermissionRule>,
}

impl SettingsStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load rules from a settings file. A missing file is an empty store;
    /// a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::empty());
            }
            Err(err) => {
                return Err(BridgeError::InvalidRequest {
                    message: format!("failed to read settings {}: {err}", path.display()),
                });
            }
        };
        let file: SettingsFile =
            serde_json::from_str(&raw).map_err(|err| BridgeError::InvalidRequest {
                message: format!("failed to parse settings {}: {err}", path.display()),
            })?;

        let parse = |rules: &[String]| -> Vec<PermissionRule> {
            rules
                .iter()
                .filter_map(|raw| PermissionRule::parse(raw))
                .collect()
        };
        Ok(Self {
            allow: parse(&file.permissions.allow),
            deny: parse(&file.permissions.deny),
            ask: parse(&file.permissions.ask),
        })
    }

    /// Pre-tool rule check. Deny rules win, ask rules override allow, and
    /// an unmatched invocation routes into the negotiator as `ask`.
    pub fn check_permission(&self, tool_name: &str, input: &Value) -> PermissionCheck {
        for (rules, decision) in [
            (&self.deny, RuleDecision::Deny),
            (&self.ask, RuleDecision::Ask),
            (&self.allow, RuleDecision::Allow),
        ] {
            if let Some(rule) = rules.iter().find(|rule| rule.matches(tool_name, input)) {
                return PermissionCheck {
                    decision,
                    rule: Some(rule.raw.clone()),
                };
            }
        }
        PermissionCheck {
            decision: RuleDecision::Ask,
            rule: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn store_from(settings: &Value) -> SettingsStore {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "{settings}").expect("write");
        SettingsStore::load(file.path()).expect("load")
    }

    #[test]
    fn missing_file_is_empty_store() {
        let store = SettingsStore::load(Path::new("/nonexistent/settings.json")).expect("load");
        let check = store.check_permission("Bash", &json!({"command": "ls"}));
        assert_eq!(check.decision, RuleDecision::Ask);
        assert!(check.rule.is_none());
    }

    #[test]
    fn prefix_rules_match_salient_field() {
        let store = store_from(&json!({
            "permissions": {
                "allow": ["Bash(git:*)", "Read"],
                "deny": ["WebFetch"],
            }
        }));

        let allowed = store.check_permission("Bash", &json!({"command": "git status"}));
        assert_eq!(allowed.decision, RuleDecision::Allow);
        assert_eq!(allowed.rule.as_deref(), Some("Bash(git:*)"));

        let unmatched = store.check_permission("Bash", &json!({"command": "rm -rf /"}));
        assert_eq!(unmatched.decision, RuleDecision::Ask);

        let read = store.check_permission("Read", &json!({"file_path": "/a.txt"}));
        assert_eq!(read.decision, RuleDecision::Allow);

        let denied = store.check_permission("WebFetch", &json!({"url": "https://x.test"}));
        assert_eq!(denied.decision, RuleDecision::Deny);
    }

    #[test]
    fn deny_and_ask_override_allow() {
        let store = store_from(&json!({
            "permissions": {
                "allow": ["Bash"],
                "ask": ["Bash(rm:*)"],
                "deny": ["Bash(sudo:*)"],
            }
        }));
        assert_eq!(
            store
                .check_permission("Bash", &json!({"command": "sudo ls"}))
                .decision,
            RuleDecision::Deny
        );
        assert_eq!(
            store
                .check_permission("Bash", &json!({"command": "rm file"}))
                .decision,
            RuleDecision::Ask
        );
        assert_eq!(
            store
                .check_permission("Bash", &json!({"command": "ls"}))
                .decision,
            RuleDecision::Allow
        );
    }

    #[test]
    fn exact_specifier_requires_equality() {
        let store = store_from(&json!({
            "permissions": {"allow": ["Bash(ls)"]}
        }));
        assert_eq!(
            store
                .check_permission("Bash", &json!({"command": "ls"}))
                .decision,
            RuleDecision::Allow
        );
        assert_eq!(
            store
                .check_permission("Bash", &json!({"command": "ls -la"}))
                .decision,
            RuleDecision::Ask
        );
    }
}
