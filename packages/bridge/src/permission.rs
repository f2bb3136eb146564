//! Permission negotiation (`can_use_tool`).
//!
//! Per tool invocation, decides allow / deny / structured interaction in a
//! fixed priority order, owns the session trust-mode transitions, and races
//! every client round-trip against the caller's cancellation signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use acp_bridge_error::BridgeError;

use crate::acp::{
    PermissionMode, PermissionOption, PermissionOptionKind, PermissionRequest, PermissionUpdate,
    RequestPermissionOutcome, SessionNotification, SessionUpdate, ToolCallUpdate,
};
use crate::cancel::CancelSignal;
use crate::client::ClientSink;
use crate::protocol::PermissionResultWire;
use crate::session::{Session, SessionRegistry};
use crate::tool_calls::{effective_tool_name, is_edit_tool, tool_info_from_tool_use};

pub const OPTION_ALLOW_ALWAYS: &str = "allow_always";
pub const OPTION_ALLOW_ONCE: &str = "allow_once";
pub const OPTION_REJECT_ONCE: &str = "reject_once";

#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow {
        updated_input: Option<Value>,
        updated_permissions: Option<Vec<PermissionUpdate>>,
    },
    Deny {
        message: String,
        interrupt: bool,
    },
}

impl PermissionDecision {
    pub fn to_wire(&self) -> PermissionResultWire {
        match self {
            Self::Allow {
                updated_input,
                updated_permissions,
            } => PermissionResultWire::Allow {
                updated_input: updated_input.clone(),
                updated_permissions: updated_permissions
                    .as_ref()
                    .and_then(|updates| serde_json::to_value(updates).ok()),
            },
            Self::Deny { message, interrupt } => PermissionResultWire::Deny {
                message: message.clone(),
                interrupt: *interrupt,
            },
        }
    }
}

pub struct PermissionNegotiator {
    registry: Arc<SessionRegistry>,
    client: Arc<dyn ClientSink>,
    next_request_id: AtomicU64,
}

impl PermissionNegotiator {
    pub fn new(registry: Arc<SessionRegistry>, client: Arc<dyn ClientSink>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            client,
            next_request_id: AtomicU64::new(1),
        })
    }

    /// Decide whether the subprocess may run `tool_name` with `input`.
    ///
    /// `suggestions` are rule updates the subprocess proposed for future
    /// auto-approval; they ride along on remembered allows. Cancellation
    /// raises `Aborted` — it must unwind the tool-use attempt, not read as
    /// a denial.
    pub async fn can_use_tool(
        &self,
        session_id: &str,
        tool_name: &str,
        input: Value,
        suggestions: Option<Vec<PermissionUpdate>>,
        cancel: CancelSignal,
    ) -> Result<PermissionDecision, BridgeError> {
        let Some(session) = self.registry.get(session_id).await else {
            return Ok(PermissionDecision::Deny {
                message: format!("session not found: {session_id}"),
                interrupt: true,
            });
        };

        match effective_tool_name(tool_name) {
            "AskUserQuestion" => return self.ask_user_questions(&session, &input, &cancel).await,
            "ExitPlanMode" => {
                return self
                    .exit_plan_mode(&session, input, suggestions, &cancel)
                    .await;
            }
            _ => {}
        }

        let mode = session.mode();
        if mode == PermissionMode::BypassPermissions
            || (mode == PermissionMode::AcceptEdits && is_edit_tool(tool_name))
        {
            return Ok(PermissionDecision::Allow {
                updated_input: Some(input),
                updated_permissions: Some(suggestions.unwrap_or_else(|| {
                    vec![PermissionUpdate::always_allow_tool(tool_name)]
                })),
            });
        }

        self.ask_three_way(&session, tool_name, input, suggestions, &cancel)
            .await
    }

    /// Normal three-way prompt: allow-always / allow-once / reject.
    async fn ask_three_way(
        &self,
        session: &Arc<Session>,
        tool_name: &str,
        input: Value,
        suggestions: Option<Vec<PermissionUpdate>>,
        cancel: &CancelSignal,
    ) -> Result<PermissionDecision, BridgeError> {
        let info = tool_info_from_tool_use(tool_name, &input);
        let request = PermissionRequest {
            session_id: session.id.clone(),
            tool_call: ToolCallUpdate {
                tool_call_id: self.next_id("perm"),
                title: Some(info.title),
                kind: Some(info.kind),
                locations: if info.locations.is_empty() {
                    None
                } else {
                    Some(info.locations)
                },
                ..Default::default()
            },
            options: vec![
                PermissionOption::new(
                    OPTION_ALLOW_ALWAYS,
                    "Always allow",
                    PermissionOptionKind::AllowAlways,
                ),
                PermissionOption::new(OPTION_ALLOW_ONCE, "Allow", PermissionOptionKind::AllowOnce),
                PermissionOption::new(
                    OPTION_REJECT_ONCE,
                    "Reject",
                    PermissionOptionKind::RejectOnce,
                ),
            ],
        };

        match self.request_with_cancel(request, cancel).await?.as_str() {
            OPTION_ALLOW_ALWAYS => Ok(PermissionDecision::Allow {
                updated_input: Some(input),
                updated_permissions: Some(suggestions.unwrap_or_else(|| {
                    vec![PermissionUpdate::always_allow_tool(tool_name)]
                })),
            }),
            // A one-time grant must not be remembered: no suggestion.
            OPTION_ALLOW_ONCE => Ok(PermissionDecision::Allow {
                updated_input: Some(input),
                updated_permissions: None,
            }),
            _ => Ok(PermissionDecision::Deny {
                message: format!("User refused permission to run {tool_name}"),
                interrupt: true,
            }),
        }
    }

    /// Multi-question interactive prompt. Questions run sequentially; the
    /// answers come back as a single denial message the model reads and
    /// continues from, so the turn is not interrupted.
    async fn ask_user_questions(
        &self,
        session: &Arc<Session>,
        input: &Value,
        cancel: &CancelSignal,
    ) -> Result<PermissionDecision, BridgeError> {
        let questions = input
            .get("questions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut answers: Vec<String> = Vec::new();
        for (question_index, question) in questions.iter().enumerate() {
            let prompt = question
                .get("question")
                .and_then(Value::as_str)
                .unwrap_or("Question");
            let header = question
                .get("header")
                .and_then(Value::as_str)
                .unwrap_or(prompt);
            let option_labels: Vec<String> = question
                .get("options")
                .and_then(Value::as_array)
                .map(|options| {
                    options
                        .iter()
                        .filter_map(|option| {
                            option
                                .get("label")
                                .and_then(Value::as_str)
                                .map(ToOwned::to_owned)
                        })
                        .collect()
                })
                .unwrap_or_default();

            // Option ids encode (questionIndex, optionIndex) so the answer
            // can be recovered from the selection alone.
            let options: Vec<PermissionOption> = option_labels
                .iter()
                .enumerate()
                .map(|(option_index, label)| {
                    PermissionOption::new(
                        format!("q{question_index}_o{option_index}"),
                        label.clone(),
                        PermissionOptionKind::AllowOnce,
                    )
                })
                .collect();

            let request = PermissionRequest {
                session_id: session.id.clone(),
                tool_call: ToolCallUpdate {
                    tool_call_id: format!("{}_q{question_index}", self.next_id("quest")),
                    title: Some(prompt.to_string()),
                    ..Default::default()
                },
                options,
            };

            let option_id = self.request_with_cancel(request, cancel).await?;
            let answer = parse_question_option_id(&option_id)
                .filter(|(question, _)| *question == question_index)
                .and_then(|(_, option_index)| option_labels.get(option_index).cloned())
                .unwrap_or(option_id);
            answers.push(format!("{header}: {answer}"));
        }

        Ok(PermissionDecision::Deny {
            message: format!("User responses:\n{}", answers.join("\n")),
            interrupt: false,
        })
    }

    /// Plan-exit flow: always asks, regardless of the current mode.
    async fn exit_plan_mode(
        &self,
        session: &Arc<Session>,
        input: Value,
        suggestions: Option<Vec<PermissionUpdate>>,
        cancel: &CancelSignal,
    ) -> Result<PermissionDecision, BridgeError> {
        let request = PermissionRequest {
            session_id: session.id.clone(),
            tool_call: ToolCallUpdate {
                tool_call_id: self.next_id("perm"),
                title: Some("Exit plan mode".to_string()),
                kind: Some(crate::acp::ToolKind::SwitchMode),
                raw_output: input.get("plan").cloned(),
                ..Default::default()
            },
            options: vec![
                PermissionOption::new(
                    PermissionMode::AcceptEdits.as_str(),
                    "Yes, and auto-accept edits",
                    PermissionOptionKind::AllowAlways,
                ),
                PermissionOption::new(
                    PermissionMode::Default.as_str(),
                    "Yes, and manually approve edits",
                    PermissionOptionKind::AllowOnce,
                ),
                PermissionOption::new("reject", "No, keep planning", PermissionOptionKind::RejectOnce),
            ],
        };

        let option_id = self.request_with_cancel(request, cancel).await?;
        let Ok(mode) = option_id.parse::<PermissionMode>() else {
            return Ok(PermissionDecision::Deny {
                message: "User rejected the plan".to_string(),
                interrupt: true,
            });
        };
        session.set_mode(mode);
        session
            .queue
            .send(SessionNotification::new(
                session.id.clone(),
                SessionUpdate::CurrentModeUpdate {
                    current_mode_id: mode.as_str().to_string(),
                },
            ))
            .await;
        Ok(PermissionDecision::Allow {
            updated_input: None,
            updated_permissions: Some(
                suggestions.unwrap_or_else(|| vec![PermissionUpdate::set_mode(mode)]),
            ),
        })
    }

    /// Race the client round-trip against the cancellation signal and
    /// return the selected option id. The signal wins as soon as it fires,
    /// even if the response arrives moments later; an explicit `cancelled`
    /// outcome is treated identically.
    async fn request_with_cancel(
        &self,
        request: PermissionRequest,
        cancel: &CancelSignal,
    ) -> Result<String, BridgeError> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BridgeError::Aborted),
            outcome = self.client.request_permission(request) => outcome?,
        };
        match outcome {
            RequestPermissionOutcome::Selected { option_id } => Ok(option_id),
            RequestPermissionOutcome::Cancelled => Err(BridgeError::Aborted),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!(
            "{prefix}_{}",
            self.next_request_id.fetch_add(1, Ordering::SeqCst)
        )
    }
}

fn parse_question_option_id(option_id: &str) -> Option<(usize, usize)> {
    let rest = option_id.strip_prefix('q')?;
    let (question, option) = rest.split_once("_o")?;
    Some((question.parse().ok()?, option.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_option_ids_round_trip() {
        assert_eq!(parse_question_option_id("q0_o2"), Some((0, 2)));
        assert_eq!(parse_question_option_id("q12_o3"), Some((12, 3)));
        assert_eq!(parse_question_option_id("allow_once"), None);
        assert_eq!(parse_question_option_id("q_o1"), None);
    }

    #[test]
    fn allow_decision_serializes_typed_suggestions() {
        let decision = PermissionDecision::Allow {
            updated_input: None,
            updated_permissions: Some(vec![PermissionUpdate::always_allow_tool("Bash")]),
        };
        let wire = decision.to_wire().to_value();
        assert_eq!(wire["behavior"], "allow");
        assert_eq!(wire["updatedPermissions"][0]["type"], "addRules");
        assert_eq!(wire["updatedPermissions"][0]["rules"][0]["toolName"], "Bash");
    }
}
