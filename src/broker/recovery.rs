//! Host-error recovery: watch session-error events the host surfaces, repair
//! the stored message parts, and optionally auto-resume the turn.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::models::BrokerConfig;

/// The three recoverable corruption classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    /// Host aborted mid-tool: `tool_use` without its `tool_result`.
    ToolInterrupted,
    /// Thinking-block ordering rejected by the upstream.
    ThinkingOrder,
    /// Thinking blocks sent to a non-thinking model.
    ThinkingDisabled,
}

pub fn classify_session_error(message: &str) -> Option<RecoveryKind> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("tool_use") && lower.contains("tool_result") {
        return Some(RecoveryKind::ToolInterrupted);
    }
    if lower.contains("thinking is disabled") && lower.contains("cannot contain") {
        return Some(RecoveryKind::ThinkingDisabled);
    }
    if lower.contains("thinking")
        && (lower.contains("first block")
            || lower.contains("must start with")
            || lower.contains("preceeding")
            || (lower.contains("expected") && lower.contains("found")))
    {
        return Some(RecoveryKind::ThinkingOrder);
    }
    None
}

#[derive(Debug, Clone)]
pub struct SessionErrorEvent {
    pub session_id: String,
    pub message_id: String,
    pub error_message: String,
    pub agent: Option<String>,
    pub model: Option<String>,
}

/// The host-side surface the hook drives. Kept narrow so tests can fake it.
#[async_trait]
pub trait HostBridge: Send + Sync {
    async fn abort_session(&self, session_id: &str) -> Result<(), String>;
    /// The failed message's content blocks as the host stores them.
    async fn fetch_message_parts(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Vec<Value>, String>;
    /// On-disk fallback when the live fetch comes back empty.
    async fn read_parts_fallback(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Vec<Value>, String>;
    async fn write_message_parts(
        &self,
        session_id: &str,
        message_id: &str,
        parts: Vec<Value>,
    ) -> Result<(), String>;
    async fn re_prompt(
        &self,
        session_id: &str,
        agent: Option<&str>,
        model: Option<&str>,
        text: &str,
    ) -> Result<(), String>;
    fn toast(&self, message: &str);
}

pub struct RecoveryHook {
    config: BrokerConfig,
    host: Arc<dyn HostBridge>,
}

impl RecoveryHook {
    pub fn new(config: BrokerConfig, host: Arc<dyn HostBridge>) -> Self {
        Self { config, host }
    }

    /// React to one host error event. Returns true when a repair was applied.
    /// Recovery toasts are emitted even in quiet mode.
    pub async fn handle_session_error(&self, event: &SessionErrorEvent) -> bool {
        if !self.config.session_recovery {
            return false;
        }
        let Some(kind) = classify_session_error(&event.error_message) else {
            return false;
        };
        tracing::info!(
            "[Recovery] session {} hit {:?}, repairing",
            event.session_id,
            kind
        );

        if let Err(e) = self.host.abort_session(&event.session_id).await {
            tracing::warn!("[Recovery] abort failed: {}", e);
        }

        let parts = match self
            .host
            .fetch_message_parts(&event.session_id, &event.message_id)
            .await
        {
            Ok(parts) if !parts.is_empty() => parts,
            Ok(_) => match self
                .host
                .read_parts_fallback(&event.session_id, &event.message_id)
                .await
            {
                Ok(parts) => parts,
                Err(e) => {
                    self.surrender(&event.session_id, &e);
                    return false;
                }
            },
            Err(e) => {
                self.surrender(&event.session_id, &e);
                return false;
            }
        };

        let repaired = repair_parts(kind, parts);
        if let Err(e) = self
            .host
            .write_message_parts(&event.session_id, &event.message_id, repaired)
            .await
        {
            self.surrender(&event.session_id, &e);
            return false;
        }

        if self.config.auto_resume {
            let result = self
                .host
                .re_prompt(
                    &event.session_id,
                    event.agent.as_deref(),
                    event.model.as_deref(),
                    &self.config.resume_text,
                )
                .await;
            if let Err(e) = result {
                self.surrender(&event.session_id, &e);
                return false;
            }
        }

        self.host.toast("Session recovered after an interrupted turn");
        true
    }

    fn surrender(&self, session_id: &str, error: &str) {
        tracing::warn!("[Recovery] giving up on session {}: {}", session_id, error);
        self.host
            .toast("Session recovery failed; please retry the last message");
    }
}

/// Apply the kind-specific repair to a message's content blocks.
fn repair_parts(kind: RecoveryKind, mut parts: Vec<Value>) -> Vec<Value> {
    match kind {
        RecoveryKind::ToolInterrupted => {
            let result_ids: std::collections::HashSet<String> = parts
                .iter()
                .filter(|p| p.get("type").and_then(|v| v.as_str()) == Some("tool_result"))
                .filter_map(|p| p.get("tool_use_id").and_then(|v| v.as_str()))
                .map(str::to_string)
                .collect();
            let orphan_ids: Vec<String> = parts
                .iter()
                .filter(|p| p.get("type").and_then(|v| v.as_str()) == Some("tool_use"))
                .filter_map(|p| p.get("id").and_then(|v| v.as_str()))
                .filter(|id| !result_ids.contains(*id))
                .map(str::to_string)
                .collect();
            for id in orphan_ids {
                parts.push(json!({
                    "type": "tool_result",
                    "tool_use_id": id,
                    "content": "Operation cancelled or missing",
                }));
            }
            parts
        }
        RecoveryKind::ThinkingOrder => {
            let starts_with_thinking = parts
                .first()
                .map(|p| p.get("type").and_then(|v| v.as_str()) == Some("thinking"))
                .unwrap_or(false);
            if !starts_with_thinking {
                parts.insert(
                    0,
                    json!({
                        "type": "thinking",
                        "thinking": "Recovering an interrupted turn.",
                    }),
                );
            }
            parts
        }
        RecoveryKind::ThinkingDisabled => parts
            .into_iter()
            .filter(|p| {
                !matches!(
                    p.get("type").and_then(|v| v.as_str()),
                    Some("thinking") | Some("redacted_thinking") | Some("reasoning")
                )
            })
            .collect(),
    }
}
