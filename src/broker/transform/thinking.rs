//! Thinking-config resolution: merge what the host asked for with what the
//! model tier implies, then emit the dialect each family expects.

use serde_json::{json, Value};

use crate::broker::model::ResolvedModel;
use crate::models::ModelFamily;

const INTERLEAVED_HINT_MARKER: &str = "Interleaved thinking is enabled";

const INTERLEAVED_HINT: &str = "Interleaved thinking is enabled: you may think between tool \
calls and after receiving tool results, before producing the final answer.";

/// Claude thinking models refuse small completion windows; the budget plus
/// answer must fit.
const CLAUDE_MIN_OUTPUT_TOKENS: u64 = 64_000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThinkingSettings {
    pub include_thoughts: bool,
    pub budget: Option<u64>,
    pub level: Option<String>,
}

/// Read whatever thinking configuration the host supplied, from
/// `generationConfig.thinkingConfig` or `extra_body.thinking{,Config}`.
fn user_settings(request: &Value) -> ThinkingSettings {
    let mut settings = ThinkingSettings::default();

    let candidates = [
        request.pointer("/generationConfig/thinkingConfig"),
        request.pointer("/extra_body/thinkingConfig"),
        request.pointer("/extra_body/thinking"),
    ];
    for config in candidates.into_iter().flatten() {
        if let Some(include) = config
            .get("includeThoughts")
            .or_else(|| config.get("include_thoughts"))
            .and_then(|v| v.as_bool())
        {
            settings.include_thoughts = include;
        }
        // Anthropic-style {type: "enabled", budget_tokens: N}.
        if config.get("type").and_then(|v| v.as_str()) == Some("enabled") {
            settings.include_thoughts = true;
        }
        if let Some(budget) = config
            .get("thinkingBudget")
            .or_else(|| config.get("thinking_budget"))
            .or_else(|| config.get("budget_tokens"))
            .and_then(|v| v.as_u64())
        {
            settings.budget = Some(budget);
        }
        if let Some(level) = config
            .get("thinkingLevel")
            .or_else(|| config.get("thinking_level"))
            .and_then(|v| v.as_str())
        {
            settings.level = Some(level.to_string());
        }
    }
    settings
}

/// Combine host-supplied settings with the resolver's tier output. The tier
/// fills gaps; explicit host values win.
pub fn effective_settings(request: &Value, resolved: &ResolvedModel) -> ThinkingSettings {
    let mut settings = user_settings(request);
    if settings.budget.is_none() {
        settings.budget = resolved.thinking_budget.map(u64::from);
    }
    if settings.level.is_none() {
        settings.level = resolved.thinking_level.map(str::to_string);
    }
    if resolved.is_thinking_model && (settings.budget.is_some() || settings.level.is_some()) {
        settings.include_thoughts = true;
    }
    // includeThoughts without a positive budget is rejected upstream.
    if settings.include_thoughts && settings.level.is_none() {
        match settings.budget {
            Some(budget) if budget > 0 => {}
            _ => {
                tracing::debug!("[Thinking] dropping includeThoughts without a budget");
                settings.include_thoughts = false;
            }
        }
    }
    settings
}

/// Write the family-appropriate thinking configuration into the request.
/// Returns true when the Claude interleaved-thinking beta header is needed.
pub fn apply_thinking_config(
    request: &mut Value,
    resolved: &ResolvedModel,
    family: ModelFamily,
) -> bool {
    let settings = effective_settings(request, resolved);

    // The normalized config replaces whatever spelling the host used.
    let mut drop_extra_body = false;
    if let Some(extra) = request.get_mut("extra_body").and_then(|v| v.as_object_mut()) {
        extra.remove("thinking");
        extra.remove("thinkingConfig");
        drop_extra_body = extra.is_empty();
    }
    if drop_extra_body {
        if let Some(obj) = request.as_object_mut() {
            obj.remove("extra_body");
        }
    }

    if !settings.include_thoughts {
        if let Some(config) = request
            .pointer_mut("/generationConfig")
            .and_then(|v| v.as_object_mut())
        {
            config.remove("thinkingConfig");
        }
        return false;
    }

    if request.get("generationConfig").is_none() {
        request["generationConfig"] = json!({});
    }

    match family {
        ModelFamily::Claude => {
            let budget = settings.budget.unwrap_or(8192);
            request["generationConfig"]["thinkingConfig"] = json!({
                "include_thoughts": true,
                "thinking_budget": budget,
            });
            let current_max = request
                .pointer("/generationConfig/maxOutputTokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if current_max < CLAUDE_MIN_OUTPUT_TOKENS {
                request["generationConfig"]["maxOutputTokens"] = json!(CLAUDE_MIN_OUTPUT_TOKENS);
            }
            super::tools::append_system_text(request, INTERLEAVED_HINT, INTERLEAVED_HINT_MARKER);
            true
        }
        ModelFamily::Gemini => {
            if let Some(level) = &settings.level {
                request["generationConfig"]["thinkingConfig"] = json!({
                    "includeThoughts": true,
                    "thinkingLevel": level,
                });
            } else {
                request["generationConfig"]["thinkingConfig"] = json!({
                    "includeThoughts": true,
                    "thinkingBudget": settings.budget.unwrap_or(8192),
                });
            }
            false
        }
    }
}
