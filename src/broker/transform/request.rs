//! Request preparation: URL rewrite, project wrapping, tool and thinking
//! normalization, conversation repair and outbound headers.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};

use crate::broker::endpoints;
use crate::broker::headers::{append_header_value, build_outbound_headers};
use crate::broker::model::{resolve_model, ResolvedModel};
use crate::broker::session::SessionKeyBuilder;
use crate::broker::signature_cache::SignatureCache;
use crate::broker::transform::{repair, thinking, tools};
use crate::constants::INTERLEAVED_THINKING_BETA;
use crate::error::{BrokerError, BrokerResult};
use crate::models::{BrokerConfig, HeaderStyle, ModelFamily};

pub const TOOL_MISSING_HEADER: &str = "x-antigravity-tool-missing";

const WRAPPER_USER_AGENT: &str = "antigravity";

pub struct RequestContext<'a> {
    pub config: &'a BrokerConfig,
    pub cache: &'a SignatureCache,
    pub session_keys: &'a SessionKeyBuilder,
    pub access_token: &'a str,
    pub project: &'a str,
    pub endpoint: &'a str,
    pub style: HeaderStyle,
    /// Set by the dispatcher after a `thinking_block_order` rejection.
    pub force_thinking_recovery: bool,
}

#[derive(Debug)]
pub struct PreparedRequest {
    pub url: String,
    pub body: Value,
    pub headers: HeaderMap,
    pub session_key: String,
    pub resolved: ResolvedModel,
    pub family: ModelFamily,
    pub action: String,
    pub streaming: bool,
    /// A warmup round trip must elicit a thinking signature before this
    /// request can be sent.
    pub needs_signed_thinking_warmup: bool,
    pub tool_debug_missing: u32,
}

/// A body is already in the upstream's project-wrapped shape when it carries
/// a string `project` and a `request` object.
fn is_wrapped(body: &Value) -> bool {
    body.get("project").and_then(|v| v.as_str()).is_some()
        && body.get("request").map(Value::is_object).unwrap_or(false)
}

pub fn prepare_request(ctx: &RequestContext<'_>, url: &str, body: Value) -> BrokerResult<PreparedRequest> {
    let (model, action) = endpoints::parse_model_action(url).ok_or_else(|| {
        BrokerError::Transform(format!("not a generative model url: {}", url))
    })?;
    let streaming = action == "streamGenerateContent";
    let target = endpoints::v1internal(ctx.endpoint, &action, streaming);

    let resolved = resolve_model(&model);
    let family = ModelFamily::of_model(&model);

    if is_wrapped(&body) {
        return prepare_wrapped_passthrough(ctx, target, body, resolved, family, action, streaming);
    }

    let session_key = ctx
        .session_keys
        .build(&resolved.actual_model, ctx.project, &body);

    // Transform the inner request first, wrap it last.
    let mut inner = body;
    let request = &mut inner;

    // Tool definitions first; the hardening and pairing passes below rely on
    // the normalized shape.
    let tool_debug_missing = match family {
        ModelFamily::Claude => tools::normalize_claude_tools(request),
        ModelFamily::Gemini => tools::normalize_gemini_tools(request),
    };
    if family == ModelFamily::Claude
        && ctx.config.claude_tool_hardening
        && request.get("tools").is_some()
    {
        tools::harden_claude_tools(request);
    }

    let wants_beta = thinking::apply_thinking_config(request, &resolved, family);

    lift_cached_content(request);
    rename_system_instruction(request);

    let keep_thinking = ctx.config.keep_thinking;
    if family == ModelFamily::Claude && keep_thinking {
        repair::backfill_signatures(request, &session_key, ctx.cache);
    }

    if ctx.config.tool_id_recovery {
        repair::pair_function_call_ids(request, true);
        repair::pair_claude_tool_blocks(request, true);
    } else {
        repair::pair_function_call_ids(request, false);
        repair::pair_claude_tool_blocks(request, false);
    }

    let mut needs_warmup = false;
    if family == ModelFamily::Claude && resolved.is_thinking_model {
        let needs_restart =
            ctx.force_thinking_recovery || (keep_thinking && repair::needs_thinking_recovery(request));
        if needs_restart {
            repair::apply_crash_restart(
                request,
                &session_key,
                ctx.cache,
                &ctx.config.resume_text,
            );
        }
        if keep_thinking {
            needs_warmup =
                repair::needs_signed_thinking_warmup(request, &session_key, ctx.cache);
        }
    }

    request["sessionId"] = json!(session_key);

    let wrapped = json!({
        "project": ctx.project,
        "model": resolved.actual_model,
        "userAgent": WRAPPER_USER_AGENT,
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        "request": inner,
    });

    let mut headers = build_outbound_headers(ctx.access_token, ctx.style, streaming);
    if wants_beta {
        append_header_value(&mut headers, "anthropic-beta", INTERLEAVED_THINKING_BETA);
    }
    if tool_debug_missing > 0 {
        if let Ok(value) = HeaderValue::from_str(&tool_debug_missing.to_string()) {
            headers.insert(HeaderName::from_static(TOOL_MISSING_HEADER), value);
        }
    }

    Ok(PreparedRequest {
        url: target,
        body: wrapped,
        headers,
        session_key,
        resolved,
        family,
        action,
        streaming,
        needs_signed_thinking_warmup: needs_warmup,
        tool_debug_missing,
    })
}

/// An already-wrapped body passes through untouched apart from the model and
/// session id, so preparation is idempotent.
fn prepare_wrapped_passthrough(
    ctx: &RequestContext<'_>,
    target: String,
    mut body: Value,
    resolved: ResolvedModel,
    family: ModelFamily,
    action: String,
    streaming: bool,
) -> BrokerResult<PreparedRequest> {
    body["model"] = json!(resolved.actual_model);
    let project = body
        .get("project")
        .and_then(|v| v.as_str())
        .unwrap_or(ctx.project)
        .to_string();
    // Keep a session id assigned by an earlier preparation; rebuilding it
    // from the transformed body would break idempotence.
    let existing_session = body
        .pointer("/request/sessionId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let session_key = existing_session.unwrap_or_else(|| {
        let request = body.get("request").cloned().unwrap_or(json!({}));
        ctx.session_keys
            .build(&resolved.actual_model, &project, &request)
    });
    if let Some(request) = body.get_mut("request") {
        request["sessionId"] = json!(session_key);
    }

    let wants_beta = family == ModelFamily::Claude && resolved.is_thinking_model;
    let mut headers = build_outbound_headers(ctx.access_token, ctx.style, streaming);
    if wants_beta {
        append_header_value(&mut headers, "anthropic-beta", INTERLEAVED_THINKING_BETA);
    }

    Ok(PreparedRequest {
        url: target,
        body,
        headers,
        session_key,
        resolved,
        family,
        action,
        streaming,
        needs_signed_thinking_warmup: false,
        tool_debug_missing: 0,
    })
}

/// `cached_content`/`cachedContent` may arrive at the top level or inside
/// `extra_body`; the upstream wants it at `request.cachedContent`.
fn lift_cached_content(request: &mut Value) {
    let mut found: Option<Value> = None;
    for key in ["cached_content", "cachedContent"] {
        if let Some(obj) = request.as_object_mut() {
            if let Some(value) = obj.remove(key) {
                found.get_or_insert(value);
            }
        }
    }
    if let Some(extra) = request.get_mut("extra_body").and_then(|v| v.as_object_mut()) {
        for key in ["cached_content", "cachedContent"] {
            if let Some(value) = extra.remove(key) {
                found.get_or_insert(value);
            }
        }
    }
    if let Some(value) = found {
        request["cachedContent"] = value;
    }
}

fn rename_system_instruction(request: &mut Value) {
    if let Some(obj) = request.as_object_mut() {
        if let Some(value) = obj.remove("system_instruction") {
            obj.entry("systemInstruction".to_string()).or_insert(value);
        }
    }
}

/// The minimal tool-less, thinking-enabled body used to elicit a signature
/// before a tool-carrying request (see the dispatcher's warmup step).
pub fn build_warmup_body(project: &str, actual_model: &str, session_key: &str) -> Value {
    json!({
        "project": project,
        "model": actual_model,
        "userAgent": WRAPPER_USER_AGENT,
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        "request": {
            "contents": [
                {"role": "user", "parts": [{"text": "Reply with the single word: ready"}]}
            ],
            "generationConfig": {
                "thinkingConfig": {"include_thoughts": true, "thinking_budget": 1024},
                "maxOutputTokens": 64000
            },
            "sessionId": session_key,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignatureCacheConfig;

    fn cache(tag: &str) -> SignatureCache {
        let dir = std::env::temp_dir().join(format!(
            ".antigravity-request-{}-{}",
            std::process::id(),
            tag
        ));
        let _ = std::fs::create_dir_all(&dir);
        let _ = std::fs::remove_file(dir.join(crate::constants::SIGNATURE_CACHE_FILE));
        SignatureCache::new(SignatureCacheConfig::default(), dir)
    }

    fn context<'a>(
        config: &'a BrokerConfig,
        cache: &'a SignatureCache,
        keys: &'a SessionKeyBuilder,
    ) -> RequestContext<'a> {
        RequestContext {
            config,
            cache,
            session_keys: keys,
            access_token: "at-1",
            project: "proj-1",
            endpoint: "https://daily-cloudcode-pa.sandbox.googleapis.com",
            style: HeaderStyle::Antigravity,
            force_thinking_recovery: false,
        }
    }

    const STREAM_URL: &str =
        "https://generativelanguage.googleapis.com/v1beta/models/gemini-3-pro-high:streamGenerateContent";

    #[test]
    fn wraps_body_and_rewrites_url() {
        let config = BrokerConfig::default();
        let cache = cache("wrap");
        let keys = SessionKeyBuilder::with_uuid("u1");
        let ctx = context(&config, &cache, &keys);

        let body = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});
        let prepared = prepare_request(&ctx, STREAM_URL, body).expect("prepare");

        assert_eq!(
            prepared.url,
            "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
        assert!(prepared.streaming);
        assert_eq!(prepared.body["project"], json!("proj-1"));
        assert_eq!(prepared.body["model"], json!("gemini-3-pro"));
        assert!(prepared.body["requestId"]
            .as_str()
            .unwrap()
            .starts_with("agent-"));
        // Tier became a thinking level inside the wrapped request.
        assert_eq!(
            prepared.body["request"]["generationConfig"]["thinkingConfig"],
            json!({"includeThoughts": true, "thinkingLevel": "high"})
        );
        assert_eq!(
            prepared.body["request"]["sessionId"].as_str().unwrap(),
            prepared.session_key
        );
        assert_eq!(
            prepared
                .headers
                .get(reqwest::header::ACCEPT)
                .and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );
    }

    #[test]
    fn claude_thinking_sets_beta_header_and_budget() {
        let config = BrokerConfig::default();
        let cache = cache("beta");
        let keys = SessionKeyBuilder::with_uuid("u1");
        let ctx = context(&config, &cache, &keys);

        let url = "https://generativelanguage.googleapis.com/v1beta/models/claude-sonnet-4-5-thinking-medium:generateContent";
        let body = json!({"contents": []});
        let prepared = prepare_request(&ctx, url, body).expect("prepare");

        assert_eq!(prepared.body["model"], json!("claude-sonnet-4-5-thinking"));
        let config_out = &prepared.body["request"]["generationConfig"];
        assert_eq!(config_out["thinkingConfig"]["thinking_budget"], json!(16384));
        assert_eq!(config_out["thinkingConfig"]["include_thoughts"], json!(true));
        assert_eq!(config_out["maxOutputTokens"], json!(64000));
        let beta = prepared
            .headers
            .get("anthropic-beta")
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert!(beta.contains(INTERLEAVED_THINKING_BETA));
    }

    #[test]
    fn preparation_is_idempotent_for_wrapped_bodies() {
        let config = BrokerConfig::default();
        let cache = cache("idem");
        let keys = SessionKeyBuilder::with_uuid("u1");
        let ctx = context(&config, &cache, &keys);

        let url = "https://generativelanguage.googleapis.com/v1beta/models/claude-sonnet-4-5-thinking-low:generateContent";
        let body = json!({
            "tools": [{"name": "run", "input_schema": {"type": "object", "properties": {"cmd": {"type": "string"}}}}],
            "system_instruction": {"parts": [{"text": "base prompt"}]},
            "contents": [{"role": "user", "parts": [{"text": "hello"}]}]
        });
        let once = prepare_request(&ctx, url, body).expect("first prepare");
        let twice = prepare_request(&ctx, url, once.body.clone()).expect("second prepare");

        assert_eq!(once.body, twice.body);
        // No duplicated hardening paragraph or interleaved hint.
        let text = twice.body.to_string();
        assert_eq!(text.matches("STRICT PARAMETERS:").count(), 1);
        assert_eq!(text.matches("Interleaved thinking is enabled").count(), 1);
    }

    #[test]
    fn cached_content_is_lifted_and_system_instruction_renamed() {
        let config = BrokerConfig::default();
        let cache = cache("lift");
        let keys = SessionKeyBuilder::with_uuid("u1");
        let ctx = context(&config, &cache, &keys);

        let url = "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:generateContent";
        let body = json!({
            "system_instruction": {"parts": [{"text": "sys"}]},
            "extra_body": {"cached_content": "caches/abc123"},
            "contents": []
        });
        let prepared = prepare_request(&ctx, url, body).expect("prepare");
        let request = &prepared.body["request"];
        assert_eq!(request["cachedContent"], json!("caches/abc123"));
        assert!(request.get("system_instruction").is_none());
        assert_eq!(request["systemInstruction"]["parts"][0]["text"], json!("sys"));
        assert!(request.get("extra_body").is_none());
    }

    #[test]
    fn missing_tools_surface_in_debug_header() {
        let config = BrokerConfig::default();
        let cache = cache("missing");
        let keys = SessionKeyBuilder::with_uuid("u1");
        let ctx = context(&config, &cache, &keys);

        let url = "https://generativelanguage.googleapis.com/v1beta/models/claude-sonnet-4-5:generateContent";
        let body = json!({"tools": [{"description": "nameless"}], "contents": []});
        let prepared = prepare_request(&ctx, url, body).expect("prepare");
        assert_eq!(prepared.tool_debug_missing, 1);
        assert_eq!(
            prepared
                .headers
                .get(TOOL_MISSING_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("1")
        );
    }

    #[test]
    fn forced_recovery_rewrites_the_conversation() {
        let mut config = BrokerConfig::default();
        config.keep_thinking = true;
        let cache = cache("force");
        let keys = SessionKeyBuilder::with_uuid("u1");
        let mut ctx = context(&config, &cache, &keys);
        ctx.force_thinking_recovery = true;

        let url = "https://generativelanguage.googleapis.com/v1beta/models/claude-sonnet-4-5-thinking:generateContent";
        let body = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "task"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "run", "args": {}, "id": "c1"}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "run", "response": {}, "id": "c1"}}]}
            ]
        });
        let prepared = prepare_request(&ctx, url, body).expect("prepare");
        let contents = prepared.body["request"]["contents"].as_array().unwrap();
        // Closing assistant message plus fresh user turn were appended.
        assert_eq!(contents.last().unwrap()["role"], json!("user"));
        assert_eq!(
            contents.last().unwrap()["parts"][0]["text"],
            json!("continue")
        );
        assert!(!prepared.body.to_string().contains("\"thought\":true"));
    }

    #[test]
    fn non_generative_urls_are_rejected() {
        let config = BrokerConfig::default();
        let cache = cache("reject");
        let keys = SessionKeyBuilder::with_uuid("u1");
        let ctx = context(&config, &cache, &keys);
        let err = prepare_request(&ctx, "https://example.com/api/other", json!({})).unwrap_err();
        assert!(matches!(err, BrokerError::Transform(_)));
    }

    #[test]
    fn warmup_body_is_toolless_and_thinking_enabled() {
        let body = build_warmup_body("proj-1", "claude-sonnet-4-5-thinking", "sess-1");
        assert!(body["request"].get("tools").is_none());
        assert_eq!(
            body["request"]["generationConfig"]["thinkingConfig"]["include_thoughts"],
            json!(true)
        );
        assert_eq!(body["request"]["sessionId"], json!("sess-1"));
    }

    #[test]
    fn warmup_is_requested_for_fresh_claude_tool_sessions() {
        let mut config = BrokerConfig::default();
        config.keep_thinking = true;
        let cache = cache("warmupflag");
        let keys = SessionKeyBuilder::with_uuid("u1");
        let ctx = context(&config, &cache, &keys);

        let url = "https://generativelanguage.googleapis.com/v1beta/models/claude-sonnet-4-5-thinking:generateContent";
        let body = json!({
            "tools": [{"name": "run", "input_schema": {"type": "object", "properties": {"cmd": {}}}}],
            "contents": [{"role": "user", "parts": [{"text": "go"}]}]
        });
        let prepared = prepare_request(&ctx, url, body).expect("prepare");
        assert!(prepared.needs_signed_thinking_warmup);
    }
}
