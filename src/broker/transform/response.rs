//! Buffered (non-streaming or error) response handling: debug-footer
//! annotation, retry hints, usage headers, preview-access rewriting, empty
//! detection and the thinking-order sentinel.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{BrokerError, BrokerResult};

pub const CACHED_TOKENS_HEADER: &str = "x-antigravity-cached-tokens";
pub const PROMPT_TOKENS_HEADER: &str = "x-antigravity-prompt-tokens";
pub const CANDIDATE_TOKENS_HEADER: &str = "x-antigravity-candidate-tokens";
pub const TOTAL_TOKENS_HEADER: &str = "x-antigravity-total-tokens";

/// Request facts echoed into error footers.
pub struct ResponseMeta<'a> {
    pub model: &'a str,
    pub project: &'a str,
    pub endpoint: &'a str,
}

#[derive(Debug)]
pub enum BufferedOutcome {
    /// Pass through to the host: final status, extra headers, body text.
    Done {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },
    /// Success body with no candidates/choices; the caller retries.
    Empty,
}

pub fn process_buffered_response(
    status: u16,
    body_text: &str,
    meta: &ResponseMeta<'_>,
) -> BrokerResult<BufferedOutcome> {
    if !(200..300).contains(&status) {
        return process_error_body(status, body_text, meta);
    }

    let Ok(parsed) = serde_json::from_str::<Value>(body_text) else {
        // Not JSON; hand it to the host untouched.
        return Ok(BufferedOutcome::Done {
            status,
            headers: Vec::new(),
            body: body_text.to_string(),
        });
    };
    let mut response = match parsed.get("response") {
        Some(inner) => inner.clone(),
        None => parsed,
    };

    // A 200 whose payload carries an embedded error (preview gating shows up
    // this way) gets its message rewritten into something actionable.
    if let Some(code) = response.pointer("/error/code").and_then(|v| v.as_u64()) {
        if code == 404 {
            let message = response
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if message.contains("preview") || message.contains("not found") {
                let rewritten = format!(
                    "Model {} is not available to this account (it may require preview \
                     access). Sign in with an account that has access or choose another \
                     model. Upstream said: {}",
                    meta.model, message
                );
                response["error"]["message"] = Value::String(rewritten);
            }
        }
    }

    if is_empty_success(&response) {
        return Ok(BufferedOutcome::Empty);
    }

    let headers = usage_headers(&response);
    Ok(BufferedOutcome::Done {
        status,
        headers,
        body: response.to_string(),
    })
}

fn process_error_body(
    status: u16,
    body_text: &str,
    meta: &ResponseMeta<'_>,
) -> BrokerResult<BufferedOutcome> {
    let parsed = serde_json::from_str::<Value>(body_text).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/message"))
        .and_then(|v| v.as_str())
        .unwrap_or(body_text)
        .to_string();

    if is_thinking_order_error(&message) {
        return Err(BrokerError::ThinkingRecoveryNeeded {
            original: message.to_string(),
        });
    }

    let mut headers = Vec::new();
    if let Some(retry_secs) = parsed.as_ref().and_then(retry_delay_seconds) {
        headers.push(("retry-after".to_string(), format!("{}", retry_secs.ceil() as u64)));
        headers.push((
            "retry-after-ms".to_string(),
            format!("{}", (retry_secs * 1000.0).round() as u64),
        ));
    }

    let footer = format!(
        "\n\n[antigravity debug] model={} project={} endpoint={} status={}",
        meta.model, meta.project, meta.endpoint, status
    );
    let body = match parsed {
        Some(mut json) => {
            let annotated = format!("{}{}", message, footer);
            if json.pointer("/error/message").is_some() {
                json["error"]["message"] = Value::String(annotated);
                json.to_string()
            } else {
                format!("{}{}", body_text, footer)
            }
        }
        None => format!("{}{}", body_text, footer),
    };

    Ok(BufferedOutcome::Done {
        status,
        headers,
        body,
    })
}

/// The `thinking_block_order` rejection class: the upstream refused the
/// ordering of thinking blocks and only a crash-and-restart rebuild helps.
pub fn is_thinking_order_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    if !lower.contains("thinking") {
        return false;
    }
    lower.contains("first block")
        || lower.contains("must start with")
        || lower.contains("preceeding")
        || lower.contains("preceding tool_use")
        || (lower.contains("expected") && lower.contains("found"))
}

/// A success body with no candidates and no choices is the retryable
/// empty-response case.
fn is_empty_success(response: &Value) -> bool {
    if response.get("error").is_some() {
        return false;
    }
    let candidates_empty = response
        .get("candidates")
        .and_then(|v| v.as_array())
        .map(|c| c.is_empty())
        .unwrap_or(true);
    let choices_empty = response
        .get("choices")
        .and_then(|v| v.as_array())
        .map(|c| c.is_empty())
        .unwrap_or(true);
    candidates_empty && choices_empty
}

/// Copy usage counters onto response headers so the host can meter cache hits.
fn usage_headers(response: &Value) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    let Some(usage) = response.get("usageMetadata") else {
        return headers;
    };
    let pairs = [
        ("cachedContentTokenCount", CACHED_TOKENS_HEADER),
        ("promptTokenCount", PROMPT_TOKENS_HEADER),
        ("candidatesTokenCount", CANDIDATE_TOKENS_HEADER),
        ("totalTokenCount", TOTAL_TOKENS_HEADER),
    ];
    for (field, header) in pairs {
        if let Some(count) = usage.get(field).and_then(|v| v.as_u64()) {
            headers.push((header.to_string(), count.to_string()));
        }
    }
    headers
}

/// Retry delay from an error body's `RetryInfo` detail, e.g. `"30s"` or
/// `"1.5s"`. Returns seconds.
pub fn retry_delay_seconds(body: &Value) -> Option<f64> {
    let details = body.pointer("/error/details")?.as_array()?;
    for detail in details {
        let is_retry_info = detail
            .get("@type")
            .and_then(|v| v.as_str())
            .map(|t| t.ends_with("RetryInfo"))
            .unwrap_or(false);
        let delay = detail
            .get("retryDelay")
            .or_else(|| detail.get("retry_delay"))
            .and_then(|v| v.as_str());
        if let Some(delay) = delay {
            if is_retry_info || detail.get("@type").is_none() {
                if let Some(seconds) = parse_delay_literal(delay) {
                    return Some(seconds);
                }
            }
        }
    }
    None
}

fn parse_delay_literal(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_end_matches('s');
    trimmed.parse::<f64>().ok().filter(|v| *v >= 0.0)
}

static RETRY_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:try again in|retry after|backoff for|wait)\s*(?:(\d+)m\s*)?(\d+)\s*s")
        .expect("retry phrase regex")
});

/// Retry delay mentioned in prose, e.g. "Try again in 2m 30s" or
/// "Retry after 45s".
fn retry_seconds_from_message(message: &str) -> Option<u64> {
    let caps = RETRY_PHRASE.captures(message)?;
    let minutes = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(0);
    let seconds = caps.get(2)?.as_str().parse::<u64>().ok()?;
    Some(minutes * 60 + seconds)
}

/// Retry hint for a 429/5xx response: the `Retry-After` header first, then
/// the body's RetryInfo, then a prose match, then a fixed fallback.
pub fn retry_after_ms(retry_after_header: Option<&str>, body_text: &str) -> i64 {
    if let Some(header) = retry_after_header {
        if let Ok(seconds) = header.trim().parse::<u64>() {
            return (seconds as i64) * 1000;
        }
    }
    if let Ok(body) = serde_json::from_str::<Value>(body_text) {
        if let Some(seconds) = retry_delay_seconds(&body) {
            return (seconds * 1000.0).round() as i64;
        }
    }
    if let Some(seconds) = retry_seconds_from_message(body_text) {
        return (seconds as i64) * 1000;
    }
    // Default lockout when the upstream gave no hint.
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> ResponseMeta<'static> {
        ResponseMeta {
            model: "claude-sonnet-4-5",
            project: "proj-1",
            endpoint: "https://daily-cloudcode-pa.sandbox.googleapis.com",
        }
    }

    #[test]
    fn success_unwraps_and_extracts_usage_headers() {
        let body = json!({
            "response": {
                "candidates": [{"content": {"parts": [{"text": "hi"}]}}],
                "usageMetadata": {
                    "promptTokenCount": 120,
                    "candidatesTokenCount": 40,
                    "totalTokenCount": 160,
                    "cachedContentTokenCount": 100
                }
            }
        })
        .to_string();
        let outcome = process_buffered_response(200, &body, &meta()).expect("process");
        let BufferedOutcome::Done { status, headers, body } = outcome else {
            panic!("expected done");
        };
        assert_eq!(status, 200);
        assert!(!body.contains("\"response\""));
        assert!(headers.contains(&(CACHED_TOKENS_HEADER.to_string(), "100".to_string())));
        assert!(headers.contains(&(PROMPT_TOKENS_HEADER.to_string(), "120".to_string())));
        assert!(headers.contains(&(CANDIDATE_TOKENS_HEADER.to_string(), "40".to_string())));
        assert!(headers.contains(&(TOTAL_TOKENS_HEADER.to_string(), "160".to_string())));
    }

    #[test]
    fn empty_success_signals_retry() {
        let body = json!({"response": {"candidates": []}}).to_string();
        let outcome = process_buffered_response(200, &body, &meta()).expect("process");
        assert!(matches!(outcome, BufferedOutcome::Empty));

        let body = json!({"response": {}}).to_string();
        let outcome = process_buffered_response(200, &body, &meta()).expect("process");
        assert!(matches!(outcome, BufferedOutcome::Empty));
    }

    #[test]
    fn error_body_gets_debug_footer_and_retry_headers() {
        let body = json!({
            "error": {
                "code": 429,
                "message": "Resource exhausted",
                "details": [{
                    "@type": "type.googleapis.com/google.rpc.RetryInfo",
                    "retryDelay": "30s"
                }]
            }
        })
        .to_string();
        let outcome = process_buffered_response(429, &body, &meta()).expect("process");
        let BufferedOutcome::Done { status, headers, body } = outcome else {
            panic!("expected done");
        };
        assert_eq!(status, 429);
        assert!(headers.contains(&("retry-after".to_string(), "30".to_string())));
        assert!(headers.contains(&("retry-after-ms".to_string(), "30000".to_string())));
        assert!(body.contains("[antigravity debug]"));
        assert!(body.contains("model=claude-sonnet-4-5"));
        assert!(body.contains("status=429"));
    }

    #[test]
    fn thinking_order_error_raises_the_sentinel() {
        let body = json!({
            "error": {
                "code": 400,
                "message": "messages.1.content.0: Expected `thinking` or `redacted_thinking`, but found `text`"
            }
        })
        .to_string();
        let err = process_buffered_response(400, &body, &meta()).unwrap_err();
        match err {
            BrokerError::ThinkingRecoveryNeeded { original } => {
                assert!(original.contains("Expected `thinking`"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn thinking_order_classifier_matches_known_shapes() {
        assert!(is_thinking_order_error(
            "The first block must be a thinking block"
        ));
        assert!(is_thinking_order_error(
            "thinking must start with a thinking block"
        ));
        assert!(is_thinking_order_error(
            "expected thinking but found text"
        ));
        assert!(is_thinking_order_error(
            "preceeding thinking block missing"
        ));
        assert!(!is_thinking_order_error("rate limit exceeded"));
        assert!(!is_thinking_order_error("expected string, found number"));
    }

    #[test]
    fn preview_404_message_is_rewritten() {
        let body = json!({
            "response": {
                "candidates": [{"content": {"parts": [{"text": "x"}]}}],
                "error": {"code": 404, "message": "model requires preview access"}
            }
        })
        .to_string();
        let outcome = process_buffered_response(200, &body, &meta()).expect("process");
        let BufferedOutcome::Done { body, .. } = outcome else {
            panic!("expected done");
        };
        assert!(body.contains("is not available to this account"));
        assert!(body.contains("claude-sonnet-4-5"));
    }

    #[test]
    fn fractional_retry_delays_parse() {
        let body = json!({
            "error": {"details": [{"@type": "t/RetryInfo", "retryDelay": "1.5s"}]}
        });
        assert_eq!(retry_delay_seconds(&body), Some(1.5));
    }

    #[test]
    fn retry_after_prefers_header_then_body_then_prose_then_default() {
        assert_eq!(retry_after_ms(Some("30"), ""), 30_000);
        let body = json!({
            "error": {"details": [{"@type": "t/RetryInfo", "retryDelay": "12s"}]}
        })
        .to_string();
        assert_eq!(retry_after_ms(None, &body), 12_000);
        assert_eq!(
            retry_after_ms(None, "Rate limit exceeded. Try again in 2m 30s"),
            150_000
        );
        assert_eq!(retry_after_ms(None, "Quota hit, retry after 45s"), 45_000);
        assert_eq!(retry_after_ms(None, "not json"), 60_000);
    }

    #[test]
    fn non_json_error_body_passes_through_annotated() {
        let outcome = process_buffered_response(502, "Bad Gateway", &meta()).expect("process");
        let BufferedOutcome::Done { status, body, .. } = outcome else {
            panic!("expected done");
        };
        assert_eq!(status, 502);
        assert!(body.starts_with("Bad Gateway"));
        assert!(body.contains("[antigravity debug]"));
    }
}
