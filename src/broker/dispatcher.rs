//! Top-level request flow: pick an account, keep its token fresh, resolve a
//! project, prepare the body, send, and transform the response — rotating
//! accounts and header styles on rate limits along the way.

use bytes::Bytes;
use futures::Stream;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;

use crate::broker::account_manager::AccountManager;
use crate::broker::project::ProjectResolver;
use crate::broker::session::SessionKeyBuilder;
use crate::broker::signature_cache::SignatureCache;
use crate::broker::transform::request::{
    build_warmup_body, prepare_request, PreparedRequest, RequestContext,
};
use crate::broker::transform::response::{
    process_buffered_response, retry_after_ms, BufferedOutcome, ResponseMeta,
};
use crate::broker::transform::streaming::{transform_sse_stream, StreamOptions};
use crate::broker::{endpoints, transform::response};
use crate::constants::{GENERATION_ENDPOINTS, MIN_SIGNATURE_LENGTH};
use crate::error::{BrokerError, BrokerResult};
use crate::models::{Account, BrokerConfig, HeaderStyle, ModelFamily};

pub enum ResponseBody {
    Buffered(String),
    Stream(Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Buffered(body) => f.debug_tuple("Buffered").field(body).finish(),
            ResponseBody::Stream(_) => f.debug_tuple("Stream").field(&"<stream>").finish(),
        }
    }
}

#[derive(Debug)]
pub struct BrokerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

enum SendOutcome {
    Response(BrokerResponse),
    /// Transient upstream failure (plain 5xx or 404): worth trying the next
    /// endpoint candidate before giving the response to the host.
    Transient(BrokerResponse),
    RateLimited { retry_ms: i64 },
    ThinkingRecovery,
}

pub struct Dispatcher {
    config: BrokerConfig,
    manager: Arc<AccountManager>,
    projects: Arc<ProjectResolver>,
    cache: Arc<SignatureCache>,
    session_keys: SessionKeyBuilder,
    generation_endpoints: Vec<String>,
}

impl Dispatcher {
    pub fn new(
        config: BrokerConfig,
        manager: Arc<AccountManager>,
        projects: Arc<ProjectResolver>,
        cache: Arc<SignatureCache>,
        session_keys: SessionKeyBuilder,
    ) -> Self {
        Self {
            config,
            manager,
            projects,
            cache,
            session_keys,
            generation_endpoints: GENERATION_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[cfg(test)]
    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.generation_endpoints = endpoints;
        self
    }

    /// Only calls aimed at the generative-language host are ours to rewrite.
    pub fn intercepts(url: &str) -> bool {
        url.contains("generativelanguage.googleapis.com")
            && endpoints::parse_model_action(url).is_some()
    }

    pub async fn dispatch(&self, url: &str, body: Value) -> BrokerResult<BrokerResponse> {
        let (model, _) = endpoints::parse_model_action(url).ok_or_else(|| {
            BrokerError::Transform(format!("not a generative model url: {}", url))
        })?;
        let family = ModelFamily::of_model(&model);

        if self.manager.is_empty() {
            return Err(BrokerError::ConfigurationMissing(
                "no accounts configured".to_string(),
            ));
        }

        let mut force_thinking_recovery = false;
        let max_attempts = self.manager.len() + 1;
        let mut attempt = 0usize;
        while attempt < max_attempts {
            attempt += 1;

            let Some(account) = self.manager.get_current_or_next(family) else {
                return Ok(self.exhausted_response(family));
            };
            let account = match self.ensure_fresh_token(account).await? {
                Some(account) => account,
                None => continue, // invalid_grant: account removed, pick another
            };
            let access = match &account.access_token {
                Some(access) => access.clone(),
                None => continue,
            };
            let Some(style) = self.manager.available_header_style(&account, family) else {
                continue;
            };

            let project = self
                .projects
                .resolve(&account, &access, &self.manager)
                .await?;

            // Endpoint candidates in priority order; transient failures
            // (network error, timeout, plain 5xx, 404) fall through to the
            // next one, the same way project discovery walks its hosts.
            let mut fallthrough: Option<BrokerResult<BrokerResponse>> = None;
            let mut outcome: Option<SendOutcome> = None;
            for endpoint in &self.generation_endpoints {
                let ctx = RequestContext {
                    config: &self.config,
                    cache: &self.cache,
                    session_keys: &self.session_keys,
                    access_token: &access,
                    project: &project,
                    endpoint,
                    style,
                    force_thinking_recovery,
                };
                let prepared = prepare_request(&ctx, url, body.clone())?;

                if prepared.needs_signed_thinking_warmup {
                    self.run_warmup(&prepared, &access, style, &project, endpoint)
                        .await;
                }

                match self.send_and_process(&prepared, &project, endpoint).await {
                    Ok(SendOutcome::Transient(response)) => {
                        tracing::warn!(
                            "[Dispatcher] transient {} from {}, trying next endpoint",
                            response.status,
                            endpoint
                        );
                        fallthrough = Some(Ok(response));
                        continue;
                    }
                    Ok(other) => {
                        outcome = Some(other);
                        break;
                    }
                    Err(BrokerError::Network(e)) => {
                        tracing::warn!("[Dispatcher] {} unreachable: {}", endpoint, e);
                        fallthrough = Some(Err(BrokerError::Network(e)));
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let Some(outcome) = outcome else {
                // Every endpoint failed the same way; surface the last one.
                return match fallthrough {
                    Some(result) => result,
                    None => Err(BrokerError::Transform(
                        "no generation endpoints configured".to_string(),
                    )),
                };
            };

            match outcome {
                SendOutcome::Response(response) => return Ok(response),
                SendOutcome::Transient(response) => return Ok(response),
                SendOutcome::RateLimited { retry_ms } => {
                    self.manager
                        .mark_rate_limited(&account, retry_ms, family, style);
                    continue;
                }
                SendOutcome::ThinkingRecovery => {
                    if force_thinking_recovery {
                        // Already rebuilt once; give the error to the host.
                        return Err(BrokerError::ConversationCorrupted(
                            "thinking recovery retry did not converge".to_string(),
                        ));
                    }
                    force_thinking_recovery = true;
                    attempt -= 1; // the rebuild retry does not consume a rotation slot
                    continue;
                }
            }
        }

        Ok(self.exhausted_response(family))
    }

    /// Refresh an expired access token in place. `None` means the account was
    /// permanently dead and has been removed from the pool.
    async fn ensure_fresh_token(&self, mut account: Account) -> BrokerResult<Option<Account>> {
        let now = chrono::Utc::now().timestamp_millis();
        if !account.token_expired(now) {
            return Ok(Some(account));
        }
        match crate::modules::auth::oauth::refresh_access_token(&account.refresh_token).await {
            Ok(refreshed) => {
                self.manager
                    .update_token(&account.refresh_token, &refreshed);
                account.access_token = Some(refreshed.access_token);
                account.expires = Some(refreshed.expires);
                Ok(Some(account))
            }
            Err(BrokerError::InvalidGrant) => {
                self.manager.remove_account(&account.refresh_token);
                if self.manager.is_empty() {
                    return Err(BrokerError::ConfigurationMissing(
                        "the last account was rejected with invalid_grant".to_string(),
                    ));
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// All accounts limited for the family: hand the host a 429 with the
    /// smallest wait across the pool.
    fn exhausted_response(&self, family: ModelFamily) -> BrokerResponse {
        let wait_ms = self.manager.min_wait_ms_for_family(family).max(1000);
        let body = json!({
            "error": {
                "code": 429,
                "status": "RESOURCE_EXHAUSTED",
                "message": format!(
                    "All accounts are rate limited for the {} family; retry in {}s",
                    family.as_str(),
                    wait_ms / 1000
                ),
            }
        });
        BrokerResponse {
            status: 429,
            headers: vec![
                ("retry-after".to_string(), (wait_ms / 1000).to_string()),
                ("retry-after-ms".to_string(), wait_ms.to_string()),
            ],
            body: ResponseBody::Buffered(body.to_string()),
        }
    }

    async fn send_and_process(
        &self,
        prepared: &PreparedRequest,
        project: &str,
        endpoint: &str,
    ) -> BrokerResult<SendOutcome> {
        let meta = ResponseMeta {
            model: &prepared.resolved.actual_model,
            project,
            endpoint,
        };

        let mut empty_attempts = 0u32;
        loop {
            let response = crate::utils::http::generation_client()
                .post(&prepared.url)
                .headers(prepared.headers.clone())
                .json(&prepared.body)
                .send()
                .await?;

            let status = response.status().as_u16();
            let retry_after_header = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();

            if status == 429 {
                let body = response.text().await.unwrap_or_default();
                let retry_ms = retry_after_ms(retry_after_header.as_deref(), &body);
                tracing::warn!(
                    "[Dispatcher] 429 from upstream, account cools down for {} ms",
                    retry_ms
                );
                return Ok(SendOutcome::RateLimited { retry_ms });
            }

            if prepared.streaming
                && (200..300).contains(&status)
                && content_type.starts_with("text/event-stream")
            {
                let stream = transform_sse_stream(
                    Box::pin(response.bytes_stream()),
                    self.cache.clone(),
                    StreamOptions {
                        session_key: prepared.session_key.clone(),
                        keep_thinking: self.config.keep_thinking,
                        debug: self.config.debug,
                        model: prepared.resolved.actual_model.clone(),
                    },
                );
                let mut headers =
                    vec![("content-type".to_string(), "text/event-stream".to_string())];
                if prepared.tool_debug_missing > 0 {
                    headers.push((
                        crate::broker::transform::request::TOOL_MISSING_HEADER.to_string(),
                        prepared.tool_debug_missing.to_string(),
                    ));
                }
                return Ok(SendOutcome::Response(BrokerResponse {
                    status,
                    headers,
                    body: ResponseBody::Stream(stream),
                }));
            }

            let body_text = response.text().await.unwrap_or_default();

            // A 5xx that names a retry delay also cools the account down.
            if (500..600).contains(&status) {
                if let Ok(parsed) = serde_json::from_str::<Value>(&body_text) {
                    if let Some(seconds) = response::retry_delay_seconds(&parsed) {
                        return Ok(SendOutcome::RateLimited {
                            retry_ms: (seconds * 1000.0).round() as i64,
                        });
                    }
                }
            }

            match process_buffered_response(status, &body_text, &meta) {
                Ok(BufferedOutcome::Done {
                    status,
                    mut headers,
                    body,
                }) => {
                    if prepared.tool_debug_missing > 0 {
                        headers.push((
                            crate::broker::transform::request::TOOL_MISSING_HEADER.to_string(),
                            prepared.tool_debug_missing.to_string(),
                        ));
                    }
                    let response = BrokerResponse {
                        status,
                        headers,
                        body: ResponseBody::Buffered(body),
                    };
                    // Plain 5xx (no retry hint) and 404 may be an endpoint
                    // problem rather than a request problem.
                    if status == 404 || (500..600).contains(&status) {
                        return Ok(SendOutcome::Transient(response));
                    }
                    return Ok(SendOutcome::Response(response));
                }
                Ok(BufferedOutcome::Empty) => {
                    empty_attempts += 1;
                    if empty_attempts >= self.config.empty_response_max_attempts {
                        return Err(BrokerError::EmptyResponse {
                            attempts: empty_attempts,
                        });
                    }
                    tracing::warn!(
                        "[Dispatcher] empty response, retrying ({}/{})",
                        empty_attempts,
                        self.config.empty_response_max_attempts
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.config.empty_response_retry_delay_ms,
                    ))
                    .await;
                }
                Err(BrokerError::ThinkingRecoveryNeeded { original }) => {
                    tracing::warn!(
                        "[Dispatcher] thinking order rejected, rebuilding once: {}",
                        original
                    );
                    return Ok(SendOutcome::ThinkingRecovery);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fire the minimal thinking-enabled request and harvest its signature so
    /// the main request has one to lean on.
    async fn run_warmup(
        &self,
        prepared: &PreparedRequest,
        access: &str,
        style: HeaderStyle,
        project: &str,
        endpoint: &str,
    ) {
        let url = endpoints::v1internal(endpoint, "generateContent", false);
        let body = build_warmup_body(
            project,
            &prepared.resolved.actual_model,
            &prepared.session_key,
        );
        let headers = crate::broker::headers::build_outbound_headers(access, style, false);

        let response = crate::utils::http::generation_client()
            .post(&url)
            .headers(headers)
            .json(&body)
            .send()
            .await;
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::warn!("[Warmup] upstream answered {}", response.status());
                return;
            }
            Err(e) => {
                tracing::warn!("[Warmup] request failed: {}", e);
                return;
            }
        };
        let Ok(parsed) = response.json::<Value>().await else {
            return;
        };
        harvest_warmup_signature(&parsed, &prepared.session_key, &self.cache);
    }
}

/// Pull a thinking signature out of a buffered warmup response.
fn harvest_warmup_signature(body: &Value, session_key: &str, cache: &SignatureCache) {
    let response = body.get("response").unwrap_or(body);
    let Some(candidates) = response.get("candidates").and_then(|v| v.as_array()) else {
        return;
    };
    for candidate in candidates {
        let Some(parts) = candidate
            .pointer("/content/parts")
            .and_then(|v| v.as_array())
        else {
            continue;
        };
        let mut thinking = String::new();
        for part in parts {
            if part.get("thought").and_then(|v| v.as_bool()) == Some(true) {
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    thinking.push_str(text);
                }
            }
            if let Some(signature) = part
                .get("thoughtSignature")
                .or_else(|| part.get("signature"))
                .and_then(|v| v.as_str())
            {
                if signature.len() >= MIN_SIGNATURE_LENGTH {
                    cache.store(session_key, &thinking, signature);
                    cache.store_last(session_key, &thinking, signature, Vec::new());
                    tracing::info!("[Warmup] signature captured for {}", session_key);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignatureCacheConfig;

    #[test]
    fn interception_is_limited_to_generative_model_urls() {
        assert!(Dispatcher::intercepts(
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-3-pro:streamGenerateContent"
        ));
        assert!(!Dispatcher::intercepts(
            "https://generativelanguage.googleapis.com/v1beta/models"
        ));
        assert!(!Dispatcher::intercepts(
            "https://example.com/v1beta/models/gemini-3-pro:generateContent"
        ));
    }

    #[test]
    fn warmup_harvest_stores_signature_and_last_thinking() {
        let dir = std::env::temp_dir().join(format!(
            ".antigravity-dispatch-{}-harvest",
            std::process::id()
        ));
        let _ = std::fs::create_dir_all(&dir);
        let _ = std::fs::remove_file(dir.join(crate::constants::SIGNATURE_CACHE_FILE));
        let cache = SignatureCache::new(SignatureCacheConfig::default(), dir);
        let signature = "w".repeat(64);
        let body = json!({
            "response": {"candidates": [{"content": {"parts": [
                {"text": "warm thought", "thought": true, "thoughtSignature": signature}
            ]}}]}
        });
        harvest_warmup_signature(&body, "sess-w", &cache);
        assert_eq!(cache.get("sess-w", "warm thought"), Some(signature));
        assert!(cache.get_last("sess-w").is_some());
    }
}
