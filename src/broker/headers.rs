use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::models::HeaderStyle;

/// The three identity headers each outbound style pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StyleIdentity {
    pub user_agent: &'static str,
    pub api_client: &'static str,
    pub client_metadata: &'static str,
}

pub fn style_identity(style: HeaderStyle) -> StyleIdentity {
    match style {
        HeaderStyle::Antigravity => StyleIdentity {
            user_agent: "antigravity/1.11.5 windows/amd64",
            api_client: "google-cloud-sdk vscode_cloudshelleditor/0.1",
            client_metadata:
                r#"{"ideType":"IDE_UNSPECIFIED","platform":"PLATFORM_UNSPECIFIED","pluginType":"GEMINI"}"#,
        },
        HeaderStyle::GeminiCli => StyleIdentity {
            user_agent: "google-api-nodejs-client/9.15.1",
            api_client: "gl-node/22.17.0",
            client_metadata: "ideType=IDE_UNSPECIFIED,platform=PLATFORM_UNSPECIFIED,pluginType=GEMINI",
        },
    }
}

/// Base outbound header set: bearer auth, JSON body, the style identity and
/// the SSE accept header when streaming.
pub fn build_outbound_headers(
    access_token: &str,
    style: HeaderStyle,
    streaming: bool,
) -> HeaderMap {
    let identity = style_identity(style);
    let mut headers = HeaderMap::new();

    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", access_token)) {
        headers.insert(header::AUTHORIZATION, value);
    }
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_static(identity.user_agent),
    );
    headers.insert(
        HeaderName::from_static("x-goog-api-client"),
        HeaderValue::from_static(identity.api_client),
    );
    headers.insert(
        HeaderName::from_static("client-metadata"),
        HeaderValue::from_static(identity.client_metadata),
    );
    if streaming {
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/event-stream"),
        );
    }
    headers
}

/// Comma-append a value to a header, preserving anything already present.
pub fn append_header_value(headers: &mut HeaderMap, name: &'static str, value: &str) {
    let name = HeaderName::from_static(name);
    let merged = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => {
            if existing.split(',').any(|part| part.trim() == value) {
                existing.to_string()
            } else {
                format!("{},{}", existing, value)
            }
        }
        _ => value.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&merged) {
        headers.insert(name, value);
    }
}
