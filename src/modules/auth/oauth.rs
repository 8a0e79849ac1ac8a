use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::constants::{
    OAUTH_AUTH_URL, OAUTH_CLIENT_ID, OAUTH_CLIENT_SECRET, OAUTH_REDIRECT_URI, OAUTH_SCOPES,
    OAUTH_TOKEN_URL,
};
use crate::error::{BrokerError, BrokerResult};

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Result of a refresh, with the expiry already converted to unix ms.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires: i64,
}

pub fn generate_pkce_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn pkce_challenge_s256(verifier: &str) -> String {
    let digest = sha2::Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Authorization URL for the external login flow. The loop-back callback
/// server that consumes the redirect lives outside this crate.
pub fn build_auth_url(state: &str, code_challenge: &str) -> Result<String, String> {
    let params = vec![
        ("client_id", OAUTH_CLIENT_ID),
        ("redirect_uri", OAUTH_REDIRECT_URI),
        ("response_type", "code"),
        ("scope", OAUTH_SCOPES),
        ("access_type", "offline"),
        ("prompt", "consent"),
        ("state", state),
        ("code_challenge", code_challenge),
        ("code_challenge_method", "S256"),
    ];
    let url = url::Url::parse_with_params(OAUTH_AUTH_URL, &params)
        .map_err(|e| format!("invalid_auth_url: {}", e))?;
    Ok(url.to_string())
}

/// Exchange a refresh token for a fresh access token.
///
/// `invalid_grant` in the response body means the credential is permanently
/// dead and the caller must drop the account. Every other failure is
/// retryable upstream; this function never retries on its own.
pub async fn refresh_access_token(refresh_token: &str) -> BrokerResult<RefreshedToken> {
    refresh_access_token_at(OAUTH_TOKEN_URL, refresh_token).await
}

pub(crate) async fn refresh_access_token_at(
    token_url: &str,
    refresh_token: &str,
) -> BrokerResult<RefreshedToken> {
    let params: Vec<(&str, &str)> = vec![
        ("client_id", OAUTH_CLIENT_ID),
        ("client_secret", OAUTH_CLIENT_SECRET),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];

    let response = crate::utils::http::oauth_client()
        .post(token_url)
        .form(&params)
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        let token: TokenResponse = response.json().await?;
        let expires = chrono::Utc::now().timestamp_millis() + token.expires_in * 1000;
        tracing::debug!(
            "[OAuth] token refreshed, expires in {}s",
            token.expires_in
        );
        return Ok(RefreshedToken {
            access_token: token.access_token,
            expires,
        });
    }

    let body = response.text().await.unwrap_or_default();
    if is_invalid_grant(&body) {
        tracing::warn!("[OAuth] refresh rejected with invalid_grant; credential is dead");
        return Err(BrokerError::InvalidGrant);
    }
    Err(BrokerError::OAuth(format!(
        "token refresh failed ({}): {}",
        status, body
    )))
}

fn is_invalid_grant(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str().map(str::to_string)))
        .is_some_and(|e| e == "invalid_grant")
}
