use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::broker::account_manager::AccountManager;
use crate::broker::endpoints;
use crate::constants::{DISCOVERY_ENDPOINTS, FALLBACK_PROJECT_ID, ONBOARD_TIER_ID};
use crate::error::{BrokerError, BrokerResult};
use crate::models::Account;

const ONBOARD_MAX_ATTEMPTS: u32 = 10;
const ONBOARD_POLL_DELAY_MS: u64 = 2000;

/// Every generative request needs a project id. Resolution order:
/// the managed id already on the credential, discovery via loadCodeAssist
/// across the endpoint candidates, the user-supplied id, then the fixed
/// fallback. Results are cached per refresh token, and concurrent calls for
/// the same token share one in-flight discovery.
pub struct ProjectResolver {
    endpoints: Vec<String>,
    cache: DashMap<String, String>,
    /// refresh_token -> in-flight guard. Holding the entry's mutex is the
    /// "pending promise": latecomers block on it, then re-check the cache.
    pending: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ProjectResolver {
    pub fn new() -> Self {
        Self::with_endpoints(
            DISCOVERY_ENDPOINTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    pub fn with_endpoints(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            cache: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    pub async fn resolve(
        &self,
        account: &Account,
        access_token: &str,
        manager: &AccountManager,
    ) -> BrokerResult<String> {
        if let Some(project) = &account.managed_project_id {
            return Ok(project.clone());
        }
        if let Some(project) = self.cache.get(&account.refresh_token) {
            return Ok(project.clone());
        }

        let guard = self
            .pending
            .entry(account.refresh_token.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _held = guard.lock().await;

        // A concurrent resolver may have finished while we waited.
        if let Some(project) = self.cache.get(&account.refresh_token) {
            return Ok(project.clone());
        }

        if let Some(project) = self.discover(account, access_token).await {
            manager.update_managed_project(&account.refresh_token, &project);
            self.cache
                .insert(account.refresh_token.clone(), project.clone());
            return Ok(project);
        }

        if let Some(project) = &account.project_id {
            tracing::info!("[ProjectResolver] using user-supplied project {}", project);
            return Ok(project.clone());
        }

        tracing::warn!(
            "[ProjectResolver] discovery failed, falling back to {}",
            FALLBACK_PROJECT_ID
        );
        Ok(FALLBACK_PROJECT_ID.to_string())
    }

    /// Try each endpoint candidate in order; first hit wins.
    async fn discover(&self, account: &Account, access_token: &str) -> Option<String> {
        let metadata = load_code_assist_metadata(account.project_id.as_deref());
        for endpoint in &self.endpoints {
            let url = endpoints::load_code_assist_url(endpoint);
            let response = crate::utils::http::discovery_client()
                .post(&url)
                .bearer_auth(access_token)
                .json(&metadata)
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("[ProjectResolver] {} unreachable: {}", endpoint, e);
                    continue;
                }
            };
            if !response.status().is_success() {
                tracing::debug!(
                    "[ProjectResolver] {} returned {}",
                    endpoint,
                    response.status()
                );
                continue;
            }
            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(_) => continue,
            };
            if let Some(project) = extract_companion_project(&body) {
                tracing::info!(
                    "[ProjectResolver] discovered managed project {} via {}",
                    project,
                    endpoint
                );
                return Some(project);
            }
        }
        None
    }

    /// Out-of-band onboarding: request a managed project and poll the
    /// long-running operation until it reports done.
    pub async fn onboard(&self, access_token: &str, project_id: &str) -> BrokerResult<()> {
        let endpoint = self
            .endpoints
            .first()
            .ok_or_else(|| BrokerError::ProjectUnavailable("no endpoints configured".into()))?;
        let url = endpoints::onboard_user_url(endpoint);
        let body = json!({
            "tierId": ONBOARD_TIER_ID,
            "cloudaicompanionProject": project_id,
            "metadata": load_code_assist_metadata(None)["metadata"],
        });

        for attempt in 1..=ONBOARD_MAX_ATTEMPTS {
            let response = crate::utils::http::discovery_client()
                .post(&url)
                .bearer_auth(access_token)
                .json(&body)
                .send()
                .await?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                return Err(BrokerError::UpstreamTransient { status, body: text });
            }
            let operation: Value = response.json().await?;
            if operation.get("done").and_then(|v| v.as_bool()) == Some(true) {
                tracing::info!("[ProjectResolver] onboarding finished for {}", project_id);
                return Ok(());
            }
            tracing::debug!(
                "[ProjectResolver] onboarding pending (attempt {}/{})",
                attempt,
                ONBOARD_MAX_ATTEMPTS
            );
            tokio::time::sleep(std::time::Duration::from_millis(ONBOARD_POLL_DELAY_MS)).await;
        }
        Err(BrokerError::ProjectUnavailable(format!(
            "onboarding did not complete after {} attempts",
            ONBOARD_MAX_ATTEMPTS
        )))
    }
}

impl Default for ProjectResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn load_code_assist_metadata(duet_project: Option<&str>) -> Value {
    let mut metadata = json!({
        "ideType": "IDE_UNSPECIFIED",
        "platform": "PLATFORM_UNSPECIFIED",
        "pluginType": "GEMINI",
    });
    if let Some(project) = duet_project {
        metadata["duetProject"] = json!(project);
    }
    json!({ "metadata": metadata })
}

/// The upstream answers with either a bare string or an `{id}` object.
fn extract_companion_project(body: &Value) -> Option<String> {
    match body.get("cloudaicompanionProject")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(obj) => obj
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .map(str::to_string),
        _ => None,
    }
}
