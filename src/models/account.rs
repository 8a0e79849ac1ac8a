use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::constants::TOKEN_EXPIRY_SKEW_MS;

/// Physical rate-limit bucket. Claude has a single pool; the Gemini family
/// is reachable through two distinct pools, one per outbound header style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuotaKey {
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "gemini-antigravity")]
    GeminiAntigravity,
    #[serde(rename = "gemini-cli")]
    GeminiCli,
}

impl QuotaKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKey::Claude => "claude",
            QuotaKey::GeminiAntigravity => "gemini-antigravity",
            QuotaKey::GeminiCli => "gemini-cli",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(QuotaKey::Claude),
            "gemini-antigravity" => Some(QuotaKey::GeminiAntigravity),
            "gemini-cli" => Some(QuotaKey::GeminiCli),
            _ => None,
        }
    }

    /// The bucket a (family, header style) pair draws from.
    pub fn for_style(family: ModelFamily, style: HeaderStyle) -> Self {
        match (family, style) {
            (ModelFamily::Claude, _) => QuotaKey::Claude,
            (ModelFamily::Gemini, HeaderStyle::Antigravity) => QuotaKey::GeminiAntigravity,
            (ModelFamily::Gemini, HeaderStyle::GeminiCli) => QuotaKey::GeminiCli,
        }
    }

    pub fn family_keys(family: ModelFamily) -> &'static [QuotaKey] {
        match family {
            ModelFamily::Claude => &[QuotaKey::Claude],
            ModelFamily::Gemini => &[QuotaKey::GeminiAntigravity, QuotaKey::GeminiCli],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "gemini")]
    Gemini,
}

impl ModelFamily {
    /// Family is derived from the requested model name.
    pub fn of_model(model: &str) -> Self {
        if model.to_ascii_lowercase().contains("claude") {
            ModelFamily::Claude
        } else {
            ModelFamily::Gemini
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Claude => "claude",
            ModelFamily::Gemini => "gemini",
        }
    }
}

/// Outbound identity. Selects User-Agent, API client and client-metadata
/// headers; Gemini requests may fall back from the first to the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderStyle {
    #[serde(rename = "antigravity")]
    Antigravity,
    #[serde(rename = "gemini-cli")]
    GeminiCli,
}

impl HeaderStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeaderStyle::Antigravity => "antigravity",
            HeaderStyle::GeminiCli => "gemini-cli",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchReason {
    #[serde(rename = "rate-limit")]
    RateLimit,
    #[serde(rename = "initial")]
    Initial,
    #[serde(rename = "rotation")]
    Rotation,
}

/// One upstream user credential, owned by the account manager.
#[derive(Debug, Clone)]
pub struct Account {
    /// Stable position in the pool; survives until the account is removed.
    pub index: usize,
    pub email: Option<String>,
    pub refresh_token: String,
    /// Project id supplied by the user, if any.
    pub project_id: Option<String>,
    /// Managed project id discovered through loadCodeAssist.
    pub managed_project_id: Option<String>,
    pub access_token: Option<String>,
    /// Access token expiry, unix ms.
    pub expires: Option<i64>,
    pub added_at: i64,
    pub last_used: i64,
    /// Per-bucket reset times, unix ms. Entries in the past are treated as
    /// absent and pruned lazily.
    pub rate_limit_reset_times: HashMap<QuotaKey, i64>,
    pub last_switch_reason: Option<SwitchReason>,
}

impl Account {
    pub fn new(index: usize, refresh_token: String) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            index,
            email: None,
            refresh_token,
            project_id: None,
            managed_project_id: None,
            access_token: None,
            expires: None,
            added_at: now,
            last_used: now,
            rate_limit_reset_times: HashMap::new(),
            last_switch_reason: None,
        }
    }

    /// Expired means missing, or within the clock-skew buffer of expiry.
    pub fn token_expired(&self, now_ms: i64) -> bool {
        match (&self.access_token, self.expires) {
            (Some(_), Some(expires)) => expires <= now_ms + TOKEN_EXPIRY_SKEW_MS,
            _ => true,
        }
    }

    /// Drop reset times that are already in the past.
    pub fn prune_expired_resets(&mut self, now_ms: i64) {
        self.rate_limit_reset_times.retain(|_, reset| *reset > now_ms);
    }

    fn key_limited(&self, key: QuotaKey, now_ms: i64) -> bool {
        self.rate_limit_reset_times
            .get(&key)
            .is_some_and(|reset| *reset > now_ms)
    }

    /// An account is limited for a family only when every one of the
    /// family's buckets has a reset time in the future.
    pub fn is_rate_limited_for(&self, family: ModelFamily, now_ms: i64) -> bool {
        QuotaKey::family_keys(family)
            .iter()
            .all(|key| self.key_limited(*key, now_ms))
    }

    /// First free header style for the family, antigravity preferred.
    pub fn available_style(&self, family: ModelFamily, now_ms: i64) -> Option<HeaderStyle> {
        match family {
            ModelFamily::Claude => {
                (!self.key_limited(QuotaKey::Claude, now_ms)).then_some(HeaderStyle::Antigravity)
            }
            ModelFamily::Gemini => {
                if !self.key_limited(QuotaKey::GeminiAntigravity, now_ms) {
                    Some(HeaderStyle::Antigravity)
                } else if !self.key_limited(QuotaKey::GeminiCli, now_ms) {
                    Some(HeaderStyle::GeminiCli)
                } else {
                    None
                }
            }
        }
    }

    /// Remaining wait until this account frees up for the family: zero when
    /// any bucket is free, else the smallest remaining reset among buckets.
    pub fn wait_ms_for(&self, family: ModelFamily, now_ms: i64) -> i64 {
        if !self.is_rate_limited_for(family, now_ms) {
            return 0;
        }
        QuotaKey::family_keys(family)
            .iter()
            .filter_map(|key| self.rate_limit_reset_times.get(key))
            .map(|reset| (reset - now_ms).max(0))
            .min()
            .unwrap_or(0)
    }
}

/// Persisted shape of one account (camelCase on disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    #[serde(default)]
    pub added_at: i64,
    #[serde(default)]
    pub last_used: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub rate_limit_reset_times: HashMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_switch_reason: Option<SwitchReason>,
}

impl AccountRecord {
    pub fn from_account(account: &Account) -> Self {
        Self {
            email: account.email.clone(),
            refresh_token: account.refresh_token.clone(),
            project_id: account.project_id.clone(),
            managed_project_id: account.managed_project_id.clone(),
            access_token: account.access_token.clone(),
            expires: account.expires,
            added_at: account.added_at,
            last_used: account.last_used,
            rate_limit_reset_times: account
                .rate_limit_reset_times
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            last_switch_reason: account.last_switch_reason,
        }
    }

    /// Unknown bucket names and already-expired resets are dropped.
    pub fn into_account(self, index: usize, now_ms: i64) -> Account {
        let rate_limit_reset_times = self
            .rate_limit_reset_times
            .iter()
            .filter_map(|(k, v)| QuotaKey::parse(k).map(|key| (key, *v)))
            .filter(|(_, reset)| *reset > now_ms)
            .collect();
        Account {
            index,
            email: self.email,
            refresh_token: self.refresh_token,
            project_id: self.project_id,
            managed_project_id: self.managed_project_id,
            access_token: self.access_token,
            expires: self.expires,
            added_at: self.added_at,
            last_used: self.last_used,
            rate_limit_reset_times,
            last_switch_reason: self.last_switch_reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyIndexes {
    pub claude: i32,
    pub gemini: i32,
}

impl Default for FamilyIndexes {
    fn default() -> Self {
        Self {
            claude: -1,
            gemini: -1,
        }
    }
}

impl FamilyIndexes {
    pub fn get(&self, family: ModelFamily) -> i32 {
        match family {
            ModelFamily::Claude => self.claude,
            ModelFamily::Gemini => self.gemini,
        }
    }

    pub fn set(&mut self, family: ModelFamily, index: i32) {
        match family {
            ModelFamily::Claude => self.claude = index,
            ModelFamily::Gemini => self.gemini = index,
        }
    }
}

/// Current (v3) on-disk shape of the accounts file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountsFile {
    pub version: u32,
    pub accounts: Vec<AccountRecord>,
    #[serde(default = "default_index")]
    pub active_index: i32,
    #[serde(default)]
    pub active_index_by_family: FamilyIndexes,
}

fn default_index() -> i32 {
    -1
}

pub const ACCOUNTS_FILE_VERSION: u32 = 3;

impl AccountsFile {
    pub fn empty() -> Self {
        Self {
            version: ACCOUNTS_FILE_VERSION,
            accounts: Vec::new(),
            active_index: -1,
            active_index_by_family: FamilyIndexes::default(),
        }
    }
}

impl Default for AccountsFile {
    fn default() -> Self {
        Self::empty()
    }
}
