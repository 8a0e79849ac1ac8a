use parking_lot::Mutex;
use std::collections::HashMap;

use crate::models::account::{
    Account, AccountRecord, AccountsFile, FamilyIndexes, HeaderStyle, ModelFamily, QuotaKey,
    SwitchReason,
};
use crate::modules::auth::RefreshedToken;
use crate::modules::persistence::CredentialStore;

pub type ToastFn = Box<dyn Fn(&str) + Send + Sync>;

struct PoolState {
    accounts: Vec<Account>,
    /// Round-robin cursor over the currently-available subset.
    cursor: usize,
    active_index: i32,
    active_by_family: FamilyIndexes,
    /// refresh_token -> last "switched to" toast, unix ms.
    last_toast: HashMap<String, i64>,
}

/// In-memory account pool with sticky per-family selection.
///
/// Selection is sticky: the active account for a family keeps serving until
/// it is rate limited for that family, at which point the pool rotates
/// round-robin across the remaining available accounts. All methods take a
/// value snapshot under the mutex and release it before any I/O; the only
/// disk write is the credentials-file save after a mutation.
pub struct AccountManager {
    state: Mutex<PoolState>,
    store: CredentialStore,
    toast: Option<ToastFn>,
    quiet_mode: bool,
    toast_debounce_ms: i64,
}

impl AccountManager {
    pub fn new(store: CredentialStore, quiet_mode: bool, toast_debounce_ms: i64) -> Self {
        let file = store.load();
        let now = chrono::Utc::now().timestamp_millis();
        let accounts: Vec<Account> = file
            .accounts
            .into_iter()
            .enumerate()
            .map(|(i, record)| record.into_account(i, now))
            .collect();
        tracing::info!("[AccountManager] loaded {} account(s)", accounts.len());

        Self {
            state: Mutex::new(PoolState {
                accounts,
                cursor: 0,
                active_index: file.active_index,
                active_by_family: file.active_index_by_family,
                last_toast: HashMap::new(),
            }),
            store,
            toast: None,
            quiet_mode,
            toast_debounce_ms,
        }
    }

    pub fn set_toast(&mut self, toast: ToastFn) {
        self.toast = Some(toast);
    }

    pub fn len(&self) -> usize {
        self.state.lock().accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().accounts.is_empty()
    }

    pub fn accounts_snapshot(&self) -> Vec<Account> {
        self.state.lock().accounts.clone()
    }

    pub fn active_index_for(&self, family: ModelFamily) -> i32 {
        self.state.lock().active_by_family.get(family)
    }

    /// Sticky selection: keep the family's active account while it has a
    /// free bucket; rotate only on rate limit.
    pub fn get_current_or_next(&self, family: ModelFamily) -> Option<Account> {
        let now = chrono::Utc::now().timestamp_millis();
        let (result, toast_msg, persist) = {
            let mut state = self.state.lock();
            for account in state.accounts.iter_mut() {
                account.prune_expired_resets(now);
            }

            let active = state.active_by_family.get(family);
            if active >= 0 {
                let idx = active as usize;
                let keep = state
                    .accounts
                    .get(idx)
                    .map(|a| !a.is_rate_limited_for(family, now))
                    .unwrap_or(false);
                if keep {
                    state.accounts[idx].last_used = now;
                    return Some(state.accounts[idx].clone());
                }
            }

            self.rotate_locked(&mut state, family, now)
        };

        if persist {
            self.persist();
        }
        if let Some(msg) = toast_msg {
            self.emit_toast(&msg);
        }
        result
    }

    /// Round-robin over the accounts that still have a free bucket for the
    /// family. Returns None when every account is limited.
    pub fn get_next(&self, family: ModelFamily) -> Option<Account> {
        let now = chrono::Utc::now().timestamp_millis();
        let (result, toast_msg, persist) = {
            let mut state = self.state.lock();
            for account in state.accounts.iter_mut() {
                account.prune_expired_resets(now);
            }
            self.rotate_locked(&mut state, family, now)
        };

        if persist {
            self.persist();
        }
        if let Some(msg) = toast_msg {
            self.emit_toast(&msg);
        }
        result
    }

    fn rotate_locked(
        &self,
        state: &mut PoolState,
        family: ModelFamily,
        now: i64,
    ) -> (Option<Account>, Option<String>, bool) {
        let available: Vec<usize> = state
            .accounts
            .iter()
            .filter(|a| !a.is_rate_limited_for(family, now))
            .map(|a| a.index)
            .collect();

        if available.is_empty() {
            return (None, None, false);
        }

        let pick = available[state.cursor % available.len()];
        state.cursor = state.cursor.wrapping_add(1);

        let previous = state.active_by_family.get(family);
        let reason = if previous < 0 {
            SwitchReason::Initial
        } else if state
            .accounts
            .get(previous as usize)
            .map(|a| a.is_rate_limited_for(family, now))
            .unwrap_or(true)
        {
            SwitchReason::RateLimit
        } else {
            SwitchReason::Rotation
        };

        state.active_by_family.set(family, pick as i32);
        state.active_index = pick as i32;
        let account = &mut state.accounts[pick];
        account.last_used = now;
        account.last_switch_reason = Some(reason);
        let snapshot = account.clone();

        let toast_msg = if previous != pick as i32 {
            self.debounced_switch_toast(state, pick, now)
        } else {
            None
        };

        (Some(snapshot), toast_msg, true)
    }

    fn debounced_switch_toast(
        &self,
        state: &mut PoolState,
        pick: usize,
        now: i64,
    ) -> Option<String> {
        let account = &state.accounts[pick];
        let key = account.refresh_token.clone();
        let label = account
            .email
            .clone()
            .unwrap_or_else(|| format!("account {}", pick + 1));
        let last = state.last_toast.get(&key).copied().unwrap_or(0);
        if now - last < self.toast_debounce_ms {
            return None;
        }
        state.last_toast.insert(key, now);
        Some(format!("Switched to {}", label))
    }

    /// Record a 429 for the bucket this (family, style) pair draws from.
    pub fn mark_rate_limited(
        &self,
        account: &Account,
        retry_after_ms: i64,
        family: ModelFamily,
        style: HeaderStyle,
    ) {
        let key = QuotaKey::for_style(family, style);
        let reset = chrono::Utc::now().timestamp_millis() + retry_after_ms.max(0);
        {
            let mut state = self.state.lock();
            if let Some(target) = state
                .accounts
                .iter_mut()
                .find(|a| a.refresh_token == account.refresh_token)
            {
                target.rate_limit_reset_times.insert(key, reset);
                tracing::warn!(
                    "[AccountManager] account {} limited on {} for {} ms",
                    target.index,
                    key.as_str(),
                    retry_after_ms
                );
            }
        }
        self.persist();
    }

    /// First free header style for the account, antigravity preferred.
    pub fn available_header_style(
        &self,
        account: &Account,
        family: ModelFamily,
    ) -> Option<HeaderStyle> {
        let now = chrono::Utc::now().timestamp_millis();
        let state = self.state.lock();
        state
            .accounts
            .iter()
            .find(|a| a.refresh_token == account.refresh_token)
            .and_then(|a| a.available_style(family, now))
    }

    /// Zero when any account has a free bucket for the family, otherwise the
    /// smallest remaining wait across the pool.
    pub fn min_wait_ms_for_family(&self, family: ModelFamily) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let state = self.state.lock();
        if state.accounts.is_empty() {
            return 0;
        }
        state
            .accounts
            .iter()
            .map(|a| a.wait_ms_for(family, now))
            .min()
            .unwrap_or(0)
    }

    /// Write back a refreshed access token. Last write wins; a duplicate
    /// refresh from the background queue is harmless.
    pub fn update_token(&self, refresh_token: &str, refreshed: &RefreshedToken) {
        {
            let mut state = self.state.lock();
            if let Some(account) = state
                .accounts
                .iter_mut()
                .find(|a| a.refresh_token == refresh_token)
            {
                account.access_token = Some(refreshed.access_token.clone());
                account.expires = Some(refreshed.expires);
            }
        }
        self.persist();
    }

    /// Persist a discovered managed project id onto the owning account.
    pub fn update_managed_project(&self, refresh_token: &str, project_id: &str) {
        {
            let mut state = self.state.lock();
            if let Some(account) = state
                .accounts
                .iter_mut()
                .find(|a| a.refresh_token == refresh_token)
            {
                account.managed_project_id = Some(project_id.to_string());
            }
        }
        self.persist();
    }

    /// Add a credential from the external login flow. Refresh tokens are
    /// unique in the pool; a duplicate updates the existing account instead.
    pub fn add_account(
        &self,
        refresh_token: String,
        email: Option<String>,
        project_id: Option<String>,
    ) -> usize {
        let index = {
            let mut state = self.state.lock();
            if let Some(existing) = state
                .accounts
                .iter_mut()
                .find(|a| a.refresh_token == refresh_token)
            {
                if email.is_some() {
                    existing.email = email;
                }
                if project_id.is_some() {
                    existing.project_id = project_id;
                }
                existing.index
            } else {
                let index = state.accounts.len();
                let mut account = Account::new(index, refresh_token);
                account.email = email;
                account.project_id = project_id;
                state.accounts.push(account);
                index
            }
        };
        self.persist();
        index
    }

    /// Drop a permanently dead account (invalid_grant). Survivors are
    /// re-indexed, the cursor is clamped and family selections that pointed
    /// at the removed or a past-end slot are reset.
    pub fn remove_account(&self, refresh_token: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let before = state.accounts.len();
            let removed_index = state
                .accounts
                .iter()
                .position(|a| a.refresh_token == refresh_token);
            let Some(removed_index) = removed_index else {
                return false;
            };
            state.accounts.remove(removed_index);
            for (i, account) in state.accounts.iter_mut().enumerate() {
                account.index = i;
            }
            let len = state.accounts.len();
            if len == 0 {
                state.cursor = 0;
            } else {
                state.cursor %= len;
            }

            let fix = |idx: i32| -> i32 {
                if idx == removed_index as i32 || idx >= len as i32 {
                    -1
                } else if idx > removed_index as i32 {
                    idx - 1
                } else {
                    idx
                }
            };
            state.active_index = fix(state.active_index);
            state.active_by_family.claude = fix(state.active_by_family.claude);
            state.active_by_family.gemini = fix(state.active_by_family.gemini);

            tracing::warn!(
                "[AccountManager] removed dead account (pool {} -> {})",
                before,
                len
            );
            true
        };
        self.persist();
        removed
    }

    fn persist(&self) {
        let file = {
            let state = self.state.lock();
            AccountsFile {
                version: crate::models::account::ACCOUNTS_FILE_VERSION,
                accounts: state
                    .accounts
                    .iter()
                    .map(AccountRecord::from_account)
                    .collect(),
                active_index: state.active_index,
                active_index_by_family: state.active_by_family,
            }
        };
        if let Err(e) = self.store.save(&file) {
            tracing::error!("[AccountManager] failed to persist accounts: {}", e);
        }
    }

    fn emit_toast(&self, message: &str) {
        if self.quiet_mode {
            return;
        }
        if let Some(toast) = &self.toast {
            toast(message);
        }
    }
}
