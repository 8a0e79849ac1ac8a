use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;

use crate::constants::ACCOUNTS_FILE;
use crate::models::account::{AccountsFile, ACCOUNTS_FILE_VERSION};

/// Persists the versioned accounts file at the opencode config directory.
/// The file is the source of truth on startup; the in-memory pool owns the
/// data afterwards and flushes back through `save` on every mutation.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn at_default_location() -> Result<Self, String> {
        Ok(Self::new(
            crate::utils::paths::config_dir()?.join(ACCOUNTS_FILE),
        ))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load and forward-migrate. A missing or unreadable file yields an
    /// empty pool; the file is never deleted on parse failure.
    pub fn load(&self) -> AccountsFile {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return AccountsFile::empty(),
        };

        let raw: Value = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    "[CredentialStore] ignoring unparseable accounts file {}: {}",
                    self.path.display(),
                    e
                );
                return AccountsFile::empty();
            }
        };

        let migrated = migrate_to_current(raw);
        match serde_json::from_value::<AccountsFile>(migrated) {
            Ok(mut file) => {
                clamp_indices(&mut file);
                file
            }
            Err(e) => {
                tracing::warn!(
                    "[CredentialStore] accounts file has an unexpected shape, starting empty: {}",
                    e
                );
                AccountsFile::empty()
            }
        }
    }

    /// Full-file JSON write, two-space indent, temp-then-rename.
    pub fn save(&self, file: &AccountsFile) -> Result<(), String> {
        let content = serde_json::to_string_pretty(file)
            .map_err(|e| format!("failed_to_serialize_accounts: {}", e))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("failed_to_create_dir: {}", e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| format!("failed_to_write_accounts: {}", e))?;
        fs::rename(&tmp, &self.path).map_err(|e| format!("failed_to_commit_accounts: {}", e))?;
        Ok(())
    }
}

/// Restore the index invariants: every active index is either -1 or a valid
/// position in the accounts array.
fn clamp_indices(file: &mut AccountsFile) {
    let len = file.accounts.len() as i32;
    let clamp = |idx: i32| if (0..len).contains(&idx) { idx } else { -1 };
    file.active_index = clamp(file.active_index);
    file.active_index_by_family.claude = clamp(file.active_index_by_family.claude);
    file.active_index_by_family.gemini = clamp(file.active_index_by_family.gemini);
}

/// Forward migration on the raw JSON, v1 → v2 → v3. Versions newer than the
/// current writer are ignored rather than guessed at.
fn migrate_to_current(mut raw: Value) -> Value {
    if !raw.is_object() {
        tracing::warn!("[CredentialStore] accounts file is not a JSON object, starting empty");
        return json!({"version": ACCOUNTS_FILE_VERSION, "accounts": []});
    }
    let version = raw.get("version").and_then(|v| v.as_u64()).unwrap_or(1);

    if version > ACCOUNTS_FILE_VERSION as u64 {
        tracing::warn!(
            "[CredentialStore] accounts file version {} is newer than supported {}, starting empty",
            version,
            ACCOUNTS_FILE_VERSION
        );
        return json!({"version": ACCOUNTS_FILE_VERSION, "accounts": []});
    }

    if version < 2 {
        migrate_v1_to_v2(&mut raw);
    }
    if version < 3 {
        migrate_v2_to_v3(&mut raw);
    }
    raw
}

/// v1 carried a single scalar `rateLimitResetTime` per account. It fans out
/// to both the claude bucket and the antigravity-style gemini bucket, which
/// can over-report limits right after an upgrade; the times expire on their
/// own within one reset window.
fn migrate_v1_to_v2(raw: &mut Value) {
    if let Some(accounts) = raw.get_mut("accounts").and_then(|a| a.as_array_mut()) {
        for account in accounts {
            let scalar = account
                .get("rateLimitResetTime")
                .and_then(|v| v.as_i64());
            if let Some(obj) = account.as_object_mut() {
                obj.remove("rateLimitResetTime");
                if let Some(reset) = scalar {
                    obj.insert(
                        "rateLimitResetTimes".to_string(),
                        json!({"claude": reset, "gemini": reset}),
                    );
                }
            }
        }
    }
    raw["version"] = json!(2);
}

/// v2 named the antigravity-style gemini bucket plain `gemini`; v3 renames
/// it and drops reset times that are already in the past.
fn migrate_v2_to_v3(raw: &mut Value) {
    let now = chrono::Utc::now().timestamp_millis();
    if let Some(accounts) = raw.get_mut("accounts").and_then(|a| a.as_array_mut()) {
        for account in accounts {
            let Some(times) = account
                .get_mut("rateLimitResetTimes")
                .and_then(|v| v.as_object_mut())
            else {
                continue;
            };
            if let Some(gemini) = times.remove("gemini") {
                times.insert("gemini-antigravity".to_string(), gemini);
            }
            times.retain(|_, reset| reset.as_i64().is_some_and(|t| t > now));
        }
    }
    if raw.get("activeIndexByFamily").is_none() {
        let active = raw.get("activeIndex").cloned().unwrap_or(json!(-1));
        raw["activeIndexByFamily"] = json!({"claude": active, "gemini": active});
    }
    raw["version"] = json!(ACCOUNTS_FILE_VERSION);
}
