use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Signature-cache tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureCacheConfig {
    pub enabled: bool,
    pub memory_ttl_seconds: u64,
    pub disk_ttl_seconds: u64,
    pub write_interval_seconds: u64,
}

impl Default for SignatureCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_ttl_seconds: 3600,
            disk_ttl_seconds: 172_800,
            write_interval_seconds: 60,
        }
    }
}

/// Full configuration surface. The embedder hands this struct in; file
/// loading stays on its side of the boundary. Environment variables
/// (`ANTIGRAVITY_` + option name, uppercased) override whatever was passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Suppress non-recovery toasts.
    pub quiet_mode: bool,
    /// Write debug logs to a file under `log_dir`.
    pub debug: bool,
    pub log_dir: Option<PathBuf>,
    /// Enable signature caching and thinking-block backfill.
    pub keep_thinking: bool,
    /// Enable the host-error recovery hook.
    pub session_recovery: bool,
    /// Auto-send the continuation prompt after a successful repair.
    pub auto_resume: bool,
    pub resume_text: String,
    pub signature_cache: SignatureCacheConfig,
    pub empty_response_max_attempts: u32,
    pub empty_response_retry_delay_ms: u64,
    /// Enable orphaned tool-call recovery passes.
    pub tool_id_recovery: bool,
    /// Append the anti-hallucination system paragraph and STRICT PARAMETERS
    /// lines to Claude tool definitions.
    pub claude_tool_hardening: bool,
    pub proactive_token_refresh: bool,
    pub refresh_buffer_seconds: u64,
    pub refresh_check_interval_seconds: u64,
    /// Minimum gap between two "switched to account N" toasts for the same
    /// account.
    pub switch_toast_debounce_ms: i64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            quiet_mode: false,
            debug: false,
            log_dir: None,
            keep_thinking: false,
            session_recovery: true,
            auto_resume: true,
            resume_text: "continue".to_string(),
            signature_cache: SignatureCacheConfig::default(),
            empty_response_max_attempts: 4,
            empty_response_retry_delay_ms: 2000,
            tool_id_recovery: true,
            claude_tool_hardening: true,
            proactive_token_refresh: true,
            refresh_buffer_seconds: 1800,
            refresh_check_interval_seconds: 300,
            switch_toast_debounce_ms: 30_000,
        }
    }
}

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_bool(name: &str, slot: &mut bool) {
    if let Ok(raw) = std::env::var(name) {
        match parse_env_bool(&raw) {
            Some(parsed) => *slot = parsed,
            None => tracing::warn!("[Config] ignoring invalid boolean {}={}", name, raw),
        }
    }
}

fn env_u64(name: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse::<u64>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!("[Config] ignoring invalid number {}={}", name, raw),
        }
    }
}

fn env_u32(name: &str, slot: &mut u32) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse::<u32>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!("[Config] ignoring invalid number {}={}", name, raw),
        }
    }
}

impl BrokerConfig {
    /// Apply `ANTIGRAVITY_*` environment overrides on top of file-provided
    /// values. Precedence: env > provided struct > defaults.
    pub fn apply_env_overrides(&mut self) {
        env_bool("ANTIGRAVITY_QUIET_MODE", &mut self.quiet_mode);
        env_bool("ANTIGRAVITY_DEBUG", &mut self.debug);
        if let Ok(dir) = std::env::var("ANTIGRAVITY_LOG_DIR") {
            if !dir.trim().is_empty() {
                self.log_dir = Some(PathBuf::from(dir));
            }
        }
        env_bool("ANTIGRAVITY_KEEP_THINKING", &mut self.keep_thinking);
        env_bool("ANTIGRAVITY_SESSION_RECOVERY", &mut self.session_recovery);
        env_bool("ANTIGRAVITY_AUTO_RESUME", &mut self.auto_resume);
        if let Ok(text) = std::env::var("ANTIGRAVITY_RESUME_TEXT") {
            if !text.trim().is_empty() {
                self.resume_text = text;
            }
        }
        env_bool(
            "ANTIGRAVITY_SIGNATURE_CACHE_ENABLED",
            &mut self.signature_cache.enabled,
        );
        env_u64(
            "ANTIGRAVITY_SIGNATURE_CACHE_MEMORY_TTL_SECONDS",
            &mut self.signature_cache.memory_ttl_seconds,
        );
        env_u64(
            "ANTIGRAVITY_SIGNATURE_CACHE_DISK_TTL_SECONDS",
            &mut self.signature_cache.disk_ttl_seconds,
        );
        env_u64(
            "ANTIGRAVITY_SIGNATURE_CACHE_WRITE_INTERVAL_SECONDS",
            &mut self.signature_cache.write_interval_seconds,
        );
        env_u32(
            "ANTIGRAVITY_EMPTY_RESPONSE_MAX_ATTEMPTS",
            &mut self.empty_response_max_attempts,
        );
        env_u64(
            "ANTIGRAVITY_EMPTY_RESPONSE_RETRY_DELAY_MS",
            &mut self.empty_response_retry_delay_ms,
        );
        env_bool("ANTIGRAVITY_TOOL_ID_RECOVERY", &mut self.tool_id_recovery);
        env_bool(
            "ANTIGRAVITY_CLAUDE_TOOL_HARDENING",
            &mut self.claude_tool_hardening,
        );
        env_bool(
            "ANTIGRAVITY_PROACTIVE_TOKEN_REFRESH",
            &mut self.proactive_token_refresh,
        );
        env_u64(
            "ANTIGRAVITY_PROACTIVE_TOKEN_REFRESH_BUFFER_SECONDS",
            &mut self.refresh_buffer_seconds,
        );
        env_u64(
            "ANTIGRAVITY_PROACTIVE_TOKEN_REFRESH_CHECK_INTERVAL_SECONDS",
            &mut self.refresh_check_interval_seconds,
        );
    }
}
