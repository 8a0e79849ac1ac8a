use std::fs;
use std::path::PathBuf;

/// Resolve the opencode config directory that holds the accounts file and
/// the signature cache. Order: `OPENCODE_CONFIG_DIR` override, then the
/// platform config root (`$XDG_CONFIG_HOME` / `%APPDATA%`), then `~/.config`.
pub fn config_dir() -> Result<PathBuf, String> {
    fn ensure_dir(path: &PathBuf) -> Result<(), String> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(|e| format!("failed_to_create_config_dir: {}", e))?;
        }
        Ok(())
    }

    if let Ok(env_path) = std::env::var("OPENCODE_CONFIG_DIR") {
        if !env_path.trim().is_empty() {
            let dir = PathBuf::from(env_path);
            ensure_dir(&dir)?;
            return Ok(dir);
        }
    }

    if cfg!(test) {
        let dir = std::env::temp_dir().join(format!(".antigravity-test-{}", std::process::id()));
        ensure_dir(&dir)?;
        return Ok(dir);
    }

    if let Some(base) = dirs::config_dir() {
        let dir = base.join("opencode");
        ensure_dir(&dir)?;
        return Ok(dir);
    }

    if let Some(home) = dirs::home_dir() {
        let dir = home.join(".config").join("opencode");
        ensure_dir(&dir)?;
        return Ok(dir);
    }

    Err("no_config_dir_available".to_string())
}

/// Default log directory when the config does not override it.
pub fn default_log_dir() -> Result<PathBuf, String> {
    Ok(config_dir()?.join("antigravity-logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_dir_is_created_and_writable() {
        let dir = config_dir().expect("config dir");
        assert!(dir.exists());
        let probe = dir.join("probe.tmp");
        std::fs::write(&probe, b"ok").expect("write probe");
        let _ = std::fs::remove_file(&probe);
    }

    #[test]
    fn log_dir_lives_under_config_dir() {
        let dir = default_log_dir().expect("log dir");
        assert!(dir.ends_with("antigravity-logs"));
    }
}
