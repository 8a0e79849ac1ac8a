use std::sync::Once;

use crate::models::BrokerConfig;

static INIT: Once = Once::new();

/// Install the global tracing subscriber. Idempotent; later calls are no-ops.
///
/// Without `debug`, logs go to stderr at the level selected by `RUST_LOG`
/// (default `info`). With `debug`, everything from this crate at `debug` is
/// also appended to `broker.log` under the configured log directory.
pub fn init_logger(config: &BrokerConfig) {
    let debug = config.debug;
    let log_dir = config
        .log_dir
        .clone()
        .or_else(|| crate::utils::paths::default_log_dir().ok());

    INIT.call_once(move || {
        use tracing_subscriber::{fmt, EnvFilter};

        let default_directive = if debug {
            "info,antigravity_broker=debug"
        } else {
            "info"
        };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));

        if debug {
            if let Some(dir) = log_dir {
                if std::fs::create_dir_all(&dir).is_ok() {
                    let path = dir.join("broker.log");
                    match std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                    {
                        Ok(file) => {
                            let subscriber = fmt()
                                .with_env_filter(filter)
                                .with_ansi(false)
                                .with_writer(std::sync::Mutex::new(file))
                                .finish();
                            let _ = tracing::subscriber::set_global_default(subscriber);
                            return;
                        }
                        Err(e) => {
                            eprintln!("failed_to_open_debug_log {}: {}", path.display(), e);
                        }
                    }
                }
            }
        }

        let subscriber = fmt().with_env_filter(filter).finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
