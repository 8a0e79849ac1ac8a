pub mod broker;
pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod utils;

use std::sync::Arc;

pub use broker::{
    AccountManager, BrokerResponse, Dispatcher, HostBridge, ProjectResolver, RecoveryHook,
    ResponseBody, SessionErrorEvent, SessionKeyBuilder, SignatureCache,
};
pub use error::{BrokerError, BrokerResult};
pub use models::{BrokerConfig, HeaderStyle, ModelFamily, QuotaKey};
pub use modules::auth::ProactiveRefreshQueue;
pub use modules::persistence::CredentialStore;

/// Wired-up broker: the dispatcher plus the background machinery it leans on.
/// The embedding host constructs one at startup, calls `start`, and routes
/// intercepted fetches through `dispatcher`.
pub struct Broker {
    pub config: BrokerConfig,
    pub manager: Arc<AccountManager>,
    pub cache: Arc<SignatureCache>,
    pub dispatcher: Arc<Dispatcher>,
    pub refresh_queue: Arc<ProactiveRefreshQueue>,
}

impl Broker {
    /// Build the full component graph from a configuration struct. Config
    /// loading itself stays with the host; environment overrides are applied
    /// here.
    pub fn initialize(
        mut config: BrokerConfig,
        toast: Option<broker::ToastFn>,
    ) -> BrokerResult<Self> {
        config.apply_env_overrides();
        utils::logger::init_logger(&config);

        let store = CredentialStore::at_default_location()
            .map_err(BrokerError::ConfigurationMissing)?;
        let mut manager =
            AccountManager::new(store, config.quiet_mode, config.switch_toast_debounce_ms);
        if let Some(toast) = toast {
            manager.set_toast(toast);
        }
        let manager = Arc::new(manager);

        let cache = Arc::new(
            SignatureCache::at_default_location(config.signature_cache.clone())
                .map_err(BrokerError::ConfigurationMissing)?,
        );
        let projects = Arc::new(ProjectResolver::new());
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            manager.clone(),
            projects,
            cache.clone(),
            SessionKeyBuilder::new(),
        ));
        let refresh_queue = Arc::new(ProactiveRefreshQueue::new(
            manager.clone(),
            config.refresh_buffer_seconds,
            config.refresh_check_interval_seconds,
        ));

        Ok(Self {
            config,
            manager,
            cache,
            dispatcher,
            refresh_queue,
        })
    }

    /// Start the background loops. Safe to call more than once.
    pub async fn start(&self) {
        self.cache.start().await;
        if self.config.proactive_token_refresh {
            self.refresh_queue.start().await;
        }
    }

    /// Stop background work and flush pending cache writes.
    pub async fn shutdown(&self) {
        self.refresh_queue.stop().await;
        self.cache.stop().await;
    }
}
