use once_cell::sync::Lazy;
use reqwest::Client;

use crate::constants::{DISCOVERY_TIMEOUT_SECS, OAUTH_TIMEOUT_SECS, REGISTRY_TIMEOUT_SECS};

#[cfg(not(any(feature = "tls-native", feature = "tls-rustls")))]
compile_error!("one TLS backend feature must be enabled: `tls-native` or `tls-rustls`");

/// Client for OAuth token exchanges.
pub static OAUTH_CLIENT: Lazy<Client> = Lazy::new(|| create_base_client(OAUTH_TIMEOUT_SECS));
/// Client for project discovery and onboarding.
pub static DISCOVERY_CLIENT: Lazy<Client> =
    Lazy::new(|| create_base_client(DISCOVERY_TIMEOUT_SECS));
/// Short-timeout client for registry/version style probes.
pub static REGISTRY_CLIENT: Lazy<Client> = Lazy::new(|| create_base_client(REGISTRY_TIMEOUT_SECS));
/// Client for generative requests. No total timeout: streams can run long;
/// only connection establishment is bounded.
pub static GENERATION_CLIENT: Lazy<Client> = Lazy::new(|| {
    apply_tls_backend(Client::builder())
        .connect_timeout(std::time::Duration::from_secs(15))
        .build()
        .unwrap_or_else(|_| Client::new())
});

fn apply_tls_backend(builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
    #[cfg(feature = "tls-rustls")]
    {
        return builder.use_rustls_tls();
    }
    #[cfg(not(feature = "tls-rustls"))]
    {
        builder
    }
}

fn create_base_client(timeout_secs: u64) -> Client {
    apply_tls_backend(Client::builder())
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub fn oauth_client() -> Client {
    OAUTH_CLIENT.clone()
}

pub fn discovery_client() -> Client {
    DISCOVERY_CLIENT.clone()
}

pub fn registry_client() -> Client {
    REGISTRY_CLIENT.clone()
}

pub fn generation_client() -> Client {
    GENERATION_CLIENT.clone()
}
