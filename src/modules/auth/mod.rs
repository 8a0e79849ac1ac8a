pub mod oauth;
pub mod refresh_queue;

pub use oauth::{refresh_access_token, RefreshedToken};
pub use refresh_queue::ProactiveRefreshQueue;
