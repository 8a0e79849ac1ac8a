pub mod account;
pub mod config;

pub use account::{
    Account, AccountRecord, AccountsFile, FamilyIndexes, HeaderStyle, ModelFamily, QuotaKey,
    SwitchReason,
};
pub use config::{BrokerConfig, SignatureCacheConfig};
