pub mod accounts_file;

pub use accounts_file::CredentialStore;
