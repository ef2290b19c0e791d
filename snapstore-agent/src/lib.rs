pub mod backend;
pub mod config;
pub mod credentials;
pub mod snapstore;
pub mod uploader;

pub use backend::{from_config, new_snapstore};
pub use config::{Provider, SnapstoreConfig};
pub use snapstore::SnapStore;
