pub mod backend;
pub mod error;
pub mod snapshot;

pub use error::{Result, SnapstoreError};
