pub mod cache;
pub mod config;
pub mod error;
pub mod identity;
pub mod io;
pub mod locator;
pub mod paths;
pub mod policy;
pub mod provider;
pub mod reconcile;
pub mod report;
pub mod types;

pub use error::{OpsError, Result};
