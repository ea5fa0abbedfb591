//! # Resource Packager
//!
//! Packages CKAN datastore resources into downloadable archives and emails
//! the requester a link once the archive is ready.
//!
//! Identical requests are recognised by a fingerprint of their normalized
//! parameters. A fingerprint that was packaged recently is served straight
//! from the archive store; one that is being packaged right now gets the new
//! requester attached to the running build; anything else is queued on a
//! fixed pool of workers. Each worker slot is replaced after a configured
//! number of jobs.
//!
//! ## Pipeline
//!
//! | Stage | Component | Notes |
//! |-------|-----------|-------|
//! | Identify | [`fingerprint`] | SHA-256 of the canonical request |
//! | Cache | [`CacheStore`] | Age-based expiry, atomic publish |
//! | Deduplicate | [`JobLedger`] | One build per fingerprint |
//! | Schedule | [`WorkerPool`] | Bounded queue, slot retirement |
//! | Build | [`JobExecutor`] | Fetch, merge, write, archive, publish |
//! | Notify | [`NotificationDispatcher`] | One email per waiter |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resource_packager::{Collaborators, Config, Metrics, PackagerService, RequestParameters};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let collaborators = Collaborators::from_config(&config)?;
//!     let service = PackagerService::new(config, collaborators, Arc::new(Metrics::new())).await?;
//!
//!     let submission = service.submit(&RequestParameters {
//!         resource_id: "05ff2255-c38a-40c9-b657-4ccb55ab2feb".to_string(),
//!         ckan_host: "https://data.nhm.ac.uk".to_string(),
//!         email: "someone@example.org".to_string(),
//!         ..Default::default()
//!     })?;
//!     println!("{}", submission.message);
//!     submission.wait().await?;
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### Package a batch of requests
//! ```bash
//! resource-packager --config packager.json run --requests requests.jsonl
//! ```
//!
//! ### Inspect a request's fingerprint
//! ```bash
//! resource-packager fingerprint --request request.json
//! ```

/// Configuration and settings for the packager
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Request normalization and fingerprinting
pub mod fingerprint;

/// Published archive store with age-based expiry
pub mod cache_store;

/// In-flight job tracking and request deduplication
pub mod ledger;

/// Worker slots with bounded lifetimes fed from a bounded queue
pub mod worker;

/// End-to-end execution of one packaging job
pub mod executor;

/// Catalog (CKAN datastore) access
pub mod catalog;

/// Darwin Core extension merging
pub mod merge;

/// Data file writers
pub mod output;

/// Archive creation
pub mod archive;

/// Requester notification
pub mod notifier;

/// Service facade tying the components together
pub mod packager;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection and monitoring
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use archive::*;
pub use cache_store::*;
pub use catalog::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use executor::*;
pub use fingerprint::*;
pub use ledger::*;
pub use merge::*;
pub use metrics::*;
pub use notifier::*;
pub use output::*;
pub use packager::*;
pub use utils::*;
pub use worker::*;
