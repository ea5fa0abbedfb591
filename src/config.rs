//! Configuration management with serde serialization/deserialization
//!
//! The configuration is loaded once at startup, validated, and then shared
//! read-only (`Arc<Config>`) by every component of the packager.

use crate::PackagerError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the packager
///
/// Every field has a default, so a configuration file only needs to name
/// the options it changes.
///
/// # Examples
///
/// ```rust
/// use resource_packager::Config;
///
/// let config = Config {
///     workers: 4,
///     requests_per_worker: 50,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Address the front door binds to (default: 0.0.0.0)
    pub host: String,

    /// Port the front door listens on (default: 8765)
    pub port: u16,

    /// Shared secret checked by the front door before a request is accepted
    pub secret: String,

    /// Number of worker slots; each slot runs one job at a time (default: 1)
    pub workers: usize,

    /// Jobs a worker slot processes before it is retired and replaced (default: 1000)
    pub requests_per_worker: usize,

    /// Jobs that may wait for a free worker before submissions are rejected (default: 100)
    pub queue_capacity: usize,

    /// Directory holding published archives
    pub store_directory: PathBuf,

    /// Directory used for in-progress builds
    pub temp_directory: PathBuf,

    /// Seconds a published archive is served from the cache (default: 7 days, minimum 1)
    pub cache_time: u64,

    /// Seconds between two eviction sweeps of the store (default: 600)
    pub eviction_interval: u64,

    /// Upper bound in seconds on fetching, merging and archiving one job (default: 3600)
    pub job_timeout: u64,

    /// Rows requested from the catalog per page (default: 5000)
    ///
    /// CKAN times requests out at 60s, so stay comfortably below that.
    pub page_size: usize,

    /// API key sent as the `Authorization` header of catalog requests,
    /// needed for private resources
    pub ckan_api_key: Option<String>,

    /// Archive command; `{input}` and `{output}` are replaced by file paths
    pub zip_command: String,

    /// Extension of published archive files (default: zip)
    pub archive_extension: String,

    /// Message returned to the requester when a request is accepted
    pub success_message: String,

    /// Email templates. Placeholders: `{resource_id}`, `{zip_file_name}`, `{ckan_host}`
    pub email_subject: String,
    pub email_from: String,
    pub email_body: String,

    /// Failure email templates; `{error}` is available in addition
    pub failure_subject: String,
    pub failure_body: String,

    pub smtp_host: String,
    pub smtp_login: Option<String>,
    pub smtp_password: Option<String>,

    /// Command the rendered email is piped to; when unset, emails are only logged
    pub mail_command: Option<String>,

    /// Darwin Core extension definitions whose terms are kept as columns
    pub dwc_extension_paths: Vec<PathBuf>,

    /// Term that collects every non-core field as a JSON object
    pub dwc_dynamic_term: String,

    /// Field carrying the record identifier
    pub dwc_id_field: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            secret: String::new(),
            workers: 1,
            requests_per_worker: 1000,
            queue_capacity: 100,
            store_directory: PathBuf::from("/var/www/ckan-resources/resources"),
            temp_directory: PathBuf::from("/tmp"),
            cache_time: 60 * 60 * 24 * 7,
            eviction_interval: 600,
            job_timeout: 3600,
            page_size: 5000,
            ckan_api_key: None,
            zip_command: "/usr/bin/zip -j {output} {input}".to_string(),
            archive_extension: "zip".to_string(),
            success_message: "The resource will be emailed to you shortly. This make take a little longer if our servers are busy, so please be patient!".to_string(),
            email_subject: "Resource from {ckan_host}".to_string(),
            email_from: "(nobody)".to_string(),
            email_body: "Hello,\n\nThe link to the resource you requested on {ckan_host} is available at:\nhttp://ckan-data.nhm.ac.uk/resources/{zip_file_name}\n\nBest Wishes,\nThe Data Portal Bot\n".to_string(),
            failure_subject: "Resource request failed on {ckan_host}".to_string(),
            failure_body: "Hello,\n\nWe were unable to prepare the resource {resource_id} you requested on {ckan_host}:\n{error}\n\nBest Wishes,\nThe Data Portal Bot\n".to_string(),
            smtp_host: "mailserver.nhm.ac.uk".to_string(),
            smtp_login: None,
            smtp_password: None,
            mail_command: None,
            dwc_extension_paths: vec![PathBuf::from(
                "/usr/lib/ckan/ckanpackager/src/ckanpackager/deployment/gbif_dwca_extensions/core/dwc_occurrence.xml",
            )],
            dwc_dynamic_term: "dynamicProperties".to_string(),
            dwc_id_field: "_id".to_string(),
        }
    }
}

impl Config {
    /// Cache lifetime; never shorter than one second.
    pub fn cache_time(&self) -> Duration {
        Duration::from_secs(self.cache_time.max(1))
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval.max(1))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout)
    }

    /// Check the options that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<(), PackagerError> {
        if self.workers == 0 {
            return Err(PackagerError::Configuration(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.requests_per_worker == 0 {
            return Err(PackagerError::Configuration(
                "requests_per_worker must be greater than 0".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(PackagerError::Configuration(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.page_size == 0 {
            return Err(PackagerError::Configuration(
                "page_size must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout == 0 {
            return Err(PackagerError::Configuration(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        if !self.zip_command.contains("{input}") || !self.zip_command.contains("{output}") {
            return Err(PackagerError::Configuration(
                "zip_command must contain both {input} and {output}".to_string(),
            ));
        }

        if shlex::split(&self.zip_command).map_or(true, |parts| parts.is_empty()) {
            return Err(PackagerError::Configuration(format!(
                "zip_command cannot be tokenized: {}",
                self.zip_command
            )));
        }

        if self.archive_extension.is_empty()
            || !self
                .archive_extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.')
        {
            return Err(PackagerError::Configuration(format!(
                "invalid archive_extension: {:?}",
                self.archive_extension
            )));
        }

        if self.dwc_dynamic_term.trim().is_empty() || self.dwc_id_field.trim().is_empty() {
            return Err(PackagerError::Configuration(
                "dwc_dynamic_term and dwc_id_field must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
