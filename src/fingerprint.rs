//! Request normalization and fingerprinting
//!
//! Two requests that would produce the same archive must map to the same
//! [`Fingerprint`]. Parameters are normalized into a [`NormalizedRequest`]
//! (sorted filters, trimmed text, canonical host), serialized to canonical
//! JSON and hashed with SHA-256. The requester email never takes part.

use crate::PackagerError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use url::Url;

/// Output formats a request may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Tsv,
    /// One JSON object per line
    Json,
    /// CSV after the Darwin Core extension merge
    Dwc,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "csv" => Some(Self::Csv),
            "tsv" => Some(Self::Tsv),
            "json" | "jsonl" => Some(Self::Json),
            "dwc" | "dwca" => Some(Self::Dwc),
            _ => None,
        }
    }

    /// Extension of the data file placed inside the archive.
    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::Csv | Self::Dwc => "csv",
            Self::Tsv => "tsv",
            Self::Json => "jsonl",
        }
    }

    pub fn needs_extension_merge(&self) -> bool {
        matches!(self, Self::Dwc)
    }
}

/// A filter is either a single value or a list of accepted values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(String),
    Many(Vec<String>),
}

impl FilterValue {
    fn normalized(&self) -> Vec<String> {
        let mut values: Vec<String> = match self {
            FilterValue::One(value) => vec![value.trim().to_string()],
            FilterValue::Many(values) => values.iter().map(|v| v.trim().to_string()).collect(),
        };
        values.sort();
        values.dedup();
        values
    }
}

/// A packaging request as received from the front door.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParameters {
    pub resource_id: String,

    /// Base URL of the catalog the resource lives on
    pub ckan_host: String,

    #[serde(default)]
    pub filters: HashMap<String, FilterValue>,

    /// Free-text query
    #[serde(default)]
    pub q: Option<String>,

    /// Maximum number of rows to package
    #[serde(default)]
    pub limit: Option<u64>,

    #[serde(default)]
    pub format: String,

    pub email: String,
}

impl Default for RequestParameters {
    fn default() -> Self {
        Self {
            resource_id: String::new(),
            ckan_host: String::new(),
            filters: HashMap::new(),
            q: None,
            limit: None,
            format: "csv".to_string(),
            email: String::new(),
        }
    }
}

impl RequestParameters {
    /// Validate and canonicalize everything that identifies the archive.
    pub fn normalize(&self) -> Result<NormalizedRequest, PackagerError> {
        let resource_id = self.resource_id.trim();
        if resource_id.is_empty() {
            return Err(invalid("resource_id is required"));
        }
        if !resource_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid(format!("malformed resource_id: {resource_id}")));
        }

        let host = Url::parse(self.ckan_host.trim())
            .map_err(|e| invalid(format!("malformed ckan_host {:?}: {e}", self.ckan_host)))?;
        if !matches!(host.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported ckan_host scheme: {}", host.scheme())));
        }
        let ckan_host = host.as_str().trim_end_matches('/').to_string();

        let format = OutputFormat::parse(&self.format)
            .ok_or_else(|| invalid(format!("unknown format: {}", self.format)))?;

        // Keys that only differ by surrounding whitespace name the same
        // filter; their accepted values are merged.
        let mut filters: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in &self.filters {
            let key = key.trim();
            if key.is_empty() {
                return Err(invalid("filter names must not be empty"));
            }
            filters
                .entry(key.to_string())
                .or_default()
                .extend(value.normalized());
        }
        for values in filters.values_mut() {
            values.sort();
            values.dedup();
        }

        let q = self
            .q
            .as_deref()
            .map(|q| q.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|q| !q.is_empty());

        if self.limit == Some(0) {
            return Err(invalid("limit must be greater than 0"));
        }

        validate_email(&self.email)?;

        Ok(NormalizedRequest {
            resource_id: resource_id.to_string(),
            ckan_host,
            filters,
            q,
            limit: self.limit,
            format,
        })
    }
}

/// The address ends up in a mail header, so anything that could start a new
/// header line or a second recipient is refused.
fn validate_email(email: &str) -> Result<(), PackagerError> {
    let email = email.trim();
    if email
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == ',' || c == ';')
    {
        return Err(invalid(format!("malformed email address: {email:?}")));
    }
    match email.split_once('@') {
        Some((user, domain))
            if !user.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            Ok(())
        }
        _ => Err(invalid(format!("malformed email address: {email:?}"))),
    }
}

fn invalid(message: impl Into<String>) -> PackagerError {
    PackagerError::InvalidRequest(message.into())
}

/// Canonical form of a request; the only input to the fingerprint.
///
/// Field order and `BTreeMap` keep the serialized form stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedRequest {
    pub resource_id: String,
    pub ckan_host: String,
    pub filters: BTreeMap<String, Vec<String>>,
    pub q: Option<String>,
    pub limit: Option<u64>,
    pub format: OutputFormat,
}

impl NormalizedRequest {
    pub fn fingerprint(&self) -> Fingerprint {
        // Serializing a struct of strings, maps and integers cannot fail.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        Fingerprint(hex::encode(Sha256::digest(&canonical)))
    }

    /// Host name used in email templates.
    pub fn host_name(&self) -> String {
        Url::parse(&self.ckan_host)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.ckan_host.clone())
    }
}

/// Deterministic identity of an archive request (lowercase hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Accept a fingerprint read back from disk, e.g. an archive file stem.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == 64
            && value
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then(|| Fingerprint(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    pub fn archive_file_name(&self, extension: &str) -> String {
        format!("{}.{}", self.0, extension)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint of a raw request, rejecting malformed input.
pub fn fingerprint(params: &RequestParameters) -> Result<Fingerprint, PackagerError> {
    Ok(params.normalize()?.fingerprint())
}
