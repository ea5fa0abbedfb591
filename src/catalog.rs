//! Catalog access: the paginated fetch boundary and a CKAN datastore client

use crate::{NormalizedRequest, PackagerError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

/// One record as returned by the catalog.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Page {
    Rows(Vec<Row>),
    EndOfData,
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Fetch at most `limit` rows starting at `offset`.
    async fn fetch_page(
        &self,
        request: &NormalizedRequest,
        offset: u64,
        limit: usize,
    ) -> Result<Page, PackagerError>;
}

/// Fetch every row of a request, `page_size` rows at a time.
///
/// Stops at the first empty or short page, or once the request's own row
/// limit is reached. Any page error aborts the whole fetch.
pub async fn fetch_all(
    client: &dyn CatalogClient,
    request: &NormalizedRequest,
    page_size: usize,
) -> Result<Vec<Row>, PackagerError> {
    let mut rows = Vec::new();
    let mut offset = 0u64;

    loop {
        let wanted = match request.limit {
            Some(limit) => {
                let remaining = limit.saturating_sub(rows.len() as u64);
                if remaining == 0 {
                    break;
                }
                page_size.min(remaining.min(usize::MAX as u64) as usize)
            }
            None => page_size,
        };

        let page = match client.fetch_page(request, offset, wanted).await? {
            Page::EndOfData => break,
            Page::Rows(page) if page.is_empty() => break,
            Page::Rows(page) => page,
        };

        let received = page.len();
        debug!(
            "Fetched {} rows of {} at offset {}",
            received, request.resource_id, offset
        );
        rows.extend(page);
        offset += received as u64;

        if received < wanted {
            break;
        }
    }

    if let Some(limit) = request.limit {
        rows.truncate(limit.min(usize::MAX as u64) as usize);
    }

    Ok(rows)
}

#[derive(Debug, Deserialize)]
struct DatastoreResponse {
    success: bool,
    #[serde(default)]
    result: Option<DatastoreResult>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DatastoreResult {
    #[serde(default)]
    records: Vec<Row>,
}

/// Client for CKAN's `datastore_search` action.
pub struct CkanClient {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl CkanClient {
    pub fn new(timeout: Duration, api_key: Option<String>) -> Result<Self, PackagerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("resource-packager/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PackagerError::Configuration(format!("HTTP client: {e}")))?;

        Ok(Self { http, api_key })
    }

    pub fn search_url(ckan_host: &str) -> String {
        format!("{}/api/3/action/datastore_search", ckan_host.trim_end_matches('/'))
    }

    fn search_body(request: &NormalizedRequest, offset: u64, limit: usize) -> Value {
        let mut body = json!({
            "resource_id": request.resource_id,
            "offset": offset,
            "limit": limit,
        });
        if !request.filters.is_empty() {
            body["filters"] = json!(request.filters);
        }
        if let Some(q) = &request.q {
            body["q"] = json!(q);
        }
        body
    }

    fn search_request(
        &self,
        request: &NormalizedRequest,
        offset: u64,
        limit: usize,
    ) -> reqwest::RequestBuilder {
        let call = self
            .http
            .post(Self::search_url(&request.ckan_host))
            .json(&Self::search_body(request, offset, limit));
        match &self.api_key {
            Some(key) => call.header("Authorization", key),
            None => call,
        }
    }
}

#[async_trait]
impl CatalogClient for CkanClient {
    async fn fetch_page(
        &self,
        request: &NormalizedRequest,
        offset: u64,
        limit: usize,
    ) -> Result<Page, PackagerError> {
        let response = self
            .search_request(request, offset, limit)
            .send()
            .await?
            .error_for_status()?;
        let parsed: DatastoreResponse = response.json().await?;

        if !parsed.success {
            return Err(PackagerError::FetchFailure(format!(
                "datastore_search failed: {}",
                parsed.error.unwrap_or(Value::Null)
            )));
        }

        let records = parsed.result.map(|r| r.records).unwrap_or_default();
        if records.is_empty() {
            Ok(Page::EndOfData)
        } else {
            Ok(Page::Rows(records))
        }
    }
}
