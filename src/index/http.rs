//! HTTP [`SearchBackend`] for an Elasticsearch-compatible REST API.
//!
//! Uses the document APIs (`_doc`, `_bulk`, `_delete_by_query`, `_search`)
//! with `refresh` on writes so a run's own reads observe them. Network
//! errors, timeouts, 429, and 5xx map to transient write errors; other
//! client errors are rejections.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::SearchConfig;
use crate::error::WriteError;

use super::SearchBackend;

/// Upper bound on records returned by [`SearchBackend::scan`] per request.
const SCAN_PAGE_SIZE: usize = 10_000;

pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    /// Reads the optional API key from `SEARCH_API_KEY`.
    pub fn new(config: &SearchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            api_key: std::env::var("SEARCH_API_KEY").ok(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, format!("{}{}", self.url, path));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("ApiKey {key}"));
        }
        req
    }

    async fn send(
        &self,
        index: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, WriteError> {
        let response = req.send().await.map_err(|e| WriteError::Transient {
            index: index.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(WriteError::Transient {
                index: index.to_string(),
                reason: format!("{status}"),
            });
        }
        if status.as_u16() == 404 {
            return Err(WriteError::MissingIndex {
                index: index.to_string(),
            });
        }
        let body = response.text().await.unwrap_or_default();
        Err(WriteError::Rejected {
            index: index.to_string(),
            reason: format!("{status}: {body}"),
        })
    }
}

#[async_trait]
impl SearchBackend for HttpBackend {
    async fn index_exists(&self, index: &str) -> Result<bool, WriteError> {
        let response = self
            .request(reqwest::Method::HEAD, &format!("/{index}"))
            .send()
            .await
            .map_err(|e| WriteError::Transient {
                index: index.to_string(),
                reason: e.to_string(),
            })?;
        Ok(response.status().is_success())
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>, WriteError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/{index}/_doc/{id}"))
            .send()
            .await
            .map_err(|e| WriteError::Transient {
                index: index.to_string(),
                reason: e.to_string(),
            })?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            return Err(WriteError::Transient {
                index: index.to_string(),
                reason: format!("{status}"),
            });
        }

        let body: Value = response.json().await.map_err(|e| WriteError::Rejected {
            index: index.to_string(),
            reason: format!("unparseable response: {e}"),
        })?;
        Ok(body.get("_source").cloned())
    }

    async fn upsert(&self, index: &str, id: &str, doc: Value) -> Result<(), WriteError> {
        let req = self
            .request(
                reqwest::Method::PUT,
                &format!("/{index}/_doc/{id}?refresh=true"),
            )
            .json(&doc);
        self.send(index, req).await.map(|_| ())
    }

    async fn delete(&self, index: &str, id: &str) -> Result<(), WriteError> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/{index}/_doc/{id}?refresh=true"),
            )
            .send()
            .await
            .map_err(|e| WriteError::Transient {
                index: index.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        // 404 means the record is already gone; deletion is idempotent.
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(WriteError::Transient {
                index: index.to_string(),
                reason: format!("{status}"),
            });
        }
        let body = response.text().await.unwrap_or_default();
        Err(WriteError::Rejected {
            index: index.to_string(),
            reason: format!("{status}: {body}"),
        })
    }

    async fn bulk_insert(
        &self,
        index: &str,
        items: Vec<(String, Value)>,
    ) -> Result<(), WriteError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for (id, doc) in &items {
            body.push_str(&json!({ "index": { "_index": index, "_id": id } }).to_string());
            body.push('\n');
            body.push_str(&doc.to_string());
            body.push('\n');
        }

        let req = self
            .request(reqwest::Method::POST, "/_bulk?refresh=true")
            .header("Content-Type", "application/x-ndjson")
            .body(body);
        let response = self.send(index, req).await?;

        let result: Value = response.json().await.map_err(|e| WriteError::Rejected {
            index: index.to_string(),
            reason: format!("unparseable bulk response: {e}"),
        })?;
        if result.get("errors").and_then(Value::as_bool) == Some(true) {
            return Err(WriteError::Rejected {
                index: index.to_string(),
                reason: "bulk insert reported item errors".to_string(),
            });
        }
        Ok(())
    }

    async fn delete_by_field(
        &self,
        index: &str,
        field: &str,
        value: &str,
    ) -> Result<(), WriteError> {
        let query = json!({ "query": { "term": { field: value } } });
        let req = self
            .request(
                reqwest::Method::POST,
                &format!("/{index}/_delete_by_query?refresh=true"),
            )
            .json(&query);
        self.send(index, req).await.map(|_| ())
    }

    async fn scan(&self, index: &str) -> Result<Vec<(String, Value)>, WriteError> {
        let mut records = Vec::new();
        let mut after: Option<Value> = None;

        // `search_after` pagination keyed on the record id, so indices
        // beyond one page are read in full instead of silently truncated.
        loop {
            let req = self
                .request(reqwest::Method::POST, &format!("/{index}/_search"))
                .json(&scan_query(after.as_ref()));
            let response = self.send(index, req).await?;

            let body: Value = response.json().await.map_err(|e| WriteError::Rejected {
                index: index.to_string(),
                reason: format!("unparseable search response: {e}"),
            })?;

            let hits = body
                .pointer("/hits/hits")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let page_len = hits.len();
            after = hits.last().and_then(|hit| hit.get("sort")).cloned();

            records.extend(hits.into_iter().filter_map(|hit| {
                let id = hit.get("_id")?.as_str()?.to_string();
                let source = hit.get("_source")?.clone();
                Some((id, source))
            }));

            if page_len < SCAN_PAGE_SIZE || after.is_none() {
                break;
            }
        }

        Ok(records)
    }
}

/// One page of the tracking scan, ordered by id so `search_after` can
/// resume where the previous page ended.
fn scan_query(after: Option<&Value>) -> Value {
    let mut query = json!({
        "size": SCAN_PAGE_SIZE,
        "query": { "match_all": {} },
        "sort": [{ "id.keyword": "asc" }],
    });
    if let Some(after) = after {
        query["search_after"] = after.clone();
    }
    query
}
