//! Consul KV adapter.
//!
//! Issues recursive blocking queries against `/v1/kv/{prefix}` and reads the
//! subtree's change index from the `X-Consul-Index` response header.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use super::KvEntry;
use super::KvStore;
use super::ListResponse;
use crate::StoreError;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Connection settings for [`ConsulStore`]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConsulStoreConfig {
    /// Base URL of the agent, e.g. `http://127.0.0.1:8500`
    #[serde(default = "default_address")]
    pub address: String,

    /// ACL token sent with every request
    #[serde(default)]
    pub token: Option<String>,

    /// Datacenter to query; the agent's own when unset
    #[serde(default)]
    pub datacenter: Option<String>,

    /// Maximum time Consul may hold a blocking query (unit: milliseconds)
    #[serde(default = "default_wait_time_ms")]
    pub wait_time_ms: u64,
}

impl Default for ConsulStoreConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            token: None,
            datacenter: None,
            wait_time_ms: default_wait_time_ms(),
        }
    }
}

fn default_address() -> String {
    "http://127.0.0.1:8500".to_string()
}
fn default_wait_time_ms() -> u64 {
    300_000
}

/// Wire format of one element of a recursive KV read
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulKvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

/// [`KvStore`] backed by the Consul HTTP API
#[derive(Debug, Clone)]
pub struct ConsulStore {
    client: Client,
    config: ConsulStoreConfig,
}

impl ConsulStore {
    pub fn new(config: ConsulStoreConfig) -> std::result::Result<Self, StoreError> {
        let client = Client::builder()
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    /// Reuse an existing HTTP client (connection pool, proxies, TLS roots).
    pub fn with_client(
        client: Client,
        config: ConsulStoreConfig,
    ) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ConsulStoreConfig {
        &self.config
    }

    fn wait_time(&self) -> Duration {
        Duration::from_millis(self.config.wait_time_ms)
    }

    /// Consul adds up to wait/16 of jitter to a blocking query; leave room
    /// for that plus network latency before giving up client-side.
    fn request_timeout(&self) -> Duration {
        let wait = self.wait_time();
        wait + wait / 16 + Duration::from_secs(5)
    }

    fn url(
        &self,
        prefix: &str,
    ) -> String {
        format!("{}/v1/kv/{}", self.config.address.trim_end_matches('/'), prefix)
    }
}

fn decode_pairs(
    pairs: Vec<ConsulKvPair>
) -> std::result::Result<Vec<KvEntry>, StoreError> {
    let mut entries = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let entry = match pair.value {
            Some(encoded) => {
                let value = STANDARD.decode(encoded.as_bytes()).map_err(|e| {
                    StoreError::InvalidResponse(format!("value of '{}' is not base64: {}", pair.key, e))
                })?;
                KvEntry {
                    is_dir: false,
                    key: pair.key,
                    value,
                }
            }
            None if pair.key.ends_with('/') => KvEntry::dir(pair.key),
            None => KvEntry::leaf(pair.key, b""),
        };
        entries.push(entry);
    }
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
}

#[async_trait]
impl KvStore for ConsulStore {
    async fn list(
        &self,
        prefix: &str,
        wait_index: u64,
    ) -> std::result::Result<ListResponse, StoreError> {
        let mut query: Vec<(&str, String)> = vec![("recurse", "true".to_string())];
        if wait_index > 0 {
            query.push(("index", wait_index.to_string()));
            query.push(("wait", format!("{}ms", self.config.wait_time_ms)));
        }
        if let Some(dc) = &self.config.datacenter {
            query.push(("dc", dc.clone()));
        }

        let mut request = self
            .client
            .get(self.url(prefix))
            .query(&query)
            .timeout(self.request_timeout());
        if let Some(token) = &self.config.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await.map_err(|e| {
            warn!("consul list request failed: {}", e);
            StoreError::Transport(e.to_string())
        })?;

        let status = response.status();
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        debug!(prefix, wait_index, ?index, %status, "consul list response");

        match status {
            StatusCode::NOT_FOUND => {
                let index = index.ok_or_else(|| StoreError::InvalidResponse(format!("missing {} header", INDEX_HEADER)))?;
                Ok(ListResponse {
                    entries: Vec::new(),
                    index,
                })
            }
            s if s.is_success() => {
                let index = index.ok_or_else(|| StoreError::InvalidResponse(format!("missing {} header", INDEX_HEADER)))?;
                let pairs: Vec<ConsulKvPair> = response
                    .json()
                    .await
                    .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
                Ok(ListResponse {
                    entries: decode_pairs(pairs)?,
                    index,
                })
            }
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::INTERNAL_SERVER_ERROR => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::Unavailable(body))
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::Http {
                    status: s.as_u16(),
                    body,
                })
            }
        }
    }
}
