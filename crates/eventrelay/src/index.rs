// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bulk writes into the search index.
//!
//! A batch becomes one newline-delimited bulk request: an action line naming the target
//! index followed by the event document, for every event. The request goes to the first
//! configured address that answers; transport failures and 5xx responses move on to the
//! next address, anything else is final.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::config::IndexSettings;
use crate::errors::{FlushError, IndexError};
use crate::event::Event;
use crate::flusher::BatchFlusher;

const NDJSON: &str = "application/x-ndjson";

/// An encoded bulk request body.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BulkBody {
    pub bytes: Vec<u8>,
    pub documents: usize,
}

/// Encodes `events` as a bulk request targeting `index`, terminated by a blank line.
///
/// Events that fail to serialize are logged and left out; the rest of the batch is kept.
pub fn encode_bulk(index: &str, events: &[Event]) -> BulkBody {
    let action = serde_json::json!({ "index": { "_index": index } }).to_string();
    let mut body = BulkBody::default();

    for event in events {
        match event.to_json() {
            Ok(document) => {
                body.bytes.extend_from_slice(action.as_bytes());
                body.bytes.push(b'\n');
                body.bytes.extend_from_slice(&document);
                body.bytes.push(b'\n');
                body.documents += 1;
            }
            Err(e) => {
                let id = event.identity();
                error!(
                    name = %id.name,
                    namespace = %id.namespace,
                    uid = %id.uid,
                    "INDEX | Dropping event that failed to serialize: {e}"
                );
            }
        }
    }
    if body.documents > 0 {
        body.bytes.push(b'\n');
    }
    body
}

#[async_trait]
pub trait BulkClient: Send + Sync {
    /// Sends one encoded bulk body holding `documents` documents for `index`.
    async fn bulk_write(&self, index: &str, body: BulkBody) -> Result<(), IndexError>;
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

impl BulkResponse {
    fn failed_items(&self) -> usize {
        self.items
            .iter()
            .filter(|item| {
                item.as_object()
                    .and_then(|actions| actions.values().next())
                    .is_some_and(|result| result.get("error").is_some())
            })
            .count()
    }
}

#[derive(Debug)]
pub struct ElasticsearchClient {
    client: reqwest::Client,
    addresses: Vec<String>,
    username: Option<String>,
    password: Option<String>,
    next_address: AtomicUsize,
}

impl ElasticsearchClient {
    pub fn new(settings: &IndexSettings) -> Result<Self, IndexError> {
        let addresses: Vec<String> = settings
            .addresses
            .iter()
            .map(|address| address.trim().trim_end_matches('/').to_string())
            .filter(|address| !address.is_empty())
            .collect();
        if addresses.is_empty() {
            return Err(IndexError::NoAddresses);
        }
        if settings.tls_skip_verify {
            warn!("INDEX | TLS certificate verification is disabled");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .danger_accept_invalid_certs(settings.tls_skip_verify)
            .build()
            .map_err(IndexError::Client)?;

        Ok(Self {
            client,
            addresses,
            username: settings.username.clone().filter(|u| !u.is_empty()),
            password: settings.password.clone(),
            next_address: AtomicUsize::new(0),
        })
    }

    fn request(&self, address: &str, body: Vec<u8>) -> reqwest::RequestBuilder {
        let request = self
            .client
            .post(format!("{address}/_bulk"))
            .header(CONTENT_TYPE, NDJSON)
            .body(body);
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_ref()),
            None => request,
        }
    }
}

#[async_trait]
impl BulkClient for ElasticsearchClient {
    async fn bulk_write(&self, index: &str, body: BulkBody) -> Result<(), IndexError> {
        let count = self.addresses.len();
        let start = self.next_address.fetch_add(1, Ordering::Relaxed) % count;
        let mut last_error = IndexError::NoAddresses;

        for address in self.addresses.iter().cycle().skip(start).take(count) {
            let response = match self.request(address, body.bytes.clone()).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!("INDEX | Bulk request to {address} failed: {e}");
                    last_error = IndexError::Request(e);
                    continue;
                }
            };

            let status = response.status();
            // The request reached a server, so a body that cannot be read is not retried
            // elsewhere
            let text = response.text().await.map_err(IndexError::Request)?;
            if status.is_server_error() {
                warn!("INDEX | {address} answered {status}, trying next address");
                last_error = IndexError::Status { status, body: text };
                continue;
            }
            if !status.is_success() {
                return Err(IndexError::Status { status, body: text });
            }

            let parsed = serde_json::from_str::<BulkResponse>(&text).map_err(|e| {
                IndexError::Response {
                    address: address.clone(),
                    reason: e.to_string(),
                }
            })?;
            if parsed.errors {
                return Err(IndexError::Items {
                    failed: parsed.failed_items(),
                    total: body.documents,
                });
            }

            debug!(
                "INDEX | Indexed {} documents into {index} via {address}",
                body.documents
            );
            return Ok(());
        }

        Err(last_error)
    }
}

/// Flushes batches into one index through a [`BulkClient`].
pub struct IndexFlusher<C> {
    client: C,
    index: String,
}

impl<C: BulkClient> IndexFlusher<C> {
    pub fn new(client: C, index: impl Into<String>) -> Self {
        Self {
            client,
            index: index.into(),
        }
    }
}

#[async_trait]
impl<C: BulkClient> BatchFlusher for IndexFlusher<C> {
    async fn flush(&mut self, batch: &[Event]) -> Result<(), FlushError> {
        let body = encode_bulk(&self.index, batch);
        if body.documents == 0 {
            debug!("INDEX | Nothing to index");
            return Ok(());
        }
        self.client.bulk_write(&self.index, body).await?;
        Ok(())
    }
}
