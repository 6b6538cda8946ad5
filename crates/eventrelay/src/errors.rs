// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use segment_store::StoreError;

/// Errors returned by [`crate::buffer::BufferHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("Buffer is closed")]
    Closed,

    #[error("Buffer was already closed")]
    AlreadyClosed,
}

/// Errors returned when a component cannot be built.
#[derive(Debug, thiserror::Error)]
pub enum CreationError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to open local store: {0}")]
    Store(#[from] StoreError),
}

/// Why a batch could not be handed to its sink.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("Index sink rejected batch: {0}")]
    Index(#[from] IndexError),

    #[error("Failed to write batch to local store: {0}")]
    Store(#[from] StoreError),

    /// Events before `failed_at` were written; the rest of the batch was not.
    #[error("Failed to write event {failed_at} of the batch to local store: {source}")]
    Archive {
        failed_at: usize,
        #[source]
        source: StoreError,
    },

    #[error("Flush did not finish within {0:?}")]
    Timeout(Duration),
}

/// Errors reported by a broker implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker is closed")]
    Closed,

    #[error("Broker is unavailable: {0}")]
    Unavailable(String),

    #[error("Publish did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Failed to publish to topic {topic}: {reason}")]
    Publish { topic: String, reason: String },
}

/// Errors reported by the search-index bulk client.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("No index addresses configured")]
    NoAddresses,

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Bulk request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Bulk request returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Bulk request rejected {failed} of {total} documents")]
    Items { failed: usize, total: usize },

    #[error("Unreadable bulk response from {address}: {reason}")]
    Response { address: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(BufferError::Closed.to_string(), "Buffer is closed");
        assert_eq!(
            BufferError::AlreadyClosed.to_string(),
            "Buffer was already closed"
        );
        assert_eq!(
            FlushError::Timeout(Duration::from_secs(3)).to_string(),
            "Flush did not finish within 3s"
        );
        assert_eq!(
            FlushError::from(IndexError::Items {
                failed: 2,
                total: 5
            })
            .to_string(),
            "Index sink rejected batch: Bulk request rejected 2 of 5 documents"
        );
        assert_eq!(
            IndexError::Response {
                address: "http://search:9200".to_string(),
                reason: "expected value".to_string(),
            }
            .to_string(),
            "Unreadable bulk response from http://search:9200: expected value"
        );
    }

    #[test]
    fn test_store_error_converts_into_flush_error() {
        let error: FlushError = StoreError::InvalidConfig("bad".to_string()).into();
        assert!(matches!(error, FlushError::Store(_)));
    }
}
