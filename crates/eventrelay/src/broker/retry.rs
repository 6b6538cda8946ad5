// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Producer, Record};
use crate::config::ProducerSettings;
use crate::errors::BrokerError;

/// Wraps a [`Producer`] with a per-attempt timeout and a fixed backoff between retries.
///
/// A closed broker is never retried.
pub struct RetryingProducer<P> {
    inner: P,
    timeout: Duration,
    retry_max: u32,
    backoff: Duration,
}

impl<P: Producer> RetryingProducer<P> {
    pub fn new(inner: P, settings: &ProducerSettings) -> Self {
        Self {
            inner,
            timeout: Duration::from_millis(settings.timeout_ms),
            retry_max: settings.retry_max,
            backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: Producer> Producer for RetryingProducer<P> {
    async fn publish(&self, record: Record) -> Result<(), BrokerError> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = tokio::time::timeout(self.timeout, self.inner.publish(record.clone()))
                .await
                .unwrap_or_else(|_| Err(BrokerError::Timeout(self.timeout)));

            match result {
                Ok(()) => return Ok(()),
                Err(BrokerError::Closed) => return Err(BrokerError::Closed),
                Err(e) if attempts > self.retry_max => {
                    debug!(
                        "Giving up on {} after {attempts} attempts: {e}",
                        record.topic
                    );
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        "Publish to {} failed on attempt {attempts}, retrying: {e}",
                        record.topic
                    );
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}
