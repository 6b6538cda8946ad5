// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! What happens to a batch after its flush failed.
//!
//! The indexer redirects failed batches to a dead-letter topic, one record per event keyed
//! by the target index name. The archiver is the end of the chain: a batch it cannot store
//! is logged event by event and dropped. Neither policy retries the original sink.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::broker::{Producer, Record};
use crate::errors::FlushError;
use crate::event::Event;
use crate::flusher::FlushFailureHandler;

pub struct DeadLetterPolicy<P: ?Sized> {
    producer: Arc<P>,
    topic: String,
    index: String,
}

impl<P: Producer + ?Sized> DeadLetterPolicy<P> {
    pub fn new(producer: Arc<P>, topic: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            index: index.into(),
        }
    }
}

#[async_trait]
impl<P: Producer + ?Sized> FlushFailureHandler for DeadLetterPolicy<P> {
    async fn on_flush_error(&mut self, error: FlushError, batch: Vec<Event>) {
        error!(
            "Failed to index {} events into {}, redirecting to {}: {error}",
            batch.len(),
            self.index,
            self.topic
        );

        let mut redirected = 0;
        for event in &batch {
            let value = match event.to_json() {
                Ok(value) => value,
                Err(e) => {
                    let id = event.identity();
                    error!(
                        name = %id.name,
                        namespace = %id.namespace,
                        uid = %id.uid,
                        "Dropping event that failed to serialize: {e}"
                    );
                    continue;
                }
            };

            let id = event.identity();
            match self
                .producer
                .publish(Record::new(&self.topic, &self.index, value))
                .await
            {
                Ok(()) => {
                    redirected += 1;
                    error!(
                        name = %id.name,
                        namespace = %id.namespace,
                        uid = %id.uid,
                        "Redirected event to {}",
                        self.topic
                    );
                }
                Err(e) => {
                    error!(
                        name = %id.name,
                        namespace = %id.namespace,
                        uid = %id.uid,
                        "Lost event, dead-letter publish failed: {e}"
                    );
                }
            }
        }
        debug!("Redirected {redirected} of {} events", batch.len());
    }
}

/// Terminal policy: every event of the failed batch that did not reach the store is logged
/// and dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveLossPolicy;

#[async_trait]
impl FlushFailureHandler for ArchiveLossPolicy {
    async fn on_flush_error(&mut self, error: FlushError, batch: Vec<Event>) {
        let archived = match &error {
            FlushError::Archive { failed_at, .. } => (*failed_at).min(batch.len()),
            _ => 0,
        };
        if archived > 0 {
            info!("Archived {archived} events of the batch before the failure");
        }
        error!(
            "Failed to archive {} events: {error}",
            batch.len() - archived
        );
        for event in &batch[archived..] {
            let id = event.identity();
            error!(
                name = %id.name,
                namespace = %id.namespace,
                uid = %id.uid,
                "Lost event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::errors::IndexError;
    use segment_store::StoreError;
    use tracing_test::traced_test;

    fn failure() -> FlushError {
        IndexError::Items {
            failed: 2,
            total: 2,
        }
        .into()
    }

    #[tokio::test]
    async fn test_dead_letter_redirects_each_event_keyed_by_index() {
        let broker = Arc::new(MemoryBroker::new());
        let mut policy = DeadLetterPolicy::new(broker.clone(), "events-dlq", "k8s-events");
        let batch = vec![
            Event::new("a", "default", "1"),
            Event::new("b", "default", "2"),
        ];

        policy.on_flush_error(failure(), batch.clone()).await;

        let records = broker.records("events-dlq").await;
        assert_eq!(records.len(), 2);
        for (record, event) in records.iter().zip(&batch) {
            assert_eq!(record.key, "k8s-events");
            assert_eq!(
                Event::from_json(&record.value).expect("record is not an event"),
                *event
            );
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dead_letter_publish_failure_is_logged_not_retried() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_outage(Some("brokers down".to_string())).await;
        let mut policy = DeadLetterPolicy::new(broker.clone(), "events-dlq", "k8s-events");

        policy
            .on_flush_error(failure(), vec![Event::new("a", "default", "1")])
            .await;

        broker.set_outage(None).await;
        assert!(broker.records("events-dlq").await.is_empty());
        assert!(logs_contain(
            "Lost event, dead-letter publish failed: Broker is unavailable: brokers down name=a namespace=default uid=1"
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_archive_loss_logs_every_event() {
        let mut policy = ArchiveLossPolicy;

        policy
            .on_flush_error(
                failure(),
                vec![
                    Event::new("a", "default", "1"),
                    Event::new("b", "kube-system", "2"),
                ],
            )
            .await;

        assert!(logs_contain("Failed to archive 2 events"));
        assert!(logs_contain("Lost event name=a namespace=default uid=1"));
        assert!(logs_contain("Lost event name=b namespace=kube-system uid=2"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_archive_loss_skips_events_already_written() {
        let mut policy = ArchiveLossPolicy;
        let error = FlushError::Archive {
            failed_at: 1,
            source: StoreError::InvalidConfig("disk full".to_string()),
        };

        policy
            .on_flush_error(
                error,
                vec![
                    Event::new("a", "default", "1"),
                    Event::new("b", "default", "2"),
                ],
            )
            .await;

        assert!(logs_contain("Archived 1 events of the batch before the failure"));
        assert!(logs_contain("Failed to archive 1 events"));
        assert!(!logs_contain("Lost event name=a"));
        assert!(logs_contain("Lost event name=b namespace=default uid=2"));
    }
}
