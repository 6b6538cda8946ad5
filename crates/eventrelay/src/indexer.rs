// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Indexer role: batches the event topic into the search index and redirects failed
//! batches to the dead-letter topic.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument, Span};

use crate::broker::{Producer, Subscription};
use crate::buffer::{BatchBuffer, BufferHandle};
use crate::config::RelayConfig;
use crate::consumer::pump;
use crate::delivery::DeadLetterPolicy;
use crate::errors::{BrokerError, CreationError};
use crate::index::{BulkClient, IndexFlusher};

pub struct Indexer<C, P: ?Sized> {
    buffer: BatchBuffer<IndexFlusher<C>, DeadLetterPolicy<P>>,
    handle: BufferHandle,
    span: Span,
}

impl<C, P> Indexer<C, P>
where
    C: BulkClient + 'static,
    P: Producer + ?Sized + 'static,
{
    pub fn new(
        config: &RelayConfig,
        client: C,
        dead_letters: Arc<P>,
        span: Span,
    ) -> Result<Self, CreationError> {
        let (buffer, handle) = BatchBuffer::new(
            config.buffer.buffer_config(),
            IndexFlusher::new(client, config.index.index.clone()),
            DeadLetterPolicy::new(
                dead_letters,
                config.broker.dead_letter_topic.clone(),
                config.index.index.clone(),
            ),
            span.clone(),
        )?;

        Ok(Self {
            buffer,
            handle,
            span,
        })
    }

    /// Consumes `subscription` until `cancel` fires, then flushes what is left.
    pub async fn run<S: Subscription>(
        self,
        subscription: S,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let Self {
            buffer,
            handle,
            span,
        } = self;

        async move {
            info!("Indexer started");
            let result = pump(buffer, handle, subscription, cancel).await;
            info!("Indexer stopped");
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Record};
    use crate::errors::IndexError;
    use crate::event::Event;
    use crate::index::BulkBody;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct CountingClient {
        documents: Arc<AtomicUsize>,
        down: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BulkClient for CountingClient {
        async fn bulk_write(&self, _index: &str, body: BulkBody) -> Result<(), IndexError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(IndexError::NoAddresses);
            }
            self.documents.fetch_add(body.documents, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.broker.addresses = vec!["memory".to_string()];
        config.buffer.max_count = 2;
        config
    }

    async fn publish_events(broker: &MemoryBroker, topic: &str, count: usize) {
        for i in 0..count {
            let event = Event::new(format!("e{i}"), "default", format!("{i}"));
            broker
                .publish(Record::new(topic, "", event.to_json().expect("encode")))
                .await
                .expect("publish failed");
        }
    }

    async fn run_until_consumed(broker: &Arc<MemoryBroker>, client: CountingClient, count: u64) {
        let config = config();
        let indexer = Indexer::new(&config, client, broker.clone(), Span::none())
            .expect("failed to create indexer");
        let subscription = broker
            .subscribe(&config.broker.topic, &config.broker.indexer_group)
            .await
            .expect("subscribe failed");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(indexer.run(subscription, cancel.clone()));

        while broker
            .committed(&config.broker.topic, &config.broker.indexer_group)
            .await
            < count
        {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await
            .expect("indexer task failed")
            .expect("indexer returned an error");
    }

    #[tokio::test]
    async fn test_indexes_every_event() {
        let broker = Arc::new(MemoryBroker::new());
        publish_events(&broker, "events", 5).await;
        let client = CountingClient::default();

        run_until_consumed(&broker, client.clone(), 5).await;

        assert_eq!(client.documents.load(Ordering::SeqCst), 5);
        assert!(broker.records("events-dead-letter").await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_batches_reach_dead_letter_topic() {
        let broker = Arc::new(MemoryBroker::new());
        publish_events(&broker, "events", 3).await;
        let client = CountingClient::default();
        client.down.store(true, Ordering::SeqCst);

        run_until_consumed(&broker, client, 3).await;

        let dead_letters = broker.records("events-dead-letter").await;
        assert_eq!(dead_letters.len(), 3);
        assert!(dead_letters.iter().all(|r| r.key == "events"));
    }
}
