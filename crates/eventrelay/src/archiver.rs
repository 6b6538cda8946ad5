// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Archiver role: batches the dead-letter topic into the local rotating store.

use segment_store::RotatingStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument, Span};

use crate::archive::StoreFlusher;
use crate::broker::Subscription;
use crate::buffer::{BatchBuffer, BufferHandle};
use crate::config::RelayConfig;
use crate::consumer::pump;
use crate::delivery::ArchiveLossPolicy;
use crate::errors::{BrokerError, CreationError};

pub struct Archiver {
    buffer: BatchBuffer<StoreFlusher, ArchiveLossPolicy>,
    handle: BufferHandle,
    span: Span,
}

impl Archiver {
    /// Opens the store described by `config.store`, resuming after any existing segments.
    pub fn new(config: &RelayConfig, span: Span) -> Result<Self, CreationError> {
        let store = RotatingStore::open(config.store.store_config())?;
        let (buffer, handle) = BatchBuffer::new(
            config.buffer.buffer_config(),
            StoreFlusher::new(store),
            ArchiveLossPolicy,
            span.clone(),
        )?;

        Ok(Self {
            buffer,
            handle,
            span,
        })
    }

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
            info!("Archiver started");
            let result = pump(buffer, handle, subscription, cancel).await;
            info!("Archiver stopped");
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Producer, Record};
    use crate::event::Event;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_archives_dead_letters_to_store() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let mut config = RelayConfig::default();
        config.broker.addresses = vec!["memory".to_string()];
        config.store.path = dir.path().to_path_buf();
        config.store.name = "dlq".to_string();

        let broker = MemoryBroker::new();
        for name in ["a", "b", "c"] {
            let event = Event::new(name, "default", name);
            broker
                .publish(Record::new(
                    &config.broker.dead_letter_topic,
                    "events",
                    event.to_json().expect("encode"),
                ))
                .await
                .expect("publish failed");
        }

        let archiver = Archiver::new(&config, Span::none()).expect("failed to create archiver");
        let subscription = broker
            .subscribe(
                &config.broker.dead_letter_topic,
                &config.broker.archiver_group,
            )
            .await
            .expect("subscribe failed");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(archiver.run(subscription, cancel.clone()));

        while broker
            .lag(
                &config.broker.dead_letter_topic,
                &config.broker.archiver_group,
            )
            .await
            > 0
        {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await
            .expect("archiver task failed")
            .expect("archiver returned an error");

        let contents =
            fs::read_to_string(dir.path().join("dlq_0")).expect("failed to read segment");
        let names: Vec<String> = contents
            .lines()
            .map(|line| {
                Event::from_json(line.as_bytes())
                    .expect("line is not an event")
                    .metadata
                    .name
            })
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unreadable_store_directory() {
        let mut config = RelayConfig::default();
        config.store.path = "/nonexistent/eventrelay/archive".into();

        assert!(matches!(
            Archiver::new(&config, Span::none()),
            Err(CreationError::Store(_))
        ));
    }
}
