// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector role: turns cluster watch notifications into broker records.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument, Span};

use crate::broker::{Producer, Record};
use crate::event::Event;

/// A change notification from the cluster's event watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(Event),
    Updated { old: Option<Event>, new: Event },
    Deleted(Event),
}

#[derive(Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum WatchType {
    Added,
    Modified,
    Deleted,
}

#[derive(Deserialize)]
struct WatchLine {
    #[serde(rename = "type")]
    watch_type: WatchType,
    object: Event,
}

impl WatchEvent {
    /// Parses one line of a watch stream, `{"type":"ADDED","object":{...}}`.
    ///
    /// Modifications carry no previous object on the wire.
    pub fn from_watch_line(line: &[u8]) -> Result<Self, serde_json::Error> {
        let WatchLine { watch_type, object } = serde_json::from_slice(line)?;
        Ok(match watch_type {
            WatchType::Added => Self::Added(object),
            WatchType::Modified => Self::Updated {
                old: None,
                new: object,
            },
            WatchType::Deleted => Self::Deleted(object),
        })
    }
}

pub struct Collector<P: ?Sized> {
    producer: Arc<P>,
    topic: String,
    span: Span,
}

impl<P: Producer + ?Sized> Collector<P> {
    pub fn new(producer: Arc<P>, topic: impl Into<String>, span: Span) -> Self {
        Self {
            producer,
            topic: topic.into(),
            span,
        }
    }

    /// Publishes added and updated events with an empty key. Deletions are ignored.
    pub async fn handle(&self, watch_event: WatchEvent) {
        match watch_event {
            WatchEvent::Added(event) => self.publish(&event).await,
            WatchEvent::Updated { new, .. } => self.publish(&new).await,
            WatchEvent::Deleted(event) => {
                debug!("Ignoring deletion of {}", event.identity());
            }
        }
    }

    async fn publish(&self, event: &Event) {
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
                return;
            }
        };

        match self
            .producer
            .publish(Record::new(&self.topic, "", value))
            .await
        {
            Ok(()) => debug!(
                "Published {} {} {}: {}",
                event.regarding.kind,
                event.identity(),
                event.reason,
                event.note
            ),
            Err(e) => {
                let id = event.identity();
                error!(
                    name = %id.name,
                    namespace = %id.namespace,
                    uid = %id.uid,
                    "Failed to publish event: {e}"
                );
            }
        }
    }

    /// Handles watch events until the stream ends or `cancel` fires.
    pub async fn run(self, mut rx: mpsc::Receiver<WatchEvent>, cancel: CancellationToken) {
        let span = self.span.clone();
        async move {
            debug!("Collector started, publishing to {}", self.topic);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(watch_event) => self.handle(watch_event).await,
                        None => {
                            debug!("Watch stream ended");
                            break;
                        }
                    },
                }
            }
            debug!("Collector stopped");
        }
        .instrument(span)
        .await;
    }
}
