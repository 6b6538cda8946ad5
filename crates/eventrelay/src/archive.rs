// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use segment_store::RotatingStore;
use tracing::{debug, error};

use crate::errors::FlushError;
use crate::event::Event;
use crate::flusher::BatchFlusher;

/// Appends each event of a batch to a [`RotatingStore`] as one JSON line.
///
/// The first failed write aborts the batch with [`FlushError::Archive`], which records how
/// many events of the batch were written before it.
pub struct StoreFlusher {
    store: RotatingStore,
}

impl StoreFlusher {
    pub fn new(store: RotatingStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RotatingStore {
        &self.store
    }
}

#[async_trait]
impl BatchFlusher for StoreFlusher {
    async fn flush(&mut self, batch: &[Event]) -> Result<(), FlushError> {
        let mut line = Vec::new();
        for (position, event) in batch.iter().enumerate() {
            line.clear();
            match serde_json::to_writer(&mut line, event) {
                Ok(()) => line.push(b'\n'),
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
            }
            self.store
                .write(&line)
                .map_err(|source| FlushError::Archive {
                    failed_at: position,
                    source,
                })?;
        }
        self.store.flush()?;

        debug!("Archived {} events", batch.len());
        Ok(())
    }
}
