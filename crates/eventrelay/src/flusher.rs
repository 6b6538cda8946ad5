// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::errors::FlushError;
use crate::event::Event;

/// Hands a completed batch to a sink.
///
/// Called by the buffer's run loop, one batch at a time and in order. An `Err` is passed to
/// the buffer's [`FlushFailureHandler`] together with the whole batch; the buffer never
/// retries on its own.
#[async_trait]
pub trait BatchFlusher: Send {
    async fn flush(&mut self, batch: &[Event]) -> Result<(), FlushError>;
}

/// Decides what happens to a batch whose flush failed.
#[async_trait]
pub trait FlushFailureHandler: Send {
    async fn on_flush_error(&mut self, error: FlushError, batch: Vec<Event>);
}
