// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared consume loop of the indexer and archiver roles.
//!
//! Messages are decoded into events and submitted to the role's buffer. A message is
//! acknowledged once its event has been handed to the buffer, not once the batch holding
//! it has been flushed. Messages that do not decode are logged, acknowledged and skipped.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::Subscription;
use crate::buffer::{BatchBuffer, BufferHandle};
use crate::errors::BrokerError;
use crate::event::Event;
use crate::flusher::{BatchFlusher, FlushFailureHandler};

/// Feeds `buffer` from `subscription` until cancelled, the subscription ends or the
/// buffer closes. A broker error stops the loop and is returned.
pub async fn consume<S>(
    subscription: &mut S,
    buffer: &BufferHandle,
    cancel: &CancellationToken,
) -> Result<(), BrokerError>
where
    S: Subscription + ?Sized,
{
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            next = subscription.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                error!("Failed to consume: {e}");
                return Err(e);
            }
            None => {
                debug!("Subscription ended");
                return Ok(());
            }
        };

        match Event::from_json(&message.value) {
            Ok(event) => {
                let submitted = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(()),
                    submitted = buffer.submit(event) => submitted,
                };
                if let Err(e) = submitted {
                    warn!(
                        "Stopping at {}@{} without acknowledging it: {e}",
                        message.topic, message.offset
                    );
                    return Ok(());
                }
            }
            Err(e) => {
                error!(
                    "Dropping undecodable message {}@{}: {e}",
                    message.topic, message.offset
                );
            }
        }

        if let Err(e) = subscription.ack(&message).await {
            warn!(
                "Failed to acknowledge {}@{}: {e}",
                message.topic, message.offset
            );
        }
    }
}

/// Runs `buffer` in its own task and feeds it with [`consume`].
///
/// `handle` must be the buffer's only handle. Dropping it once consumption stops lets the
/// run loop drain everything already submitted before its final flush, so acknowledged
/// events are not left behind in the queue.
pub async fn pump<F, H, S>(
    buffer: BatchBuffer<F, H>,
    handle: BufferHandle,
    mut subscription: S,
    cancel: CancellationToken,
) -> Result<(), BrokerError>
where
    F: BatchFlusher + 'static,
    H: FlushFailureHandler + 'static,
    S: Subscription,
{
    let buffer_task = tokio::spawn(buffer.run());

    let result = consume(&mut subscription, &handle, &cancel).await;

    drop(handle);
    if let Err(e) = buffer_task.await {
        error!("Buffer task failed: {e}");
    }
    result
}
