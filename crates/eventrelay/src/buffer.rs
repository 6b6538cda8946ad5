// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dual-trigger batching.
//!
//! A [`BatchBuffer`] owns the pending batch and runs as its own task. Producers talk to it
//! through a cloneable [`BufferHandle`]. A batch is handed to the flusher as soon as it
//! holds `max_count` events, or on the next tick of the flush timer when it is not empty.
//! Closing flushes whatever the loop has already appended; events still sitting in the
//! queue at that moment are logged and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument, Span};

use crate::errors::{BufferError, CreationError, FlushError};
use crate::event::Event;
use crate::flusher::{BatchFlusher, FlushFailureHandler};

pub const DEFAULT_MAX_COUNT: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Size trigger. A batch is flushed as soon as it holds this many events.
    pub max_count: usize,
    /// Period of the time trigger.
    pub flush_interval: Duration,
    /// Capacity of the submission queue. `None` means unbounded.
    pub queue_capacity: Option<usize>,
    /// Upper bound on the final flush performed at close. `None` waits indefinitely.
    pub shutdown_timeout: Option<Duration>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_MAX_COUNT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
            shutdown_timeout: None,
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), CreationError> {
        if self.max_count == 0 {
            return Err(CreationError::InvalidConfig(
                "max_count must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(CreationError::InvalidConfig(
                "flush_interval must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(CreationError::InvalidConfig(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
enum EventSender {
    Bounded(mpsc::Sender<Event>),
    Unbounded(mpsc::UnboundedSender<Event>),
}

enum EventReceiver {
    Bounded(mpsc::Receiver<Event>),
    Unbounded(mpsc::UnboundedReceiver<Event>),
}

impl EventReceiver {
    async fn recv(&mut self) -> Option<Event> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }

    fn try_recv(&mut self) -> Option<Event> {
        match self {
            Self::Bounded(rx) => rx.try_recv().ok(),
            Self::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Bounded(rx) => rx.close(),
            Self::Unbounded(rx) => rx.close(),
        }
    }
}

#[derive(Clone)]
pub struct BufferHandle {
    tx: EventSender,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl BufferHandle {
    /// Queues an event for the next batch.
    ///
    /// With a bounded queue this waits for room, which is how a slow sink pushes back on
    /// producers. A submission that is still waiting when the buffer closes returns
    /// [`BufferError::Closed`].
    pub async fn submit(&self, event: Event) -> Result<(), BufferError> {
        if self.is_closed() {
            return Err(BufferError::Closed);
        }

        match &self.tx {
            EventSender::Unbounded(tx) => tx.send(event).map_err(|_| BufferError::Closed),
            EventSender::Bounded(tx) => tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(BufferError::Closed),
                sent = tx.send(event) => sent.map_err(|_| BufferError::Closed),
            },
        }
    }

    /// Stops the buffer. The run loop flushes its current batch and exits.
    ///
    /// Only the first call succeeds; later calls return [`BufferError::AlreadyClosed`].
    pub fn close(&self) -> Result<(), BufferError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BufferError::AlreadyClosed);
        }
        self.cancel.cancel();
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct BatchBuffer<F, H> {
    config: BufferConfig,
    batch: Vec<Event>,
    rx: EventReceiver,
    cancel: CancellationToken,
    flusher: F,
    failure_handler: H,
    span: Span,
}

impl<F, H> BatchBuffer<F, H>
where
    F: BatchFlusher,
    H: FlushFailureHandler,
{
    pub fn new(
        config: BufferConfig,
        flusher: F,
        failure_handler: H,
        span: Span,
    ) -> Result<(Self, BufferHandle), CreationError> {
        config.validate()?;

        let (tx, rx) = match config.queue_capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (EventSender::Bounded(tx), EventReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (EventSender::Unbounded(tx), EventReceiver::Unbounded(rx))
            }
        };
        let cancel = CancellationToken::new();

        let service = Self {
            config,
            batch: Vec::new(),
            rx,
            cancel: cancel.clone(),
            flusher,
            failure_handler,
            span,
        };

        let handle = BufferHandle {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            cancel,
        };

        Ok((service, handle))
    }

    pub async fn run(self) {
        let span = self.span.clone();
        self.run_loop().instrument(span).await;
    }

    async fn run_loop(mut self) {
        debug!("Batch buffer started");

        let period = self.config.flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                _ = ticker.tick() => {
                    if !self.batch.is_empty() {
                        self.flush(None).await;
                    }
                }
                received = self.rx.recv() => match received {
                    Some(event) => {
                        self.batch.push(event);
                        if self.batch.len() >= self.config.max_count {
                            self.flush(None).await;
                        }
                    }
                    None => {
                        debug!("All buffer handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        debug!("Batch buffer stopped");
    }

    async fn flush(&mut self, deadline: Option<Duration>) {
        // Detach before awaiting the sink so the loop always owns a fresh batch
        let batch = std::mem::take(&mut self.batch);
        debug!("Flushing batch of {} events", batch.len());

        let result = match deadline {
            Some(limit) => tokio::time::timeout(limit, self.flusher.flush(&batch))
                .await
                .unwrap_or_else(|_| Err(FlushError::Timeout(limit))),
            None => self.flusher.flush(&batch).await,
        };

        if let Err(error) = result {
            warn!("Failed to flush batch of {} events: {error}", batch.len());
            self.failure_handler.on_flush_error(error, batch).await;
        }
    }

    async fn shutdown(&mut self) {
        debug!("Batch buffer shutting down");
        self.rx.close();

        if !self.batch.is_empty() {
            self.flush(self.config.shutdown_timeout).await;
        }

        let mut abandoned = 0;
        while let Some(event) = self.rx.try_recv() {
            abandoned += 1;
            let id = event.identity();
            error!(
                name = %id.name,
                namespace = %id.namespace,
                uid = %id.uid,
                "Dropping event queued at shutdown"
            );
        }
        if abandoned > 0 {
            warn!("{abandoned} queued events were not flushed before shutdown");
        }
    }
}
