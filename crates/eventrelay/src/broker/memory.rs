// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process broker used by the bundled agent and the tests.
//!
//! Every topic is a single append-only partition kept in memory. Offsets acknowledged by a
//! consumer group survive the subscription, so a new subscription for the same group
//! resumes where the last one stopped. Nothing survives the process.
//!
//! Records are released once every group that has subscribed to the topic acknowledged
//! them. Until the first group subscribes, a topic keeps everything published to it. A
//! group that subscribes after records were released starts at the oldest retained offset.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::{Message, Producer, Record, Subscription};
use crate::errors::BrokerError;

#[derive(Default)]
struct Topic {
    /// Offset of the first retained record
    base: u64,
    records: VecDeque<Record>,
    groups: HashSet<String>,
}

impl Topic {
    fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&Record> {
        let index = usize::try_from(offset.checked_sub(self.base)?).ok()?;
        self.records.get(index)
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Topic>,
    committed: HashMap<(String, String), u64>,
    outage: Option<String>,
    closed: bool,
}

impl State {
    fn committed(&self, topic: &str, group: &str) -> u64 {
        self.committed
            .get(&(topic.to_string(), group.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Drops the records of `topic` that every subscribed group has acknowledged.
    fn release(&mut self, topic: &str) {
        let Some(log) = self.topics.get(topic) else {
            return;
        };
        let Some(low) = log
            .groups
            .iter()
            .map(|group| self.committed(topic, group))
            .min()
        else {
            return;
        };

        if let Some(log) = self.topics.get_mut(topic) {
            let mut released = 0;
            while log.base < low && log.records.pop_front().is_some() {
                log.base += 1;
                released += 1;
            }
            if released > 0 {
                debug!(
                    "Released {released} records of {topic}, oldest retained offset {}",
                    log.base
                );
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<MemorySubscription, BrokerError> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let committed = state.committed(topic, group);
        let log = state.topics.entry(topic.to_string()).or_default();
        log.groups.insert(group.to_string());
        let position = committed.max(log.base);
        debug!("Group {group} subscribed to {topic} at offset {position}");

        Ok(MemorySubscription {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            position,
        })
    }

    /// Records of `topic` still held in memory, oldest first.
    pub async fn records(&self, topic: &str) -> Vec<Record> {
        let state = self.inner.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|log| log.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn committed(&self, topic: &str, group: &str) -> u64 {
        self.inner.state.lock().await.committed(topic, group)
    }

    /// Number of retained records in `topic` that `group` has not acknowledged yet.
    pub async fn lag(&self, topic: &str, group: &str) -> u64 {
        let state = self.inner.state.lock().await;
        let Some(log) = state.topics.get(topic) else {
            return 0;
        };
        log.end()
            .saturating_sub(state.committed(topic, group).max(log.base))
    }

    /// Makes every publish fail with [`BrokerError::Unavailable`] until cleared with `None`.
    pub async fn set_outage(&self, reason: Option<String>) {
        self.inner.state.lock().await.outage = reason;
    }

    /// Rejects further publishes and ends every open subscription.
    pub async fn close(&self) {
        self.inner.state.lock().await.closed = true;
        self.inner.notify.notify_waiters();
        debug!("Memory broker closed");
    }
}

#[async_trait]
impl Producer for MemoryBroker {
    async fn publish(&self, record: Record) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if let Some(reason) = &state.outage {
                return Err(BrokerError::Unavailable(reason.clone()));
            }
            state
                .topics
                .entry(record.topic.clone())
                .or_default()
                .records
                .push_back(record);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

pub struct MemorySubscription {
    broker: MemoryBroker,
    topic: String,
    group: String,
    position: u64,
}

impl MemorySubscription {
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Result<Message, BrokerError>> {
        loop {
            // Register before checking so a publish in between is not missed
            let notified = self.broker.inner.notify.notified();
            {
                let state = self.broker.inner.state.lock().await;
                if state.closed {
                    return None;
                }
                let log = state.topics.get(&self.topic);
                if let Some(log) = log {
                    // Another subscription of the group may have acknowledged past us
                    self.position = self.position.max(log.base);
                }
                if let Some(record) = log.and_then(|log| log.get(self.position)) {
                    let message = Message {
                        topic: record.topic.clone(),
                        partition: 0,
                        offset: self.position,
                        key: record.key.clone(),
                        value: record.value.clone(),
                    };
                    self.position += 1;
                    return Some(Ok(message));
                }
            }
            notified.await;
        }
    }

    async fn ack(&mut self, message: &Message) -> Result<(), BrokerError> {
        let mut state = self.broker.inner.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let committed = state
            .committed
            .entry((self.topic.clone(), self.group.clone()))
            .or_insert(0);
        *committed = (*committed).max(message.offset + 1);
        state.release(&self.topic);
        Ok(())
    }
}
