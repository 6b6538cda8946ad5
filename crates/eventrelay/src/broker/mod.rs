// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Seams to the message broker.
//!
//! Roles only see [`Producer`] and [`Subscription`]. A subscription belongs to a consumer
//! group and resumes from the group's last acknowledged offset.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::errors::BrokerError;

pub mod memory;
pub mod retry;

pub use memory::{MemoryBroker, MemorySubscription};
pub use retry::RetryingProducer;

/// A keyed payload addressed to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value,
        }
    }
}

/// A record as read back from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: u64,
    pub key: String,
    pub value: Vec<u8>,
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Hands a record to the broker. `Ok` means the broker accepted it.
    async fn publish(&self, record: Record) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message. `None` once the subscription can yield no more.
    async fn next(&mut self) -> Option<Result<Message, BrokerError>>;

    /// Marks `message` and everything before it as processed for this consumer group.
    async fn ack(&mut self, message: &Message) -> Result<(), BrokerError>;
}

/// Partition assignment strategy requested by a consumer group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RebalanceStrategy {
    #[default]
    Sticky,
    RoundRobin,
    Range,
}

impl RebalanceStrategy {
    /// Matches case-insensitively; anything unrecognised falls back to sticky.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "sticky" => Self::Sticky,
            "roundrobin" | "round-robin" | "round_robin" => Self::RoundRobin,
            "range" => Self::Range,
            other => {
                warn!("Unknown rebalance strategy '{other}', using sticky");
                Self::Sticky
            }
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sticky => "sticky",
            Self::RoundRobin => "roundrobin",
            Self::Range => "range",
        }
    }
}

impl fmt::Display for RebalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RebalanceStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}
