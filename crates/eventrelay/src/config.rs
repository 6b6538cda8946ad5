// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relay configuration.
//!
//! Settings come from an optional YAML file, then from `RELAY_`-prefixed environment
//! variables. Nested keys are separated by a double underscore, so
//! `RELAY_BROKER__ADDRESSES=kafka-1:9092,kafka-2:9092` overrides `broker.addresses`.
//! Address lists accept either a YAML sequence or a comma-separated string.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{error, info};

use crate::broker::RebalanceStrategy;
use crate::buffer::{BufferConfig, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_COUNT, DEFAULT_QUEUE_CAPACITY};
use segment_store::{StoreConfig, DEFAULT_MAX_FILE_COUNT, DEFAULT_MAX_FILE_SIZE};

pub const ENV_PREFIX: &str = "RELAY_";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub log_level: String,
    pub broker: BrokerSettings,
    pub index: IndexSettings,
    pub store: StoreSettings,
    pub buffer: BufferSettings,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            broker: BrokerSettings::default(),
            index: IndexSettings::default(),
            store: StoreSettings::default(),
            buffer: BufferSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    #[serde(deserialize_with = "deserialize_string_or_list")]
    pub addresses: Vec<String>,
    pub topic: String,
    pub dead_letter_topic: String,
    pub indexer_group: String,
    pub archiver_group: String,
    /// Partition assignment across group members. Parsed and logged only: the in-process
    /// broker has a single partition per topic and nothing to rebalance.
    pub rebalance_strategy: RebalanceStrategy,
    pub producer: ProducerSettings,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            topic: "events".to_string(),
            dead_letter_topic: "events-dead-letter".to_string(),
            indexer_group: "eventrelay-indexer".to_string(),
            archiver_group: "eventrelay-archiver".to_string(),
            rebalance_strategy: RebalanceStrategy::default(),
            producer: ProducerSettings::default(),
        }
    }
}

/// Publish tuning. Timeout and retries are applied by
/// [`crate::broker::RetryingProducer`].
///
/// The `flush_*` thresholds are validated and logged but have no effect on the in-process
/// [`crate::broker::MemoryBroker`], which publishes every record immediately. They are
/// meant for a broker client that batches on its own.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    pub timeout_ms: u64,
    pub retry_max: u32,
    pub retry_backoff_ms: u64,
    pub flush_max_messages: usize,
    pub flush_frequency_ms: u64,
    pub flush_max_bytes: usize,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            retry_max: 5,
            retry_backoff_ms: 100,
            flush_max_messages: 1000,
            flush_frequency_ms: 500,
            flush_max_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    #[serde(deserialize_with = "deserialize_string_or_list")]
    pub addresses: Vec<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub username: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub password: Option<String>,
    pub index: String,
    pub timeout_secs: u64,
    pub tls_skip_verify: bool,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            addresses: vec!["http://localhost:9200".to_string()],
            username: None,
            password: None,
            index: "events".to_string(),
            timeout_secs: 10,
            tls_skip_verify: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: PathBuf,
    pub name: String,
    pub max_file_size: u64,
    pub max_file_count: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/eventrelay"),
            name: "events".to_string(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_file_count: DEFAULT_MAX_FILE_COUNT,
        }
    }
}

impl StoreSettings {
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.name.clone(), self.path.clone())
            .with_max_file_size(self.max_file_size)
            .with_max_file_count(self.max_file_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    pub max_count: usize,
    pub flush_interval_ms: u64,
    /// `null` for an unbounded submission queue.
    pub queue_capacity: Option<usize>,
    /// `null` to wait for the final flush indefinitely.
    pub shutdown_timeout_secs: Option<u64>,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_MAX_COUNT,
            flush_interval_ms: u64::try_from(DEFAULT_FLUSH_INTERVAL.as_millis()).unwrap_or(5000),
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
            shutdown_timeout_secs: Some(30),
        }
    }
}

impl BufferSettings {
    #[must_use]
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            max_count: self.max_count,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            queue_capacity: self.queue_capacity,
            shutdown_timeout: self.shutdown_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl RelayConfig {
    /// Reads `path` (a missing file is treated as empty), applies environment overrides
    /// and validates the result.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.addresses.is_empty() {
            return Err(ConfigError::Missing("broker.addresses"));
        }
        if self.broker.topic.is_empty() {
            return Err(ConfigError::Missing("broker.topic"));
        }
        if self.broker.dead_letter_topic.is_empty() {
            return Err(ConfigError::Missing("broker.dead_letter_topic"));
        }
        if self.broker.dead_letter_topic == self.broker.topic {
            return Err(ConfigError::Invalid {
                field: "broker.dead_letter_topic",
                reason: "must differ from broker.topic".to_string(),
            });
        }
        if self.broker.indexer_group.is_empty() {
            return Err(ConfigError::Missing("broker.indexer_group"));
        }
        if self.broker.archiver_group.is_empty() {
            return Err(ConfigError::Missing("broker.archiver_group"));
        }
        if self.broker.indexer_group == self.broker.archiver_group {
            return Err(ConfigError::Invalid {
                field: "broker.archiver_group",
                reason: "must differ from broker.indexer_group".to_string(),
            });
        }
        let producer = &self.broker.producer;
        if producer.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "broker.producer.timeout_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if producer.flush_max_messages == 0
            || producer.flush_frequency_ms == 0
            || producer.flush_max_bytes == 0
        {
            return Err(ConfigError::Invalid {
                field: "broker.producer",
                reason: "flush thresholds must be greater than 0".to_string(),
            });
        }
        if self.index.addresses.is_empty() {
            return Err(ConfigError::Missing("index.addresses"));
        }
        if self.index.index.is_empty() {
            return Err(ConfigError::Missing("index.index"));
        }
        if self.store.name.is_empty() {
            return Err(ConfigError::Missing("store.name"));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("store.path"));
        }
        self.store
            .store_config()
            .validate()
            .map_err(|e| ConfigError::Invalid {
                field: "store",
                reason: e.to_string(),
            })?;
        self.buffer
            .buffer_config()
            .validate()
            .map_err(|e| ConfigError::Invalid {
                field: "buffer",
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Logs the effective settings, with credentials redacted.
    pub fn log_summary(&self) {
        info!(
            "Broker {:?}, topic {}, dead-letter topic {}, groups {}/{}, rebalance {}",
            self.broker.addresses,
            self.broker.topic,
            self.broker.dead_letter_topic,
            self.broker.indexer_group,
            self.broker.archiver_group,
            self.broker.rebalance_strategy,
        );
        info!(
            "Producer timeout {}ms, {} retries every {}ms, flush at {} messages / {}ms / {} bytes",
            self.broker.producer.timeout_ms,
            self.broker.producer.retry_max,
            self.broker.producer.retry_backoff_ms,
            self.broker.producer.flush_max_messages,
            self.broker.producer.flush_frequency_ms,
            self.broker.producer.flush_max_bytes,
        );
        info!(
            "Index {:?} -> {}, user {}, password {}, tls verify {}",
            self.index.addresses,
            self.index.index,
            self.index.username.as_deref().unwrap_or("<none>"),
            if self.index.password.is_some() {
                "<redacted>"
            } else {
                "<none>"
            },
            !self.index.tls_skip_verify,
        );
        info!(
            "Store {}/{}_N, {} bytes x {} segments",
            self.store.path.display(),
            self.store.name,
            self.store.max_file_size,
            self.store.max_file_count,
        );
        info!(
            "Buffer flushes at {} events or every {}ms",
            self.buffer.max_count, self.buffer.flush_interval_ms,
        );
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    String(String),
    List(Vec<String>),
}

pub fn deserialize_string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = match StringOrList::deserialize(deserializer)? {
        StringOrList::String(s) => s.split(',').map(str::to_string).collect(),
        StringOrList::List(list) => list,
    };
    Ok(items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect())
}

pub fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Null => Ok(None),
        _ => {
            error!("Failed to parse value, expected a string or an integer, ignoring");
            Ok(None)
        }
    }
}
