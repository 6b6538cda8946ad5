// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relays cluster events through a broker into a search index, with a dead-letter topic
//! and a local rotating archive behind it.
//!
//! ```text
//!   watch -> Collector -> [events] -> Indexer --ok--> search index
//!                                       |
//!                                     failed
//!                                       v
//!                              [dead-letter] -> Archiver --ok--> rotating store
//!                                                   |
//!                                                 failed -> logged and dropped
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod archive;
pub mod archiver;
pub mod broker;
pub mod buffer;
pub mod collector;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod errors;
pub mod event;
pub mod flusher;
pub mod index;
pub mod indexer;

pub use archiver::Archiver;
pub use buffer::{BatchBuffer, BufferConfig, BufferHandle};
pub use collector::{Collector, WatchEvent};
pub use config::RelayConfig;
pub use event::Event;
pub use indexer::Indexer;
