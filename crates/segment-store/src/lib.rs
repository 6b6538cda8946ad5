// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Last-resort local persistence: a directory of size and count bounded segment files.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod errors;
pub mod store;
pub mod suffix;

pub use errors::StoreError;
pub use store::{RotatingStore, StoreConfig, DEFAULT_MAX_FILE_COUNT, DEFAULT_MAX_FILE_SIZE};
