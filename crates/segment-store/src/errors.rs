// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors returned by [`crate::RotatingStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to list segment directory {path}: {source}")]
    DirectoryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write segment {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
