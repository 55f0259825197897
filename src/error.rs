// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync-level error taxonomy.

use thiserror::Error;

use crate::change::ChangeAction;
use crate::record::RecordError;
use crate::storage::traits::StorageError;
use crate::transport::TransportError;

/// Direction of a record flow, from the server's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server → client
    Outbound,
    /// Client → server
    Inbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Outbound => write!(f, "server-to-client"),
            Self::Inbound => write!(f, "client-to-server"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("no sync schema registered for record type '{0}'")]
    SchemaNotFound(String),

    #[error("No action specified{}", .0.as_deref().map(|a| format!(" (got '{}')", a)).unwrap_or_default())]
    UnknownSyncAction(Option<String>),

    #[error("sync action '{0}' is not supported")]
    UnsupportedAction(ChangeAction),

    #[error("record type '{record_type}' does not sync {direction}")]
    SyncDirectionRejected { record_type: String, direction: Direction },

    #[error("failed to publish {record_type}/{record_id}: {source}")]
    TransportPublish {
        record_type: String,
        record_id: String,
        #[source]
        source: TransportError,
    },

    #[error("malformed sync data: {0}")]
    MergeDataCorruption(#[from] RecordError),

    #[error("message reached routing without an authenticated client")]
    MissingClient,

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailure(_) => "authentication_failure",
            Self::SchemaNotFound(_) => "schema_not_found",
            Self::UnknownSyncAction(_) => "unknown_sync_action",
            Self::UnsupportedAction(_) => "unsupported_action",
            Self::SyncDirectionRejected { .. } => "direction_rejected",
            Self::TransportPublish { .. } => "transport_publish",
            Self::MergeDataCorruption(_) => "merge_data_corruption",
            Self::MissingClient => "missing_client",
            Self::Encode(_) => "encode",
            Self::TaskFailed(_) => "task_failed",
            Self::Storage(_) => "storage",
        }
    }

    /// Whether the next sweep may succeed without operator action.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportPublish { .. } | Self::TaskFailed(_) | Self::Storage(_) | Self::SchemaNotFound(_)
        )
    }
}
