//! Public types for the sync server coordinator.

use crate::sync::MergeOutcome;

/// Server lifecycle state.
///
/// Use [`super::SyncServer::state()`] to check the current state or
/// [`super::SyncServer::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Built, run loop not started
    Created,
    /// Run loop active
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// What routing did with an authenticated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sync-in operation applied
    Merged(MergeOutcome),
    /// Subscribe accepted; `queued` is false when the trigger queue was
    /// full or closed and the next sweep will pick the client up instead
    SyncRequested { queued: bool },
    /// Not a sync channel
    Ignored,
}

impl std::fmt::Display for RouteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Merged(outcome) => write!(f, "Merged({})", outcome.label()),
            Self::SyncRequested { queued } => write!(f, "SyncRequested(queued={})", queued),
            Self::Ignored => write!(f, "Ignored"),
        }
    }
}
