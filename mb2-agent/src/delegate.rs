//! Caller-facing delegate interface.
//!
//! The orchestrator reports progress through this trait and polls it for
//! cancellation. All calls are synchronous; the delegate outlives the
//! session and is responsible for its own thread safety.

use std::path::PathBuf;

use crate::devicelink::DeviceCommand;
use crate::utils::errors::BackupError;

/// Ordered lifecycle milestones emitted during a session.
///
/// Consumers may rely on the relative order of checkpoints but not on
/// their timing. `BackendCompleted` is emitted exactly once per session,
/// success or failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Checkpoint {
    ConnectionInitialized,
    ServiceInitialized,
    ProtocolNegotiated { version: String },
    BackupKindDecided { full: bool },
    SyncLockAcquired,
    ManifestBuilt,
    AwaitingAuthentication,
    DeviceRequested { command: DeviceCommand },
    ReceivedSuccessCode,
    DisconnectRequested,
    BackendCompleted,
}

/// Capability set implemented by the caller of a backup session.
pub trait BackupDelegate {
    /// Polled at well-defined points; an in-flight blocking receive is only
    /// interrupted by its own timeout.
    fn is_cancelled(&self) -> bool {
        false
    }

    /// Local directory the backup is mirrored into.
    fn backup_root(&self) -> PathBuf;

    /// Extra key/value pairs merged into the manifest. Keys colliding with
    /// reserved manifest keys are a programming error.
    fn manifest_extra_info(&self) -> Option<plist::Dictionary> {
        None
    }

    /// Whether to request a full (rather than incremental) backup.
    fn force_full_backup(&self) -> bool {
        false
    }

    fn arrival(&self, _checkpoint: Checkpoint) {}

    /// Terminal error notification. A device-reported error code may be
    /// followed by one more call carrying the textual description.
    fn failure(&self, _error: &BackupError) {}

    /// Device-reported progress in [0, 1]; not locally validated.
    fn progress_update(&self, _progress: f64) {}
}
