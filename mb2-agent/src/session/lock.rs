//! Advisory sync-lock acquisition.
//!
//! The device exposes `/com.apple.itunes.lock_sync`; holding an exclusive
//! advisory lock on it marks a sync/backup in progress. Contention is
//! expected, so acquisition retries on a fixed interval up to the
//! configured bound. Whoever acquires the lock must release it on every
//! exit path.

use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::delegate::BackupDelegate;
use crate::device::{ConduitError, FileConduit};
use crate::utils::errors::{BackupError, Result};

/// Remote path of the sync lock file.
pub const SYNC_LOCK_PATH: &str = "/com.apple.itunes.lock_sync";

/// An acquired sync lock. Not released on drop; call [`release`].
#[derive(Debug)]
pub struct SyncLock {
    handle: u64,
}

/// Acquire the sync lock, retrying on contention.
///
/// The cancellation flag is polled before every attempt, so a waiting
/// session reacts within one retry interval.
pub async fn acquire<C, D>(
    conduit: &mut C,
    delegate: &D,
    config: &SessionConfig,
) -> Result<SyncLock>
where
    C: FileConduit,
    D: BackupDelegate,
{
    for attempt in 1..=config.lock_attempts {
        if delegate.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        match try_acquire(conduit).await {
            Ok(handle) => {
                debug!(attempt, "sync lock acquired");
                return Ok(SyncLock { handle });
            }
            Err(ConduitError::Locked) => {
                debug!(attempt, "sync lock busy");
            }
            Err(err) => {
                warn!(attempt, %err, "sync lock attempt failed");
            }
        }

        if attempt < config.lock_attempts {
            tokio::time::sleep(config.lock_retry_interval()).await;
        }
    }

    Err(BackupError::SyncLockContended)
}

async fn try_acquire<C: FileConduit>(conduit: &mut C) -> std::result::Result<u64, ConduitError> {
    let handle = conduit.open_rw(SYNC_LOCK_PATH).await?;
    if let Err(err) = conduit.lock_exclusive(handle).await {
        let _ = conduit.close(handle).await;
        return Err(err);
    }
    Ok(handle)
}

/// Release and close the lock. Best effort: the session outcome is already
/// decided when this runs.
pub async fn release<C: FileConduit>(conduit: &mut C, lock: SyncLock) {
    if let Err(err) = conduit.unlock(lock.handle).await {
        warn!(%err, "sync lock unlock failed");
    }
    if let Err(err) = conduit.close(lock.handle).await {
        warn!(%err, "sync lock close failed");
    }
}
