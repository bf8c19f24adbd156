//! Custom error types for the backup session.
//!
//! `BackupError` is the closed taxonomy delivered to the delegate. Each
//! session reports at most one terminal error, except a device-reported
//! error code, which may be followed by a second notification carrying the
//! device's textual description.

use thiserror::Error;

use crate::device::BackendError;
use crate::devicelink::channel::ChannelError;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("unable to connect to device")]
    Connection,

    #[error("lockdown handshake failed")]
    Handshake,

    #[error("unable to start service: {0}")]
    ServiceStart(String),

    #[error("backup root is not usable: {0}")]
    Filesystem(String),

    #[error("sync lock held by another session")]
    SyncLockContended,

    #[error("device record unreadable")]
    DeviceRecord,

    #[error("installed application listing unreadable")]
    ApplicationListing,

    #[error("unable to send initial backup request")]
    InitialRequest,

    #[error("unable to receive command from device")]
    Receive,

    #[error("received unknown command: {0}")]
    UnknownCommand(String),

    #[error("device reported error code {code}")]
    DeviceReported {
        code: i64,
        description: Option<String>,
    },

    #[error("device error description: {0}")]
    DeviceErrorDescription(String),

    #[error("backup cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ChannelError> for BackupError {
    fn from(_err: ChannelError) -> Self {
        // Any channel-level failure surfaces as a communication failure;
        // timeouts are classified by the message loop before reaching here.
        BackupError::Receive
    }
}

impl From<BackendError> for BackupError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Connection => BackupError::Connection,
            BackendError::Handshake => BackupError::Handshake,
            BackendError::ServiceStart(name) => BackupError::ServiceStart(name),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
