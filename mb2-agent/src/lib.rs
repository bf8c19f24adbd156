//! MobileBackup2 backup-session orchestrator.
//!
//! Drives one device backup over the MobileBackup2 protocol: version
//! negotiation, sync-lock acquisition, manifest construction, and the
//! DeviceLink message loop that mirrors device commands onto the local
//! backup directory. The device transport itself (usbmuxd, lockdown
//! handshake, AFC primitives) is supplied by the caller through the
//! traits in [`device`].

pub mod config;
pub mod delegate;
pub mod device;
pub mod devicelink;
pub mod manifest;
pub mod session;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use config::SessionConfig;
pub use delegate::{BackupDelegate, Checkpoint};
pub use devicelink::DeviceCommand;
pub use session::SessionController;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
