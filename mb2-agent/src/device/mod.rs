//! Collaborator traits for the device transport layer.
//!
//! Device discovery, the lockdown handshake, and the AFC file primitives
//! are out of scope for this crate; callers provide them by implementing
//! [`DeviceBackend`] and the service traits below. The orchestrator only
//! consumes these as black boxes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::devicelink::channel::DeviceLinkChannel;

/// Preferred transport for reaching the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMethod {
    #[default]
    Usb,
    Network,
    Any,
}

/// Failures while provisioning a device connection or one of its services.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("unable to connect to device")]
    Connection,

    #[error("lockdown handshake failed")]
    Handshake,

    #[error("unable to start service: {0}")]
    ServiceStart(String),
}

/// Failures at the AFC file-conduit level.
#[derive(Error, Debug)]
pub enum ConduitError {
    #[error("remote file not found: {0}")]
    NotFound(String),

    #[error("remote file is locked")]
    Locked,

    #[error("conduit operation failed: {0}")]
    Failed(String),
}

/// Lockdown value reads, scoped by optional domain.
#[allow(async_fn_in_trait)]
pub trait LockdownClient {
    /// Read the value tree for a domain (`None` = device root record).
    async fn get_value(&mut self, domain: Option<&str>) -> Result<plist::Value, ConduitError>;
}

/// Subset of the AFC remote-filesystem service used by a backup session:
/// whole-file reads for manifest construction and the advisory sync lock.
#[allow(async_fn_in_trait)]
pub trait FileConduit {
    /// Read a whole remote file; `Ok(None)` when the file does not exist.
    async fn read_file(&mut self, path: &str) -> Result<Option<Vec<u8>>, ConduitError>;

    /// Open a remote file read-write, returning an opaque handle.
    async fn open_rw(&mut self, path: &str) -> Result<u64, ConduitError>;

    /// Apply an exclusive advisory lock; `ConduitError::Locked` when another
    /// session holds it.
    async fn lock_exclusive(&mut self, handle: u64) -> Result<(), ConduitError>;

    async fn unlock(&mut self, handle: u64) -> Result<(), ConduitError>;

    async fn close(&mut self, handle: u64) -> Result<(), ConduitError>;
}

/// Provisioning interface: connects to a device and starts the services a
/// backup session needs (lockdown, AFC, the escrow-bag backup channel, and
/// the installation-proxy application listing).
#[allow(async_fn_in_trait)]
pub trait DeviceBackend {
    type Device;
    type Lockdown: LockdownClient;
    type Conduit: FileConduit;
    type Channel: DeviceLinkChannel;

    async fn connect(
        &self,
        udid: &str,
        method: ConnectionMethod,
    ) -> Result<Self::Device, BackendError>;

    async fn lockdown_client(&self, device: &Self::Device) -> Result<Self::Lockdown, BackendError>;

    async fn file_conduit(&self, device: &Self::Device) -> Result<Self::Conduit, BackendError>;

    /// Start the backup protocol service (requires the escrow bag).
    async fn backup_channel(&self, device: &Self::Device) -> Result<Self::Channel, BackendError>;

    /// Installed application identifiers mapped to their metadata.
    async fn installed_applications(
        &self,
        device: &Self::Device,
    ) -> Result<plist::Dictionary, BackendError>;
}
