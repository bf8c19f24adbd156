//! Backup session orchestration.
//!
//! `SessionController` drives one device backup end to end: provision
//! services through the backend, negotiate the protocol, take the sync
//! lock, write the manifest, send the initial request, then hand control
//! to the device-driven message loop. The delegate observes checkpoints
//! and failures and owns cancellation.

pub mod dispatch;
pub mod handlers;
pub mod lock;
pub mod version;

use plist::{Dictionary, Value};
use std::path::Path;
use tracing::info;

use crate::config::SessionConfig;
use crate::delegate::{BackupDelegate, Checkpoint};
use crate::device::{DeviceBackend, LockdownClient};
use crate::devicelink::{self, channel::DeviceLinkChannel};
use crate::manifest;
use crate::utils::errors::{BackupError, Result};

/// Lockdown domain holding device-side backup settings.
pub const BACKUP_DOMAIN: &str = "com.apple.mobile.backup";

pub struct SessionController<B> {
    backend: B,
    config: SessionConfig,
}

impl<B: DeviceBackend> SessionController<B> {
    pub fn new(backend: B, config: SessionConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run one backup session against the identified device.
    ///
    /// Every terminal error is also delivered through the delegate before
    /// this returns; a device-reported error code produces a second
    /// notification carrying the textual description when present. The
    /// `BackendCompleted` checkpoint fires exactly once, on every path.
    pub async fn run<D: BackupDelegate>(&self, udid: &str, delegate: &D) -> Result<()> {
        info!(udid, "backup session starting");
        let result = self.execute(udid, delegate).await;
        if let Err(err) = &result {
            delegate.failure(err);
            if let BackupError::DeviceReported {
                description: Some(description),
                ..
            } = err
            {
                delegate.failure(&BackupError::DeviceErrorDescription(description.clone()));
            }
        }
        delegate.arrival(Checkpoint::BackendCompleted);
        result
    }

    async fn execute<D: BackupDelegate>(&self, udid: &str, delegate: &D) -> Result<()> {
        if delegate.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let device = self.backend.connect(udid, self.config.connection).await?;
        delegate.arrival(Checkpoint::ConnectionInitialized);

        let mut lockdown = self.backend.lockdown_client(&device).await?;
        let mut conduit = self.backend.file_conduit(&device).await?;
        let mut channel = self.backend.backup_channel(&device).await?;
        delegate.arrival(Checkpoint::ServiceInitialized);

        if delegate.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let version = version::negotiate(&mut channel, &self.config).await?;
        delegate.arrival(Checkpoint::ProtocolNegotiated {
            version: format!("{version:.1}"),
        });

        let root = delegate.backup_root();
        std::fs::create_dir_all(&root)
            .map_err(|err| BackupError::Filesystem(err.to_string()))?;

        let full = delegate.force_full_backup();
        delegate.arrival(Checkpoint::BackupKindDecided { full });

        let sync_lock = lock::acquire(&mut conduit, delegate, &self.config).await?;
        delegate.arrival(Checkpoint::SyncLockAcquired);

        let result = self
            .locked_phase(
                udid,
                delegate,
                &device,
                &mut lockdown,
                &mut conduit,
                &mut channel,
                &root,
                full,
            )
            .await;
        lock::release(&mut conduit, sync_lock).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn locked_phase<D: BackupDelegate>(
        &self,
        udid: &str,
        delegate: &D,
        device: &B::Device,
        lockdown: &mut B::Lockdown,
        conduit: &mut B::Conduit,
        channel: &mut B::Channel,
        root: &Path,
        full: bool,
    ) -> Result<()> {
        let applications = self
            .backend
            .installed_applications(device)
            .await
            .map_err(|_| BackupError::ApplicationListing)?;

        let manifest = manifest::build_manifest(
            lockdown,
            conduit,
            applications,
            delegate.manifest_extra_info(),
        )
        .await?;
        manifest::write_manifest(root, &manifest)?;
        delegate.arrival(Checkpoint::ManifestBuilt);

        let mut request = Dictionary::new();
        request.insert("TargetIdentifier".into(), Value::String(udid.into()));
        request.insert("SourceIdentifier".into(), Value::String(udid.into()));
        if full {
            let mut options = Dictionary::new();
            options.insert("ForceFullBackup".into(), Value::Boolean(true));
            request.insert("Options".into(), Value::Dictionary(options));
        }
        channel
            .send(devicelink::process_message("Backup", Some(request)))
            .await
            .map_err(|_| BackupError::InitialRequest)?;
        delegate.arrival(Checkpoint::AwaitingAuthentication);

        dispatch::run_message_loop(channel, root, delegate, &self.config).await
    }

    /// Read the device's backup settings domain.
    pub async fn read_backup_domain(&self, udid: &str) -> Result<Value> {
        let device = self.backend.connect(udid, self.config.connection).await?;
        let mut lockdown = self.backend.lockdown_client(&device).await?;
        lockdown
            .get_value(Some(BACKUP_DOMAIN))
            .await
            .map_err(|_| BackupError::DeviceRecord)
    }

    /// Whether the device encrypts its backups (`WillEncrypt`).
    pub async fn is_backup_encryption_enabled(&self, udid: &str) -> Result<bool> {
        let domain = self.read_backup_domain(udid).await?;
        Ok(domain
            .as_dictionary()
            .and_then(|dict| dict.get("WillEncrypt"))
            .and_then(Value::as_boolean)
            .unwrap_or(false))
    }

    /// Change (set, rotate, or clear) the device's backup password.
    ///
    /// Runs a short protocol session of its own; the device answers with a
    /// terminal `DLMessageProcessMessage` status.
    pub async fn change_backup_password<D: BackupDelegate>(
        &self,
        udid: &str,
        old_password: Option<&str>,
        new_password: Option<&str>,
        delegate: &D,
    ) -> Result<()> {
        let device = self.backend.connect(udid, self.config.connection).await?;
        let mut channel = self.backend.backup_channel(&device).await?;
        version::negotiate(&mut channel, &self.config).await?;

        let mut options = Dictionary::new();
        options.insert("TargetIdentifier".into(), Value::String(udid.into()));
        if let Some(old_password) = old_password {
            options.insert("OldPassword".into(), Value::String(old_password.into()));
        }
        if let Some(new_password) = new_password {
            options.insert("NewPassword".into(), Value::String(new_password.into()));
        }
        channel
            .send(devicelink::process_message("ChangePassword", Some(options)))
            .await
            .map_err(|_| BackupError::InitialRequest)?;

        dispatch::run_message_loop(&mut channel, &delegate.backup_root(), delegate, &self.config)
            .await
    }
}
