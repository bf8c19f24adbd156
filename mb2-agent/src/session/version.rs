//! Protocol version negotiation.
//!
//! First exchange on a fresh backup channel: offer the supported protocol
//! versions in a `Hello` message and read back the device's pick. Nothing
//! else may be sent before this completes.

use plist::{Dictionary, Value};
use tracing::debug;

use crate::config::SessionConfig;
use crate::devicelink::channel::DeviceLinkChannel;
use crate::devicelink::{self, message_tag};
use crate::utils::errors::{BackupError, Result};

/// Run the Hello exchange, returning the version the device selected.
pub async fn negotiate<C>(channel: &mut C, config: &SessionConfig) -> Result<f64>
where
    C: DeviceLinkChannel,
{
    let mut options = Dictionary::new();
    options.insert(
        "SupportedProtocolVersions".into(),
        Value::Array(
            config
                .supported_versions
                .iter()
                .map(|v| Value::Real(*v))
                .collect(),
        ),
    );
    channel
        .send(devicelink::process_message("Hello", Some(options)))
        .await
        .map_err(|_| BackupError::Handshake)?;

    let reply = channel
        .receive(config.receive_timeout())
        .await
        .map_err(|_| BackupError::Handshake)?;
    if message_tag(&reply) != Some("DLMessageProcessMessage") {
        return Err(BackupError::Handshake);
    }
    let body = reply
        .as_array()
        .and_then(|array| array.get(1))
        .and_then(Value::as_dictionary)
        .ok_or(BackupError::Handshake)?;

    if body.get("MessageName").and_then(Value::as_string) != Some("Response") {
        return Err(BackupError::Handshake);
    }
    match body.get("ErrorCode").and_then(Value::as_signed_integer) {
        Some(0) => {}
        _ => return Err(BackupError::Handshake),
    }
    let version = body
        .get("ProtocolVersion")
        .and_then(Value::as_real)
        .ok_or(BackupError::Handshake)?;
    // The device must pick from the offered set.
    if !config.supported_versions.contains(&version) {
        return Err(BackupError::Handshake);
    }

    debug!(version, "protocol negotiated");
    Ok(version)
}
