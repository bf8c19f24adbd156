//! Device-driven message loop.
//!
//! After the initial backup request the device takes over: it sends one
//! command at a time and the session answers until the device signals
//! completion. The loop owns termination classification; handlers only
//! fail it by losing the channel.

use plist::Value;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::delegate::{BackupDelegate, Checkpoint};
use crate::devicelink::channel::{ChannelError, DeviceLinkChannel};
use crate::devicelink::{self, message_tag, status_response, DeviceCommand};
use crate::session::handlers;
use crate::utils::errors::{BackupError, Result};

/// Run the message loop until the device terminates the session.
///
/// Cancellation is polled before every receive; a blocking receive is only
/// interrupted by its own timeout, so reaction latency is bounded by the
/// configured receive timeout.
pub async fn run_message_loop<C, D>(
    channel: &mut C,
    root: &Path,
    delegate: &D,
    config: &SessionConfig,
) -> Result<()>
where
    C: DeviceLinkChannel,
    D: BackupDelegate,
{
    loop {
        if delegate.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let message = match channel.receive(config.receive_timeout()).await {
            Ok(message) => message,
            Err(ChannelError::TimedOut) => continue,
            Err(_) => return Err(BackupError::Receive),
        };

        let Some(tag) = message_tag(&message).map(str::to_string) else {
            return Err(BackupError::Receive);
        };
        let Some(command) = DeviceCommand::from_tag(&tag) else {
            warn!(tag, "unknown command from device");
            return Err(BackupError::UnknownCommand(tag));
        };

        debug!(tag, "device command");
        delegate.arrival(Checkpoint::DeviceRequested { command });
        if let Some(progress) = devicelink::extract_progress(&message, command) {
            delegate.progress_update(progress);
        }

        match command {
            DeviceCommand::DownloadFiles => {
                handlers::send_files(channel, root, &message).await?;
            }
            DeviceCommand::UploadFiles => {
                handlers::receive_files(channel, root, &message).await?;
            }
            DeviceCommand::ContentsOfDirectory => {
                handlers::contents_of_directory(channel, root, &message).await?;
            }
            DeviceCommand::CreateDirectory => {
                handlers::create_directory(channel, root, &message).await?;
            }
            DeviceCommand::MoveFiles | DeviceCommand::MoveItems => {
                handlers::move_items(channel, root, &message).await?;
            }
            DeviceCommand::RemoveFiles | DeviceCommand::RemoveItems => {
                handlers::remove_items(channel, root, &message).await?;
            }
            DeviceCommand::CopyItem => {
                handlers::copy_item(channel, root, &message).await?;
            }
            DeviceCommand::GetFreeDiskSpace => {
                handlers::free_disk_space(channel, root).await?;
            }
            DeviceCommand::PurgeDiskSpace => {
                // Valid tag, unsupported operation; the session continues.
                channel
                    .send(status_response(
                        -1,
                        Some("Operation not supported"),
                        Some(Value::Dictionary(plist::Dictionary::new())),
                    ))
                    .await?;
            }
            DeviceCommand::Disconnect => {
                info!("device requested disconnect");
                delegate.arrival(Checkpoint::DisconnectRequested);
                return Ok(());
            }
            DeviceCommand::ProcessMessage => {
                if process_status(&message, delegate)? {
                    return Ok(());
                }
            }
        }
    }
}

/// `DLMessageProcessMessage` handling. Error code 0 ends the session
/// successfully; a non-zero code carries a device-reported error. A body
/// without an `ErrorCode` key is not a status at all and the loop keeps
/// waiting. Returns whether the session is finished.
fn process_status<D: BackupDelegate>(message: &Value, delegate: &D) -> Result<bool> {
    let body = message
        .as_array()
        .and_then(|array| array.get(1))
        .and_then(Value::as_dictionary)
        .ok_or_else(|| BackupError::UnknownCommand("DLMessageProcessMessage".into()))?;
    let Some(code) = body.get("ErrorCode").and_then(Value::as_signed_integer) else {
        debug!("process message without an error code, continuing");
        return Ok(false);
    };

    if code == 0 {
        delegate.arrival(Checkpoint::ReceivedSuccessCode);
        return Ok(true);
    }

    let description = body
        .get("ErrorDescription")
        .and_then(Value::as_string)
        .map(str::to_string);
    warn!(code, ?description, "device reported backup failure");
    Err(BackupError::DeviceReported { code, description })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{RecordingDelegate, ScriptedChannel};
    use plist::Dictionary;

    fn disconnect() -> Value {
        Value::Array(vec![Value::String("DLMessageDisconnect".into())])
    }

    fn process_result(code: i64, description: Option<&str>) -> Value {
        let mut body = Dictionary::new();
        body.insert("ErrorCode".into(), Value::Integer(code.into()));
        if let Some(description) = description {
            body.insert(
                "ErrorDescription".into(),
                Value::String(description.into()),
            );
        }
        Value::Array(vec![
            Value::String("DLMessageProcessMessage".into()),
            Value::Dictionary(body),
        ])
    }

    fn fixture() -> (RecordingDelegate, SessionConfig, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let delegate = RecordingDelegate::new(root.path().to_path_buf());
        (delegate, SessionConfig::default(), root)
    }

    #[tokio::test]
    async fn download_then_success_code_completes_the_session() {
        let (delegate, config, root) = fixture();
        std::fs::write(root.path().join("Status.plist"), b"ok").unwrap();

        let mut channel = ScriptedChannel::default();
        channel.push_message(Value::Array(vec![
            Value::String("DLMessageDownloadFiles".into()),
            Value::Array(vec![Value::String("Status.plist".into())]),
            Value::Dictionary(Dictionary::new()),
            Value::Real(0.25),
        ]));
        channel.push_message(process_result(0, None));

        run_message_loop(&mut channel, root.path(), &delegate, &config)
            .await
            .unwrap();

        assert!(delegate.saw_checkpoint(&Checkpoint::DeviceRequested {
            command: DeviceCommand::DownloadFiles
        }));
        assert!(delegate.saw_checkpoint(&Checkpoint::ReceivedSuccessCode));
        assert_eq!(delegate.progress.lock().unwrap().as_slice(), &[0.25]);
        // File bytes plus a closing status went out.
        assert!(!channel.raw_out.is_empty());
        assert_eq!(channel.last_status().unwrap().0, 0);
    }

    #[tokio::test]
    async fn device_error_code_terminates_with_code_and_description() {
        let (delegate, config, root) = fixture();
        let mut channel = ScriptedChannel::default();
        channel.push_message(process_result(1, Some("Disk full")));

        let err = run_message_loop(&mut channel, root.path(), &delegate, &config)
            .await
            .unwrap_err();
        match err {
            BackupError::DeviceReported { code, description } => {
                assert_eq!(code, 1);
                assert_eq!(description.as_deref(), Some("Disk full"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn disconnect_is_a_successful_termination() {
        let (delegate, config, root) = fixture();
        let mut channel = ScriptedChannel::default();
        channel.push_message(disconnect());

        run_message_loop(&mut channel, root.path(), &delegate, &config)
            .await
            .unwrap();
        assert!(delegate.saw_checkpoint(&Checkpoint::DisconnectRequested));
    }

    #[tokio::test]
    async fn timeouts_retry_until_a_message_arrives() {
        let (delegate, config, root) = fixture();
        let mut channel = ScriptedChannel::default();
        channel.push_timeout();
        channel.push_timeout();
        channel.push_message(disconnect());

        run_message_loop(&mut channel, root.path(), &delegate, &config)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_wins_over_a_pending_timeout() {
        let (delegate, config, root) = fixture();
        delegate.cancel();
        let mut channel = ScriptedChannel::default();
        channel.push_message(disconnect());

        let err = run_message_loop(&mut channel, root.path(), &delegate, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
        assert!(channel.sent.is_empty());
    }

    #[tokio::test]
    async fn unknown_tags_are_fatal() {
        let (delegate, config, root) = fixture();
        let mut channel = ScriptedChannel::default();
        channel.push_message(Value::Array(vec![Value::String(
            "DLMessageFormatDevice".into(),
        )]));

        let err = run_message_loop(&mut channel, root.path(), &delegate, &config)
            .await
            .unwrap_err();
        match err {
            BackupError::UnknownCommand(tag) => assert_eq!(tag, "DLMessageFormatDevice"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn purge_disk_space_answers_not_supported_and_continues() {
        let (delegate, config, root) = fixture();
        let mut channel = ScriptedChannel::default();
        channel.push_message(Value::Array(vec![Value::String(
            "DLMessagePurgeDiskSpace".into(),
        )]));
        channel.push_message(disconnect());

        run_message_loop(&mut channel, root.path(), &delegate, &config)
            .await
            .unwrap();

        let (code, status1) = channel.last_status().unwrap();
        assert_eq!(code, -1);
        assert_eq!(status1, "Operation not supported");
        assert!(delegate.saw_checkpoint(&Checkpoint::DisconnectRequested));
    }

    #[tokio::test]
    async fn closed_channel_is_a_communication_error() {
        let (delegate, config, root) = fixture();
        let mut channel = ScriptedChannel::default(); // empty script = closed

        let err = run_message_loop(&mut channel, root.path(), &delegate, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Receive));
    }

    #[tokio::test]
    async fn process_message_without_error_code_keeps_the_loop_running() {
        let (delegate, config, root) = fixture();
        let mut channel = ScriptedChannel::default();
        let mut body = Dictionary::new();
        body.insert(
            "MessageName".into(),
            Value::String("BackupMessageTypeChanged".into()),
        );
        channel.push_message(Value::Array(vec![
            Value::String("DLMessageProcessMessage".into()),
            Value::Dictionary(body),
        ]));
        channel.push_message(disconnect());

        run_message_loop(&mut channel, root.path(), &delegate, &config)
            .await
            .unwrap();

        assert!(delegate.saw_checkpoint(&Checkpoint::DisconnectRequested));
        assert!(!delegate.saw_checkpoint(&Checkpoint::ReceivedSuccessCode));
        assert_eq!(delegate.failure_count(), 0);
    }

    #[tokio::test]
    async fn undecodable_process_message_is_an_unknown_command() {
        let (delegate, config, root) = fixture();
        let mut channel = ScriptedChannel::default();
        channel.push_message(Value::Array(vec![
            Value::String("DLMessageProcessMessage".into()),
            Value::String("not a dictionary".into()),
        ]));

        let err = run_message_loop(&mut channel, root.path(), &delegate, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::UnknownCommand(_)));
    }
}
