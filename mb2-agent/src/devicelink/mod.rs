//! DeviceLink message vocabulary for the MobileBackup2 protocol.
//!
//! Wire messages are plist arrays whose first element is a fixed ASCII tag
//! string. This module holds the closed command tag set, the message
//! envelope builders, and opportunistic progress extraction.

pub mod channel;

use plist::{Dictionary, Value};

/// Placeholder the protocol uses for absent status-response parameters.
pub const EMPTY_PARAMETER: &str = "___EmptyParameterString___";

/// Block codes of the raw file-stream sublane.
pub const CODE_SUCCESS: u8 = 0x00;
pub const CODE_ERROR_LOCAL: u8 = 0x06;
pub const CODE_ERROR_REMOTE: u8 = 0x0b;
pub const CODE_FILE_DATA: u8 = 0x0c;

/// Commands a device may send during a backup session.
///
/// The raw tag strings are part of the wire protocol and must match
/// byte-for-byte. Tags outside this set are classified as
/// [`BackupError::UnknownCommand`](crate::BackupError::UnknownCommand),
/// never ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    DownloadFiles,
    UploadFiles,
    GetFreeDiskSpace,
    PurgeDiskSpace,
    CreateDirectory,
    MoveFiles,
    MoveItems,
    RemoveFiles,
    RemoveItems,
    CopyItem,
    Disconnect,
    ProcessMessage,
    ContentsOfDirectory,
}

impl DeviceCommand {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "DLMessageDownloadFiles" => Some(Self::DownloadFiles),
            "DLMessageUploadFiles" => Some(Self::UploadFiles),
            "DLMessageGetFreeDiskSpace" => Some(Self::GetFreeDiskSpace),
            "DLMessagePurgeDiskSpace" => Some(Self::PurgeDiskSpace),
            "DLMessageCreateDirectory" => Some(Self::CreateDirectory),
            "DLMessageMoveFiles" => Some(Self::MoveFiles),
            "DLMessageMoveItems" => Some(Self::MoveItems),
            "DLMessageRemoveFiles" => Some(Self::RemoveFiles),
            "DLMessageRemoveItems" => Some(Self::RemoveItems),
            "DLMessageCopyItem" => Some(Self::CopyItem),
            "DLMessageDisconnect" => Some(Self::Disconnect),
            "DLMessageProcessMessage" => Some(Self::ProcessMessage),
            "DLContentsOfDirectory" => Some(Self::ContentsOfDirectory),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::DownloadFiles => "DLMessageDownloadFiles",
            Self::UploadFiles => "DLMessageUploadFiles",
            Self::GetFreeDiskSpace => "DLMessageGetFreeDiskSpace",
            Self::PurgeDiskSpace => "DLMessagePurgeDiskSpace",
            Self::CreateDirectory => "DLMessageCreateDirectory",
            Self::MoveFiles => "DLMessageMoveFiles",
            Self::MoveItems => "DLMessageMoveItems",
            Self::RemoveFiles => "DLMessageRemoveFiles",
            Self::RemoveItems => "DLMessageRemoveItems",
            Self::CopyItem => "DLMessageCopyItem",
            Self::Disconnect => "DLMessageDisconnect",
            Self::ProcessMessage => "DLMessageProcessMessage",
            Self::ContentsOfDirectory => "DLContentsOfDirectory",
        }
    }
}

/// Wrap a named message in the `DLMessageProcessMessage` envelope.
pub fn process_message(message_name: &str, options: Option<Dictionary>) -> Value {
    let mut dict = Dictionary::new();
    dict.insert("MessageName".into(), Value::String(message_name.into()));
    if let Some(options) = options {
        for (key, value) in options {
            dict.insert(key, value);
        }
    }
    Value::Array(vec![
        Value::String("DLMessageProcessMessage".into()),
        Value::Dictionary(dict),
    ])
}

/// Build a `DLMessageStatusResponse` array.
pub fn status_response(code: i64, status1: Option<&str>, status2: Option<Value>) -> Value {
    Value::Array(vec![
        Value::String("DLMessageStatusResponse".into()),
        Value::Integer(code.into()),
        Value::String(status1.unwrap_or(EMPTY_PARAMETER).into()),
        status2.unwrap_or_else(|| Value::String(EMPTY_PARAMETER.into())),
    ])
}

/// Extract the tag string from a received DeviceLink array.
pub fn message_tag(message: &Value) -> Option<&str> {
    message.as_array()?.first()?.as_string()
}

/// Opportunistically extract a device-reported progress value.
///
/// Download/move/remove carry it as the fourth payload element, upload as
/// the third; only a real-typed element counts. Absence is normal.
pub fn extract_progress(message: &Value, command: DeviceCommand) -> Option<f64> {
    let index = match command {
        DeviceCommand::DownloadFiles
        | DeviceCommand::MoveFiles
        | DeviceCommand::MoveItems
        | DeviceCommand::RemoveFiles
        | DeviceCommand::RemoveItems => 3,
        DeviceCommand::UploadFiles => 2,
        _ => return None,
    };
    match message.as_array()?.get(index)? {
        Value::Real(progress) => Some(*progress),
        _ => None,
    }
}
