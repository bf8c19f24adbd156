//! File-operation handlers for device commands.
//!
//! Each handler mirrors one device command onto the local backup root and
//! answers with a `DLMessageStatusResponse`. Filesystem failures become
//! structured error statuses; only a broken channel aborts the session.
//! Remote-supplied paths are always resolved relative to the backup root,
//! and anything trying to escape it is rejected per item.

use plist::{Dictionary, Value};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::devicelink::channel::DeviceLinkChannel;
use crate::devicelink::{status_response, CODE_ERROR_LOCAL, CODE_FILE_DATA, CODE_SUCCESS};
use crate::utils::errors::{BackupError, Result};

/// Chunk size for streaming file contents to the device.
const FILE_CHUNK_SIZE: usize = 128 * 1024;

/// Overall status code for a batch with per-item failures.
const STATUS_MULTI: i64 = -13;

/// Upper bound on device-supplied path lengths in the file stream; a
/// larger value means a corrupt or hostile frame.
const MAX_REMOTE_NAME: u32 = 4096;

/// Resolve a device-supplied path strictly under the backup root.
///
/// Absolute paths, drive prefixes, and parent components are refused;
/// the reference protocol only ever sends root-relative paths. An empty
/// path is refused too, so no batch operation can target the root itself.
fn confine(root: &Path, remote: &str) -> std::result::Result<PathBuf, String> {
    let mut resolved = root.to_path_buf();
    let mut named = false;
    for component in Path::new(remote).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                named = true;
            }
            Component::CurDir => {}
            _ => return Err(format!("path escapes backup root: {remote}")),
        }
    }
    if !named {
        return Err(format!("empty remote path: {remote:?}"));
    }
    Ok(resolved)
}

/// Map a local I/O failure onto the device-facing error code space.
fn device_error_code(err: &std::io::Error) -> i64 {
    match err.kind() {
        ErrorKind::NotFound => -6,
        ErrorKind::AlreadyExists => -7,
        _ => -1,
    }
}

fn multi_status_entry(errors: &mut Dictionary, path: &str, code: i64, message: String) {
    let mut entry = Dictionary::new();
    entry.insert("DLFileErrorString".into(), Value::String(message));
    entry.insert("DLFileErrorCode".into(), Value::Integer(code.into()));
    errors.insert(path.into(), Value::Dictionary(entry));
}

async fn send_batch_status<C: DeviceLinkChannel>(
    channel: &mut C,
    errors: Dictionary,
) -> Result<()> {
    let response = if errors.is_empty() {
        status_response(0, None, Some(Value::Dictionary(Dictionary::new())))
    } else {
        status_response(
            STATUS_MULTI,
            Some("Multi status"),
            Some(Value::Dictionary(errors)),
        )
    };
    channel.send(response).await?;
    Ok(())
}

fn payload_paths(message: &Value) -> Vec<String> {
    message
        .as_array()
        .and_then(|array| array.get(1))
        .and_then(Value::as_array)
        .map(|paths| {
            paths
                .iter()
                .filter_map(Value::as_string)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn payload_string(message: &Value, index: usize) -> Option<&str> {
    message.as_array()?.get(index)?.as_string()
}

/// `DLMessageDownloadFiles`: stream the requested local files to the device.
///
/// Per file: path length + path, then data blocks, then a success or error
/// block. A zero dword terminates the list. Failures are collected per file
/// and reported in a closing multi-status.
pub async fn send_files<C: DeviceLinkChannel>(
    channel: &mut C,
    root: &Path,
    message: &Value,
) -> Result<()> {
    let mut errors = Dictionary::new();
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];

    for path in payload_paths(message) {
        channel.send_be_u32(path.len() as u32).await?;
        channel.send_raw(path.as_bytes()).await?;

        let opened = match confine(root, &path) {
            Ok(local) => std::fs::File::open(&local)
                .map_err(|err| (device_error_code(&err), err.to_string())),
            Err(reason) => Err((-1, reason)),
        };

        let outcome = match opened {
            Ok(mut file) => stream_file(channel, &mut file, &mut buf).await?,
            Err(failure) => Err(failure),
        };
        if let Err((code, message)) = outcome {
            warn!(path, %message, "download request failed locally");
            channel.send_be_u32(message.len() as u32 + 1).await?;
            channel.send_raw(&[CODE_ERROR_LOCAL]).await?;
            channel.send_raw(message.as_bytes()).await?;
            multi_status_entry(&mut errors, &path, code, message);
        }
    }

    channel.send_be_u32(0).await?;
    send_batch_status(channel, errors).await
}

/// Send one file's contents as data blocks followed by a success block.
/// The inner result carries a per-file failure; files are never read into
/// memory whole.
async fn stream_file<C: DeviceLinkChannel>(
    channel: &mut C,
    file: &mut std::fs::File,
    buf: &mut [u8],
) -> Result<std::result::Result<(), (i64, String)>> {
    use std::io::Read;

    loop {
        match file.read(buf) {
            Ok(0) => break,
            Ok(n) => {
                channel.send_be_u32(n as u32 + 1).await?;
                channel.send_raw(&[CODE_FILE_DATA]).await?;
                channel.send_raw(&buf[..n]).await?;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                return Ok(Err((device_error_code(&err), err.to_string())));
            }
        }
    }
    channel.send_be_u32(1).await?;
    channel.send_raw(&[CODE_SUCCESS]).await?;
    Ok(Ok(()))
}

/// Read a length-prefixed path from the file stream. A length past
/// [`MAX_REMOTE_NAME`] means the stream is corrupt and cannot be resynced.
async fn receive_name<C: DeviceLinkChannel>(channel: &mut C, len: u32) -> Result<String> {
    if len > MAX_REMOTE_NAME {
        warn!(len, "oversize path length in file stream");
        return Err(BackupError::Receive);
    }
    let mut name = vec![0u8; len as usize];
    channel.receive_exact(&mut name).await?;
    Ok(String::from_utf8_lossy(&name).into_owned())
}

/// `DLMessageUploadFiles`: receive files from the device into the root.
pub async fn receive_files<C: DeviceLinkChannel>(
    channel: &mut C,
    root: &Path,
    _message: &Value,
) -> Result<()> {
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];

    loop {
        let device_name_len = channel.receive_be_u32().await?;
        if device_name_len == 0 {
            break;
        }
        let _device_name = receive_name(channel, device_name_len).await?;

        let local_name_len = channel.receive_be_u32().await?;
        if local_name_len == 0 {
            break;
        }
        let local_name = receive_name(channel, local_name_len).await?;

        let mut output = match confine(root, &local_name) {
            Ok(path) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                std::fs::File::create(&path).ok()
            }
            Err(reason) => {
                warn!(path = %local_name, %reason, "upload destination rejected");
                None
            }
        };

        // Consume the file's block stream whether or not the local file
        // opened; the device's framing does not pause for us. Blocks are
        // drained through a fixed buffer, never allocated whole.
        loop {
            let block_len = channel.receive_be_u32().await?;
            if block_len == 0 {
                break;
            }
            let code = channel.receive_code().await?;
            let mut remaining = block_len as usize - 1;

            match code {
                CODE_FILE_DATA => {
                    while remaining > 0 {
                        let take = remaining.min(buf.len());
                        channel.receive_exact(&mut buf[..take]).await?;
                        remaining -= take;
                        if let Some(file) = output.as_mut() {
                            use std::io::Write;
                            if let Err(err) = file.write_all(&buf[..take]) {
                                warn!(path = %local_name, %err, "upload write failed");
                                output = None;
                            }
                        }
                    }
                }
                CODE_SUCCESS => break,
                _ => {
                    let take = remaining.min(MAX_REMOTE_NAME as usize);
                    let mut reported = vec![0u8; take];
                    channel.receive_exact(&mut reported).await?;
                    remaining -= take;
                    while remaining > 0 {
                        let take = remaining.min(buf.len());
                        channel.receive_exact(&mut buf[..take]).await?;
                        remaining -= take;
                    }
                    warn!(
                        path = %local_name,
                        code,
                        message = %String::from_utf8_lossy(&reported),
                        "device reported upload error"
                    );
                    break;
                }
            }
        }
        debug!(path = %local_name, "upload item finished");
    }

    channel
        .send(status_response(
            0,
            None,
            Some(Value::Dictionary(Dictionary::new())),
        ))
        .await?;
    Ok(())
}

/// `DLContentsOfDirectory`: list one directory under the root.
pub async fn contents_of_directory<C: DeviceLinkChannel>(
    channel: &mut C,
    root: &Path,
    message: &Value,
) -> Result<()> {
    let mut listing = Dictionary::new();

    if let Some(path) = payload_string(message, 1) {
        if let Ok(local) = confine(root, path) {
            if let Ok(entries) = std::fs::read_dir(&local) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let mut info = Dictionary::new();
                    match entry.metadata() {
                        Ok(meta) => {
                            let file_type = if meta.is_dir() {
                                "DLFileTypeDirectory"
                            } else if meta.is_file() {
                                "DLFileTypeRegular"
                            } else {
                                "DLFileTypeUnknown"
                            };
                            info.insert("DLFileType".into(), Value::String(file_type.into()));
                            info.insert(
                                "DLFileSize".into(),
                                Value::Integer(meta.len().into()),
                            );
                            if let Ok(modified) = meta.modified() {
                                info.insert(
                                    "DLFileModificationDate".into(),
                                    Value::Date(plist::Date::from(modified)),
                                );
                            }
                        }
                        Err(_) => {
                            info.insert(
                                "DLFileType".into(),
                                Value::String("DLFileTypeUnknown".into()),
                            );
                        }
                    }
                    listing.insert(name, Value::Dictionary(info));
                }
            }
        }
    }

    channel
        .send(status_response(0, None, Some(Value::Dictionary(listing))))
        .await?;
    Ok(())
}

/// `DLMessageCreateDirectory`.
pub async fn create_directory<C: DeviceLinkChannel>(
    channel: &mut C,
    root: &Path,
    message: &Value,
) -> Result<()> {
    let outcome = match payload_string(message, 1) {
        Some(path) => match confine(root, path) {
            Ok(local) => std::fs::create_dir_all(&local)
                .map_err(|err| (device_error_code(&err), err.to_string())),
            Err(reason) => Err((-1, reason)),
        },
        None => Err((-1, "missing directory path".into())),
    };

    let response = match outcome {
        Ok(()) => status_response(0, None, Some(Value::Dictionary(Dictionary::new()))),
        Err((code, message)) => {
            warn!(%message, "create directory failed");
            status_response(
                code,
                Some(&message),
                Some(Value::Dictionary(Dictionary::new())),
            )
        }
    };
    channel.send(response).await?;
    Ok(())
}

/// `DLMessageMoveFiles` / `DLMessageMoveItems`: batch rename with
/// independent per-item outcomes.
pub async fn move_items<C: DeviceLinkChannel>(
    channel: &mut C,
    root: &Path,
    message: &Value,
) -> Result<()> {
    let mut errors = Dictionary::new();

    let moves = message
        .as_array()
        .and_then(|array| array.get(1))
        .and_then(Value::as_dictionary)
        .cloned()
        .unwrap_or_else(Dictionary::new);

    for (source, destination) in &moves {
        let Some(destination) = destination.as_string() else {
            multi_status_entry(&mut errors, source, -1, "malformed destination".into());
            continue;
        };
        let resolved = confine(root, source).and_then(|from| {
            confine(root, destination).map(|to| (from, to))
        });
        let (from, to) = match resolved {
            Ok(pair) => pair,
            Err(reason) => {
                multi_status_entry(&mut errors, source, -1, reason);
                continue;
            }
        };

        // An existing destination is replaced, matching device expectations.
        if let Ok(meta) = std::fs::symlink_metadata(&to) {
            let removal = if meta.is_dir() {
                std::fs::remove_dir_all(&to)
            } else {
                std::fs::remove_file(&to)
            };
            if let Err(err) = removal {
                multi_status_entry(
                    &mut errors,
                    source,
                    device_error_code(&err),
                    err.to_string(),
                );
                continue;
            }
        }
        if let Err(err) = std::fs::rename(&from, &to) {
            multi_status_entry(&mut errors, source, device_error_code(&err), err.to_string());
        }
    }

    send_batch_status(channel, errors).await
}

/// `DLMessageRemoveFiles` / `DLMessageRemoveItems`. A missing item is
/// not an error; the device retries removals freely.
pub async fn remove_items<C: DeviceLinkChannel>(
    channel: &mut C,
    root: &Path,
    message: &Value,
) -> Result<()> {
    let mut errors = Dictionary::new();

    for path in payload_paths(message) {
        let local = match confine(root, &path) {
            Ok(local) => local,
            Err(reason) => {
                multi_status_entry(&mut errors, &path, -1, reason);
                continue;
            }
        };
        let outcome = match std::fs::symlink_metadata(&local) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&local),
            Ok(_) => std::fs::remove_file(&local),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            multi_status_entry(&mut errors, &path, device_error_code(&err), err.to_string());
        }
    }

    send_batch_status(channel, errors).await
}

/// `DLMessageCopyItem`: copy a file or a whole directory tree.
pub async fn copy_item<C: DeviceLinkChannel>(
    channel: &mut C,
    root: &Path,
    message: &Value,
) -> Result<()> {
    let outcome = match (payload_string(message, 1), payload_string(message, 2)) {
        (Some(source), Some(destination)) => {
            match (confine(root, source), confine(root, destination)) {
                (Ok(from), Ok(to)) => copy_recursive(&from, &to)
                    .map_err(|err| (device_error_code(&err), err.to_string())),
                _ => Err((-1, format!("path escapes backup root: {source}"))),
            }
        }
        _ => Err((-1, "malformed copy request".into())),
    };

    let response = match outcome {
        Ok(()) => status_response(0, None, Some(Value::Dictionary(Dictionary::new()))),
        Err((code, message)) => {
            warn!(%message, "copy item failed");
            status_response(
                code,
                Some(&message),
                Some(Value::Dictionary(Dictionary::new())),
            )
        }
    };
    channel.send(response).await?;
    Ok(())
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(from)?;
    if meta.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
    }
    Ok(())
}

/// `DLMessageGetFreeDiskSpace`: available bytes on the filesystem hosting
/// the backup root.
pub async fn free_disk_space<C: DeviceLinkChannel>(
    channel: &mut C,
    root: &Path,
) -> Result<()> {
    let response = match available_bytes(root) {
        Some(free) => status_response(0, None, Some(Value::Integer(free.into()))),
        None => status_response(-1, None, Some(Value::Integer(0.into()))),
    };
    channel.send(response).await?;
    Ok(())
}

#[cfg(unix)]
fn available_bytes(root: &Path) -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(root).ok()?;
    Some(stat.fragment_size() as u64 * stat.blocks_available() as u64)
}

#[cfg(not(unix))]
fn available_bytes(_root: &Path) -> Option<u64> {
    None
}
