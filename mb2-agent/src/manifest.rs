//! Session manifest (`Info.plist`) construction.
//!
//! The manifest summarizes device identity and installed software and is
//! written once to `<root>/Info.plist` before any transfer request is
//! sent. It is mutated only during construction and discarded afterwards.

use plist::{Dictionary, Value};
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;
use uuid::Uuid;

use crate::device::{FileConduit, LockdownClient};
use crate::utils::errors::{BackupError, Result};

/// Manifest file name under the backup root.
pub const MANIFEST_FILE: &str = "Info.plist";

/// Remote path of the optional iBooks payload.
const IBOOKS_DATA_PATH: &str = "/Books/iBooksData2.plist";

/// Remote directory holding legacy companion-app files.
const ITUNES_FILES_DIR: &str = "/iTunes_Control/iTunes/";

/// Candidate legacy file names; absence of any individual file is normal.
const ITUNES_FILE_CANDIDATES: [&str; 13] = [
    "ApertureAlbumPrefs",
    "IC-Info.sidb",
    "IC-Info.sidv",
    "PhotosFolderAlbums",
    "PhotosFolderName",
    "PhotosFolderPrefs",
    "VoiceMemos.plist",
    "iPhotoAlbumPrefs",
    "iTunesApplicationIDs",
    "iTunesPrefs",
    "iTunesPrefs.plist",
    "PSAlbumAlbums",
    "PSElementsAlbums",
];

/// Build the session manifest.
///
/// The base device record and the application listing are mandatory;
/// every other source is best-effort and simply omitted when unavailable.
pub async fn build_manifest<L, C>(
    lockdown: &mut L,
    conduit: &mut C,
    applications: Dictionary,
    extra: Option<Dictionary>,
) -> Result<Dictionary>
where
    L: LockdownClient,
    C: FileConduit,
{
    let mut manifest = Dictionary::new();
    manifest.insert(
        "GUID".into(),
        Value::String(Uuid::new_v4().to_string()),
    );

    let record = lockdown
        .get_value(None)
        .await
        .map_err(|_| BackupError::DeviceRecord)?;
    let record = record
        .into_dictionary()
        .ok_or(BackupError::DeviceRecord)?;

    copy_string(&record, "BuildVersion", &mut manifest, "Build Version");
    copy_string(&record, "DeviceName", &mut manifest, "Device Name");
    copy_string(&record, "DeviceName", &mut manifest, "Display Name");
    copy_string(&record, "ProductType", &mut manifest, "Product Type");
    copy_string(&record, "ProductVersion", &mut manifest, "Product Version");
    copy_string(&record, "SerialNumber", &mut manifest, "Serial Number");
    copy_string(&record, "UniqueDeviceID", &mut manifest, "Target Identifier");
    manifest.insert("Target Type".into(), Value::String("Device".into()));
    if let Some(udid) = record.get("UniqueDeviceID").and_then(Value::as_string) {
        manifest.insert(
            "Unique Identifier".into(),
            Value::String(udid.to_uppercase()),
        );
    }
    manifest.insert(
        "Last Backup Date".into(),
        Value::Date(plist::Date::from(SystemTime::now())),
    );
    copy_string(&record, "IntegratedCircuitCardIdentity", &mut manifest, "ICCID");
    copy_string(&record, "IntegratedCircuitCardIdentity2", &mut manifest, "ICCID 2");
    copy_string(
        &record,
        "InternationalMobileEquipmentIdentity",
        &mut manifest,
        "IMEI",
    );
    copy_string(
        &record,
        "InternationalMobileEquipmentIdentity2",
        &mut manifest,
        "IMEI 2",
    );

    let installed: Vec<Value> = applications
        .keys()
        .map(|id| Value::String(id.clone()))
        .collect();
    manifest.insert("Applications".into(), Value::Dictionary(applications));
    manifest.insert("Installed Applications".into(), Value::Array(installed));

    if let Ok(Some(data)) = conduit.read_file(IBOOKS_DATA_PATH).await {
        manifest.insert("iBooks Data 2".into(), Value::Data(data));
    }

    if let Ok(settings) = lockdown.get_value(Some("com.apple.iTunes")).await {
        manifest.insert("com.apple.iTunes".into(), settings);
    }

    let mut itunes_files = Dictionary::new();
    for name in ITUNES_FILE_CANDIDATES {
        let path = format!("{ITUNES_FILES_DIR}{name}");
        if let Ok(Some(data)) = conduit.read_file(&path).await {
            itunes_files.insert(name.into(), Value::Data(data));
        }
    }
    manifest.insert("iTunes Files".into(), Value::Dictionary(itunes_files));

    if let Some(extra) = extra {
        merge_extra(&mut manifest, extra);
    }

    debug!(keys = manifest.len(), "manifest assembled");
    Ok(manifest)
}

/// Merge caller-supplied extra information into the manifest.
///
/// Overwriting a reserved manifest key would produce a non-working backup;
/// a collision is a programming error, not a recoverable condition.
pub fn merge_extra(manifest: &mut Dictionary, extra: Dictionary) {
    for (key, value) in extra {
        if manifest.contains_key(&key) {
            panic!("extra manifest information collides with reserved key {key:?}");
        }
        manifest.insert(key, value);
    }
}

/// Serialize the manifest and write it atomically to `<root>/Info.plist`.
pub fn write_manifest(root: &Path, manifest: &Dictionary) -> Result<()> {
    let target = root.join(MANIFEST_FILE);
    let staging = root.join(format!("{MANIFEST_FILE}.tmp"));

    Value::Dictionary(manifest.clone())
        .to_file_binary(&staging)
        .map_err(|err| BackupError::Filesystem(err.to_string()))?;
    std::fs::rename(&staging, &target)?;
    Ok(())
}

fn copy_string(record: &Dictionary, from: &str, manifest: &mut Dictionary, to: &str) {
    if let Some(value) = record.get(from).and_then(Value::as_string) {
        manifest.insert(to.into(), Value::String(value.into()));
    }
}
