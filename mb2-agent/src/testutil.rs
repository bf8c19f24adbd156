//! Shared mock collaborators for unit tests.

use plist::{Dictionary, Value};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::delegate::{BackupDelegate, Checkpoint};
use crate::device::{ConduitError, FileConduit, LockdownClient};
use crate::devicelink::channel::{ChannelError, DeviceLinkChannel};
use crate::utils::errors::BackupError;

/// Lockdown client backed by canned values.
pub struct MockLockdown {
    record: Option<Dictionary>,
    domains: HashMap<String, Value>,
}

impl MockLockdown {
    pub fn with_record(record: Dictionary) -> Self {
        Self {
            record: Some(record),
            domains: HashMap::new(),
        }
    }

    pub fn failing() -> Self {
        Self {
            record: None,
            domains: HashMap::new(),
        }
    }

    pub fn insert_domain(&mut self, domain: &str, value: Value) {
        self.domains.insert(domain.to_string(), value);
    }
}

impl LockdownClient for MockLockdown {
    async fn get_value(&mut self, domain: Option<&str>) -> Result<Value, ConduitError> {
        match domain {
            None => self
                .record
                .clone()
                .map(Value::Dictionary)
                .ok_or_else(|| ConduitError::Failed("no record".into())),
            Some(domain) => self
                .domains
                .get(domain)
                .cloned()
                .ok_or_else(|| ConduitError::NotFound(domain.to_string())),
        }
    }
}

/// File conduit with an in-memory remote filesystem and a scriptable
/// sync-lock grant.
#[derive(Default)]
pub struct MockConduit {
    pub files: HashMap<String, Vec<u8>>,
    /// Attempt number (1-based) on which `open_rw` starts succeeding;
    /// 0 means never.
    pub grant_on_attempt: u32,
    pub open_attempts: u32,
    pub unlocked: bool,
    pub closed: bool,
}

impl MockConduit {
    pub fn granting_lock() -> Self {
        Self {
            grant_on_attempt: 1,
            ..Self::default()
        }
    }

    pub fn insert_file(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.to_string(), data);
    }
}

impl FileConduit for MockConduit {
    async fn read_file(&mut self, path: &str) -> Result<Option<Vec<u8>>, ConduitError> {
        Ok(self.files.get(path).cloned())
    }

    async fn open_rw(&mut self, _path: &str) -> Result<u64, ConduitError> {
        self.open_attempts += 1;
        if self.grant_on_attempt != 0 && self.open_attempts >= self.grant_on_attempt {
            Ok(7)
        } else {
            Err(ConduitError::Locked)
        }
    }

    async fn lock_exclusive(&mut self, _handle: u64) -> Result<(), ConduitError> {
        Ok(())
    }

    async fn unlock(&mut self, _handle: u64) -> Result<(), ConduitError> {
        self.unlocked = true;
        Ok(())
    }

    async fn close(&mut self, _handle: u64) -> Result<(), ConduitError> {
        self.closed = true;
        Ok(())
    }
}

/// One scripted receive outcome.
pub enum Step {
    Message(Value),
    Timeout,
}

/// Message channel driven by a pre-recorded script; captures everything
/// the session sends back.
#[derive(Default)]
pub struct ScriptedChannel {
    pub script: VecDeque<Step>,
    pub raw_in: VecDeque<u8>,
    pub sent: Vec<Value>,
    pub raw_out: Vec<u8>,
}

impl ScriptedChannel {
    pub fn push_message(&mut self, message: Value) {
        self.script.push_back(Step::Message(message));
    }

    pub fn push_timeout(&mut self) {
        self.script.push_back(Step::Timeout);
    }

    /// Last status response sent, as (code, status1).
    pub fn last_status(&self) -> Option<(i64, String)> {
        let array = self.sent.last()?.as_array()?;
        let code = array.get(1)?.as_signed_integer()?;
        let status1 = array.get(2)?.as_string()?.to_string();
        Some((code, status1))
    }
}

impl DeviceLinkChannel for ScriptedChannel {
    async fn send(&mut self, message: Value) -> Result<(), ChannelError> {
        self.sent.push(message);
        Ok(())
    }

    async fn receive(&mut self, _timeout: Duration) -> Result<Value, ChannelError> {
        match self.script.pop_front() {
            Some(Step::Message(message)) => Ok(message),
            Some(Step::Timeout) => Err(ChannelError::TimedOut),
            None => Err(ChannelError::Closed),
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.raw_out.extend_from_slice(bytes);
        Ok(())
    }

    async fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        if self.raw_in.len() < buf.len() {
            return Err(ChannelError::Closed);
        }
        for byte in buf.iter_mut() {
            *byte = self.raw_in.pop_front().unwrap();
        }
        Ok(())
    }
}

/// Delegate that records every callback for later assertions.
pub struct RecordingDelegate {
    pub root: PathBuf,
    pub cancelled: AtomicBool,
    /// Cancellation-poll index (0-based) from which `is_cancelled` turns
    /// true; `usize::MAX` means never.
    pub cancel_at_poll: AtomicUsize,
    polls: AtomicUsize,
    pub force_full: bool,
    pub extra: Option<Dictionary>,
    pub checkpoints: Mutex<Vec<Checkpoint>>,
    pub failures: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<f64>>,
}

impl RecordingDelegate {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            cancelled: AtomicBool::new(false),
            cancel_at_poll: AtomicUsize::new(usize::MAX),
            polls: AtomicUsize::new(0),
            force_full: false,
            extra: None,
            checkpoints: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            progress: Mutex::new(Vec::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.lock().unwrap().clone()
    }

    pub fn saw_checkpoint(&self, checkpoint: &Checkpoint) -> bool {
        self.checkpoints.lock().unwrap().contains(checkpoint)
    }

    pub fn failure_count(&self) -> usize {
        self.failures.lock().unwrap().len()
    }

    /// Rendered failure notifications, in delivery order.
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }
}

impl BackupDelegate for RecordingDelegate {
    fn is_cancelled(&self) -> bool {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        self.cancelled.load(Ordering::SeqCst) || poll >= self.cancel_at_poll.load(Ordering::SeqCst)
    }

    fn backup_root(&self) -> PathBuf {
        self.root.clone()
    }

    fn manifest_extra_info(&self) -> Option<Dictionary> {
        self.extra.clone()
    }

    fn force_full_backup(&self) -> bool {
        self.force_full
    }

    fn arrival(&self, checkpoint: Checkpoint) {
        self.checkpoints.lock().unwrap().push(checkpoint);
    }

    fn failure(&self, error: &BackupError) {
        self.failures.lock().unwrap().push(error.to_string());
    }

    fn progress_update(&self, progress: f64) {
        self.progress.lock().unwrap().push(progress);
    }
}
