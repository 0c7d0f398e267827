use crate::lock_or_recover;
use crate::notify::rules::NotificationRule;
use crate::notify::Notification;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

pub const STATE_FILE_NAME: &str = "tui-state.json";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("state file {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode state: {0}")]
    Encode(#[source] serde_json::Error),
}

impl StateError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuiState {
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub notification_rules: Vec<NotificationRule>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub struct StateStore {
    path: PathBuf,
    state: Mutex<TuiState>,
}

impl StateStore {
    pub fn default_path(root: &Path) -> PathBuf {
        root.join(fmail_core::mailbox::FMAIL_DIR).join(STATE_FILE_NAME)
    }

    /// Store for `path` starting from empty state; nothing is read.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(TuiState::default()),
        }
    }

    /// Reads `path`; a missing file is empty state.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let store = Self::new(path);
        store.reload()?;
        Ok(store)
    }

    pub fn reload(&self) -> Result<(), StateError> {
        let loaded = match fs::read(&self.path) {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => TuiState::default(),
            Ok(raw) => serde_json::from_slice(&raw).map_err(|source| StateError::Decode {
                path: self.path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => TuiState::default(),
            Err(err) => return Err(StateError::io(&self.path, err)),
        };
        *lock_or_recover(&self.state) = loaded;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> TuiState {
        lock_or_recover(&self.state).clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock_or_recover(&self.state).notifications.clone()
    }

    pub fn notification_rules(&self) -> Vec<NotificationRule> {
        lock_or_recover(&self.state).notification_rules.clone()
    }

    pub fn set_notifications(&self, notifications: Vec<Notification>) {
        lock_or_recover(&self.state).notifications = notifications;
    }

    pub fn set_notification_rules(&self, rules: Vec<NotificationRule>) {
        lock_or_recover(&self.state).notification_rules = rules;
    }

    pub fn extra(&self, key: &str) -> Option<Value> {
        lock_or_recover(&self.state).extra.get(key).cloned()
    }

    /// Writes the whole state atomically under an exclusive sidecar lock.
    pub fn save_now(&self) -> Result<(), StateError> {
        let payload = {
            let state = lock_or_recover(&self.state);
            serde_json::to_vec_pretty(&*state).map_err(StateError::Encode)?
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| StateError::io(parent, err))?;
        }
        let _lock = StateFileLock::acquire(&sidecar_path(&self.path, "lock"))?;

        let temp_path = sidecar_path(&self.path, "tmp");
        fs::write(&temp_path, &payload).map_err(|err| StateError::io(&temp_path, err))?;
        fs::rename(&temp_path, &self.path).map_err(|err| StateError::io(&self.path, err))?;
        debug!(event = "state_saved", path = %self.path.display(), bytes = payload.len());
        Ok(())
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.{suffix}", name.to_string_lossy())),
        None => path.with_extension(suffix),
    }
}

struct StateFileLock {
    file: File,
}

impl StateFileLock {
    fn acquire(path: &Path) -> Result<Self, StateError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| StateError::io(path, err))?;
        file.lock_exclusive().map_err(|err| StateError::io(path, err))?;
        Ok(Self { file })
    }
}

impl Drop for StateFileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
