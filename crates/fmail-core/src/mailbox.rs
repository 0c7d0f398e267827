use crate::{AgentRecord, Message};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FMAIL_DIR: &str = ".fmail";
pub const FORGED_SOCKET_NAME: &str = "forged.sock";

const TOPICS_DIR: &str = "topics";
const DM_DIR: &str = "dm";
const AGENTS_DIR: &str = "agents";
const ENTRY_EXT: &str = "json";

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("decode error at {}: {message}", path.display())]
    Decode { path: PathBuf, message: String },
    #[error("encode error at {}: {message}", path.display())]
    Encode { path: PathBuf, message: String },
    #[error("invalid mailbox name: {0:?}")]
    InvalidName(String),
}

impl MailboxError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderKind {
    Topic,
    Dm,
}

/// One directory of message files: a topic, or the DM inbox of one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Folder {
    pub kind: FolderKind,
    pub name: String,
    pub path: PathBuf,
}

impl Folder {
    /// Topic name, or `@recipient` for a DM inbox.
    pub fn label(&self) -> String {
        match self.kind {
            FolderKind::Topic => self.name.clone(),
            FolderKind::Dm => format!("@{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxEntry {
    pub id: String,
    pub path: PathBuf,
}

/// Filesystem mailbox rooted at `<project>/.fmail`.
#[derive(Debug, Clone)]
pub struct Mailbox {
    root: PathBuf,
}

impl Mailbox {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            root: project_root.into(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.root
    }

    pub fn base_dir(&self) -> PathBuf {
        self.root.join(FMAIL_DIR)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.base_dir().join(FORGED_SOCKET_NAME)
    }

    pub fn topic_dir(&self, topic: &str) -> Result<PathBuf, MailboxError> {
        validate_name(topic)?;
        Ok(self.base_dir().join(TOPICS_DIR).join(topic))
    }

    pub fn dm_dir(&self, agent: &str) -> Result<PathBuf, MailboxError> {
        let agent = agent.trim_start_matches('@');
        validate_name(agent)?;
        Ok(self.base_dir().join(DM_DIR).join(agent))
    }

    pub fn topic_names(&self) -> Result<Vec<String>, MailboxError> {
        list_subdirs(&self.base_dir().join(TOPICS_DIR))
    }

    pub fn dm_recipients(&self) -> Result<Vec<String>, MailboxError> {
        list_subdirs(&self.base_dir().join(DM_DIR))
    }

    /// Every topic folder followed by every DM inbox.
    pub fn folders(&self) -> Result<Vec<Folder>, MailboxError> {
        let base = self.base_dir();
        let mut folders = Vec::new();
        for name in self.topic_names()? {
            folders.push(Folder {
                kind: FolderKind::Topic,
                path: base.join(TOPICS_DIR).join(&name),
                name,
            });
        }
        for name in self.dm_recipients()? {
            folders.push(Folder {
                kind: FolderKind::Dm,
                path: base.join(DM_DIR).join(&name),
                name,
            });
        }
        Ok(folders)
    }

    pub fn read_topic(&self, topic: &str) -> Result<Vec<Message>, MailboxError> {
        read_folder(&self.topic_dir(topic)?)
    }

    pub fn read_dm_inbox(&self, agent: &str) -> Result<Vec<Message>, MailboxError> {
        read_folder(&self.dm_dir(agent)?)
    }

    pub fn read_folder(&self, folder: &Folder) -> Result<Vec<Message>, MailboxError> {
        read_folder(&folder.path)
    }

    pub fn read_agents(&self) -> Result<Vec<AgentRecord>, MailboxError> {
        let dir = self.base_dir().join(AGENTS_DIR);
        let mut agents = Vec::new();
        for entry in list_entries(&dir)? {
            let raw = fs::read(&entry.path).map_err(|err| MailboxError::io(&entry.path, err))?;
            let record = serde_json::from_slice::<AgentRecord>(&raw).map_err(|err| {
                MailboxError::Decode {
                    path: entry.path.clone(),
                    message: err.to_string(),
                }
            })?;
            agents.push(record);
        }
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    /// Writes `message` into its topic folder or its recipient's DM inbox.
    pub fn append(&self, message: &Message) -> Result<PathBuf, MailboxError> {
        validate_name(&message.id)?;
        let dir = match message.dm_target() {
            Some(agent) => self.dm_dir(agent)?,
            None => self.topic_dir(&message.to)?,
        };
        let path = dir.join(format!("{}.{ENTRY_EXT}", message.id));
        write_json_atomic(&dir, &path, message)?;
        Ok(path)
    }
}

/// Message files of `dir`, sorted by id. A missing directory is empty.
pub fn list_entries(dir: &Path) -> Result<Vec<MailboxEntry>, MailboxError> {
    let read_dir = match fs::read_dir(dir) {
        Ok(value) => value,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(MailboxError::io(dir, err)),
    };
    let mut entries = Vec::new();
    for item in read_dir {
        let item = item.map_err(|err| MailboxError::io(dir, err))?;
        let path = item.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXT) {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if id.starts_with('.') {
            continue;
        }
        entries.push(MailboxEntry {
            id: id.to_string(),
            path: path.clone(),
        });
    }
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(entries)
}

pub fn read_message(path: &Path) -> Result<Message, MailboxError> {
    let raw = fs::read(path).map_err(|err| MailboxError::io(path, err))?;
    serde_json::from_slice(&raw).map_err(|err| MailboxError::Decode {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn read_folder(dir: &Path) -> Result<Vec<Message>, MailboxError> {
    list_entries(dir)?
        .iter()
        .map(|entry| read_message(&entry.path))
        .collect()
}

fn list_subdirs(dir: &Path) -> Result<Vec<String>, MailboxError> {
    let read_dir = match fs::read_dir(dir) {
        Ok(value) => value,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(MailboxError::io(dir, err)),
    };
    let mut names = Vec::new();
    for item in read_dir {
        let item = item.map_err(|err| MailboxError::io(dir, err))?;
        let is_dir = item
            .file_type()
            .map_err(|err| MailboxError::io(&item.path(), err))?
            .is_dir();
        if !is_dir {
            continue;
        }
        if let Some(name) = item.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn validate_name(name: &str) -> Result<(), MailboxError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed != name
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(MailboxError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn write_json_atomic<T: serde::Serialize>(
    dir: &Path,
    path: &Path,
    value: &T,
) -> Result<(), MailboxError> {
    fs::create_dir_all(dir).map_err(|err| MailboxError::io(dir, err))?;
    let encoded = serde_json::to_vec_pretty(value).map_err(|err| MailboxError::Encode {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("entry");
    let tmp = dir.join(format!(".{file_name}.tmp"));
    let mut file = fs::File::create(&tmp).map_err(|err| MailboxError::io(&tmp, err))?;
    file.write_all(&encoded)
        .and_then(|_| file.sync_all())
        .map_err(|err| MailboxError::io(&tmp, err))?;
    fs::rename(&tmp, path).map_err(|err| MailboxError::io(path, err))
}
