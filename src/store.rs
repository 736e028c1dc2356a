//! Session metadata and remote host records.
//!
//! The registry only needs four operations from persistence, expressed by
//! [`MetadataStore`]. [`MemoryStore`] backs tests and ephemeral runs;
//! [`FileStore`] keeps one JSON file per record under the data directory:
//!
//! ```text
//! <data_dir>/meta/sessions/<id>.json
//! <data_dir>/meta/hosts/<id>.json
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::StoreError;
use crate::util::is_safe_id;

/// Persisted description of a session, enough to resume it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    /// `terminal`, `chat` or `remote`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    pub created_at_ms: u64,
}

/// SSH target and credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteHost {
    pub id: String,
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// OpenSSH or PEM private key text.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub key_passphrase: Option<String>,
    /// Expected `SHA256:` host key fingerprint. Unset accepts any key.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |s: &Option<String>| s.as_ref().map(|_| "<redacted>");
        f.debug_struct("RemoteHost")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("private_key", &redact(&self.private_key))
            .field("key_passphrase", &redact(&self.key_passphrase))
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError>;
    async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError>;
    async fn delete_session(&self, id: &str) -> Result<(), StoreError>;
    async fn get_remote_host(&self, id: &str) -> Result<Option<RemoteHost>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    hosts: Mutex<HashMap<String, RemoteHost>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_host(&self, host: RemoteHost) {
        self.hosts.lock().insert(host.id.clone(), host);
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.lock().get(id).cloned())
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.sessions.lock().insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.lock().remove(id);
        Ok(())
    }

    async fn get_remote_host(&self, id: &str) -> Result<Option<RemoteHost>, StoreError> {
        Ok(self.hosts.lock().get(id).cloned())
    }
}

/// JSON files on disk. Writes go to a temp file and are renamed into place.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("meta"),
        }
    }

    fn path(&self, table: &str, id: &str) -> Option<PathBuf> {
        is_safe_id(id).then(|| self.root.join(table).join(format!("{id}.json")))
    }

    async fn read<T: for<'de> Deserialize<'de>>(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let Some(path) = self.path(table, id) else {
            return Ok(None);
        };
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl MetadataStore for FileStore {
    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.read("sessions", id).await
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let Some(path) = self.path("sessions", &record.id) else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        let Some(path) = self.path("sessions", id) else {
            return Ok(());
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_remote_host(&self, id: &str) -> Result<Option<RemoteHost>, StoreError> {
        self.read("hosts", id).await
    }
}
