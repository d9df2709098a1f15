use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{DocumentId, RenderMode};

/// Client-wide preferences remembered across navigations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewerSettings {
    #[serde(default)]
    pub render_mode: RenderMode,
    #[serde(default)]
    pub last_issue: Option<DocumentId>,
}

pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<ViewerSettings>;
    fn save(&self, settings: &ViewerSettings) -> Result<()>;
}

pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create settings directory at {:?}", root))?;
        Ok(Self {
            path: root.join("settings.json"),
        })
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> Result<ViewerSettings> {
        if !self.path.exists() {
            return Ok(ViewerSettings::default());
        }
        let mut file = File::open(&self.path)
            .with_context(|| format!("failed to open settings file {:?}", self.path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let settings = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode settings file {:?}", self.path))?;
        Ok(settings)
    }

    fn save(&self, settings: &ViewerSettings) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(settings)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp settings file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySettingsStore {
    inner: Mutex<ViewerSettings>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<ViewerSettings> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, settings: &ViewerSettings) -> Result<()> {
        *self.inner.lock() = settings.clone();
        Ok(())
    }
}

/// Locally stored document blobs, keyed by document id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load_blob(&self, document: &DocumentId) -> Result<Option<Bytes>>;
    async fn put(&self, document: &DocumentId, blob: Bytes) -> Result<()>;
    async fn remove(&self, document: &DocumentId) -> Result<bool>;
}

pub struct DirectoryRecordStore {
    root: PathBuf,
}

impl DirectoryRecordStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create record directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn blob_path(&self, document: &DocumentId) -> PathBuf {
        let name: String = document
            .as_str()
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' => '_',
                other => other,
            })
            .collect();
        self.root.join(format!("{}.pdf", name))
    }
}

#[async_trait]
impl RecordStore for DirectoryRecordStore {
    async fn load_blob(&self, document: &DocumentId) -> Result<Option<Bytes>> {
        let path = self.blob_path(document);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read record {:?}", path)),
        }
    }

    async fn put(&self, document: &DocumentId, blob: Bytes) -> Result<()> {
        let path = self.blob_path(document);
        let tmp = path.with_extension("pdf.tmp");
        tokio::fs::write(&tmp, &blob)
            .await
            .with_context(|| format!("failed to write record {:?}", tmp))?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, document: &DocumentId) -> Result<bool> {
        match tokio::fs::remove_file(self.blob_path(document)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<HashMap<DocumentId, Bytes>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load_blob(&self, document: &DocumentId) -> Result<Option<Bytes>> {
        Ok(self.inner.lock().get(document).cloned())
    }

    async fn put(&self, document: &DocumentId, blob: Bytes) -> Result<()> {
        self.inner.lock().insert(document.clone(), blob);
        Ok(())
    }

    async fn remove(&self, document: &DocumentId) -> Result<bool> {
        Ok(self.inner.lock().remove(document).is_some())
    }
}
