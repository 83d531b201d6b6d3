// Artifact storage
//
// Object-store contract the executor writes subtitle artifacts through:
// `put` stores bytes under a key and returns a public URL. The default
// backend is a directory on local disk fronted by a static file route or
// CDN.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;

/// Key for a transcript artifact: `transcripts/{task_id}/{file_name}`.
pub fn transcript_key(task_id: &str, file_name: &str) -> String {
    format!("transcripts/{}/{}", task_id, file_name)
}

/// Blob storage with public URLs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key` and return the public URL.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> io::Result<String>;
}

/// Directory-backed artifact store.
pub struct LocalArtifactStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn path_for(&self, key: &str) -> io::Result<PathBuf> {
        // Keys are internal (`transcripts/...`, `uploads/...`), never
        // caller-controlled paths; reject anything that walks upward.
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid artifact key: {key}"),
            ));
        }
        Ok(self.root.join(Path::new(key)))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> io::Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        debug!("stored artifact {} ({} bytes)", key, bytes.len());
        Ok(self.public_url(key))
    }
}
