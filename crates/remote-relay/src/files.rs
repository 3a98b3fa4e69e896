use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use remote_core::Identity;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SNAPSHOT_DIR: &str = "snip";
const FILES_DIR: &str = "files";

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
}

/// Agent payloads written under `<root>/<identity>/`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    snapshot_keep: usize,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, snapshot_keep: usize) -> Self {
        Self {
            root: root.into(),
            snapshot_keep,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_dir(&self, identity: &Identity) -> PathBuf {
        self.root
            .join(sanitize_component(identity.as_str()))
            .join(SNAPSHOT_DIR)
    }

    pub fn files_dir(&self, identity: &Identity) -> PathBuf {
        self.root
            .join(sanitize_component(identity.as_str()))
            .join(FILES_DIR)
    }

    /// Decodes a base64 PNG into `snip/<timestamp>.png` and prunes the
    /// directory down to the newest `snapshot_keep` images (0 keeps all).
    pub fn store_snapshot(
        &self,
        identity: &Identity,
        data: &str,
        at: DateTime<Utc>,
    ) -> Result<PathBuf, FileStoreError> {
        let bytes = STANDARD.decode(data.trim())?;
        let dir = self.snapshot_dir(identity);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.png", at.format("%Y%m%dT%H%M%S%.6fZ")));
        fs::write(&path, bytes)?;
        prune_snapshots(&dir, self.snapshot_keep)?;
        Ok(path)
    }

    /// Writes a downloaded file under `files/`, keeping only the last path
    /// component of `filename`.
    pub fn store_file(
        &self,
        identity: &Identity,
        filename: &str,
        data: &str,
    ) -> Result<PathBuf, FileStoreError> {
        let name = sanitize_file_name(filename)
            .ok_or_else(|| FileStoreError::InvalidName(filename.to_string()))?;
        let bytes = STANDARD.decode(data.trim())?;
        let dir = self.files_dir(identity);
        fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Reads `files/<filename>` for an upload to the agent and returns the
    /// sanitized name with the base64 body. Only the agent's own files
    /// directory is ever read.
    pub fn load_file(
        &self,
        identity: &Identity,
        filename: &str,
    ) -> Result<(String, String), FileStoreError> {
        let name = sanitize_file_name(filename)
            .ok_or_else(|| FileStoreError::InvalidName(filename.to_string()))?;
        let bytes = fs::read(self.files_dir(identity).join(&name))?;
        Ok((name, STANDARD.encode(bytes)))
    }
}

fn prune_snapshots(dir: &Path, keep: usize) -> io::Result<()> {
    let mut images: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().map(|ext| ext == "png").unwrap_or(false))
        .collect();
    if keep == 0 || images.len() <= keep {
        return Ok(());
    }
    images.sort();
    let excess = images.len() - keep;
    for path in images.into_iter().take(excess) {
        fs::remove_file(path)?;
    }
    Ok(())
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn sanitize_file_name(input: &str) -> Option<String> {
    let last = input.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(
        last.chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ' ') {
                    ch
                } else {
                    '_'
                }
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 10, 0, second)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn snapshots_are_pruned_to_newest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path(), 3);
        let identity = Identity::from("agent-1");
        let data = STANDARD.encode(b"\x89PNG fake");

        let mut written = Vec::new();
        for second in 0..5 {
            written.push(
                store
                    .store_snapshot(&identity, &data, ts(second))
                    .expect("store snapshot"),
            );
        }

        let mut remaining: Vec<_> = fs::read_dir(store.snapshot_dir(&identity))
            .expect("read dir")
            .map(|entry| entry.expect("entry").path())
            .collect();
        remaining.sort();
        assert_eq!(remaining, written[2..].to_vec());
        assert_eq!(fs::read(&written[4]).expect("read"), b"\x89PNG fake");
    }

    #[test]
    fn snapshot_rejects_invalid_base64() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path(), 3);
        let err = store
            .store_snapshot(&Identity::from("agent-1"), "not base64!!", ts(0))
            .expect_err("invalid payload");
        assert!(matches!(err, FileStoreError::Decode(_)));
    }

    #[test]
    fn downloaded_files_cannot_escape_identity_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path(), 3);
        let identity = Identity::from("../agent");
        let data = STANDARD.encode(b"report");

        let path = store
            .store_file(&identity, "../../etc/report.txt", &data)
            .expect("store file");
        assert_eq!(path, temp.path().join("___agent").join("files").join("report.txt"));
        assert_eq!(fs::read(&path).expect("read"), b"report");

        assert!(matches!(
            store.store_file(&identity, "dir/..", &data),
            Err(FileStoreError::InvalidName(_))
        ));
    }

    #[test]
    fn uploads_are_served_from_the_identity_files_dir_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path().join("data"), 3);
        let identity = Identity::from("agent-1");
        store
            .store_file(&identity, "notes.txt", &STANDARD.encode(b"hello"))
            .expect("store file");
        fs::write(temp.path().join("secret.txt"), b"outside").expect("write");

        let (name, data) = store
            .load_file(&identity, "../../secret/../notes.txt")
            .expect("load file");
        assert_eq!(name, "notes.txt");
        assert_eq!(STANDARD.decode(data).expect("base64"), b"hello");

        assert!(matches!(
            store.load_file(&identity, "../../secret.txt"),
            Err(FileStoreError::Io(_))
        ));
    }
}
