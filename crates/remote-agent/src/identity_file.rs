use remote_core::Identity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Default, Serialize, Deserialize)]
struct IdentityFile {
    #[serde(default)]
    identity: Option<String>,
}

/// Reads the persisted identity. A missing file or empty value means the
/// agent has not been set up yet.
pub fn load_identity(path: &Path) -> io::Result<Option<Identity>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let file: IdentityFile = serde_json::from_str(&raw)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(file
        .identity
        .filter(|value| !value.trim().is_empty())
        .map(Identity::from))
}

pub fn save_identity(path: &Path, identity: &Identity) -> io::Result<()> {
    write_file(
        path,
        &IdentityFile {
            identity: Some(identity.as_str().to_string()),
        },
    )
}

pub fn clear_identity(path: &Path) -> io::Result<()> {
    write_file(path, &IdentityFile::default())
}

fn write_file(path: &Path, file: &IdentityFile) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let body = serde_json::to_string_pretty(file)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body)?;
    fs::rename(tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_blank_file_has_no_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.json");
        assert_eq!(load_identity(&path).expect("load"), None);

        fs::write(&path, "{\"identity\": \"  \"}").expect("write");
        assert_eq!(load_identity(&path).expect("load"), None);
    }

    #[test]
    fn save_then_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("agent.json");
        let identity = Identity::from("4c1f0d7e");

        save_identity(&path, &identity).expect("save");
        assert_eq!(load_identity(&path).expect("load"), Some(identity));

        clear_identity(&path).expect("clear");
        assert_eq!(load_identity(&path).expect("load"), None);
    }
}
