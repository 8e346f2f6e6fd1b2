use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{BootstrapError, Result};

pub(crate) const PRIVATE_FILE_MODE: u32 = 0o600;
pub(crate) const DATA_DIR_MODE: u32 = 0o777;

/// Creates the data directory and any missing parents.
///
/// New directories are created with mode `0o777` (subject to the process umask);
/// an existing directory is left as is.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub async fn ensure_data_dir(path: &Path) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DATA_DIR_MODE)
        .create(path)
        .await
        .map_err(|e| BootstrapError::io(path, e))
}

/// Applies owner-only read/write permissions to a file.
///
/// # Errors
/// Returns an error if permissions cannot be set.
pub async fn set_private_permissions(path: &Path) -> Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(PRIVATE_FILE_MODE))
        .await
        .map_err(|e| BootstrapError::io(path, e))
}

/// Atomically replaces `path` with `contents`, readable and writable by the owner only.
///
/// The data is written and synced to a temporary sibling first, then renamed
/// over `path`, so a crash never leaves a partially written file behind.
///
/// # Errors
/// Returns an error if the file cannot be written, synced or renamed.
pub async fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = temp_path(path);
    if let Err(err) = write_synced(&temp_path, contents).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| BootstrapError::io(path, e))?;
    sync_parent(path).await
}

async fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(PRIVATE_FILE_MODE)
        .open(path)
        .await
        .map_err(|e| BootstrapError::io(path, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| BootstrapError::io(path, e))?;
    file.sync_all()
        .await
        .map_err(|e| BootstrapError::io(path, e))?;
    // The open mode is masked by the umask.
    set_private_permissions(path).await
}

async fn sync_parent(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    let dir = fs::File::open(parent)
        .await
        .map_err(|e| BootstrapError::io(parent, e))?;
    dir.sync_all()
        .await
        .map_err(|e| BootstrapError::io(parent, e))
}

fn temp_path(path: &Path) -> PathBuf {
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    let file_name = path
        .file_name()
        .map_or_else(|| "file".into(), |name| name.to_string_lossy());
    path.with_file_name(format!(".{file_name}.tmp.{pid}.{nanos}"))
}

/// Reports whether `path` exists. Errors other than absence are surfaced.
///
/// # Errors
/// Returns an error if the metadata lookup fails for any reason but `NotFound`.
pub async fn path_exists(path: &Path) -> Result<bool> {
    match fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(BootstrapError::io(path, e)),
    }
}

/// Reads the whole file, mapping absence to [`BootstrapError::NotFound`].
///
/// # Errors
/// Returns `NotFound` if the file does not exist, or `Io` for other failures.
pub async fn read_path(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(BootstrapError::NotFound(format!(
            "file {}",
            path.display()
        ))),
        Err(e) => Err(BootstrapError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_ensure_data_dir_creates_parents() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("a").join("b").join("data");

        ensure_data_dir(&data_dir).await.unwrap();
        assert!(data_dir.is_dir());

        // Second call is a no-op.
        ensure_data_dir(&data_dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_private_file_sets_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.key");

        write_private_file(&path, b"key-data").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, PRIVATE_FILE_MODE);
        assert_eq!(std::fs::read(&path).unwrap(), b"key-data");
    }

    #[tokio::test]
    async fn test_write_private_file_tightens_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.cert");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_private_file(&path, b"new").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, PRIVATE_FILE_MODE);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_write_private_file_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("teleport.secret");

        write_private_file(&path, b"first").await.unwrap();
        write_private_file(&path, b"second").await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("teleport.secret")]);
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_failed_write_creates_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("node.key");

        assert!(write_private_file(&path, b"key").await.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_path_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing");
        assert!(!path_exists(&path).await.unwrap());

        std::fs::write(&path, "x").unwrap();
        assert!(path_exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_path_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let err = read_path(&dir.path().join("missing")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
