//! Crash-safe file updates
//!
//! Every write goes to a hidden sibling first and is renamed into place, so
//! a reader sees either the old or the new content, never a torn one. The
//! parent directory is synced after the rename so the new entry survives a
//! power loss.

use crate::CloudInitError;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

/// Flush directory entries of `dir` to disk
async fn sync_dir(dir: &Path) -> Result<(), CloudInitError> {
    #[cfg(unix)]
    fs::File::open(dir).await?.sync_all().await?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp-{}", name, std::process::id()))
}

/// Write `contents` to `path` via write-to-temp-then-rename
pub async fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> Result<(), CloudInitError> {
    let parent = path.parent().ok_or_else(|| {
        CloudInitError::InvalidData(format!("{} has no parent directory", path.display()))
    })?;
    fs::create_dir_all(parent).await?;

    let staged = staging_path(path);
    let mut file = fs::File::create(&staged).await?;
    file.write_all(contents.as_ref()).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&staged, path).await {
        let _ = fs::remove_file(&staged).await;
        return Err(e.into());
    }
    sync_dir(parent).await?;

    trace!("Atomically wrote {}", path.display());
    Ok(())
}

/// Point `link` at `target`, replacing any existing link in one rename
pub async fn replace_symlink(target: &Path, link: &Path) -> Result<(), CloudInitError> {
    #[cfg(unix)]
    {
        let staged = staging_path(link);
        let _ = fs::remove_file(&staged).await;
        fs::symlink(target, &staged).await?;
        if let Err(e) = fs::rename(&staged, link).await {
            let _ = fs::remove_file(&staged).await;
            return Err(e.into());
        }
        if let Some(parent) = link.parent() {
            sync_dir(parent).await?;
        }
    }

    #[cfg(not(unix))]
    {
        // On non-Unix, just write the path to a file
        write_atomic(link, target.to_string_lossy().as_bytes()).await?;
    }

    Ok(())
}

/// Move `path` into `archive_dir` under a timestamped name
pub async fn archive(path: &Path, archive_dir: &Path, label: &str) -> Result<PathBuf, CloudInitError> {
    fs::create_dir_all(archive_dir).await?;
    let target = archive_dir.join(format!(
        "{}.{}",
        label,
        Utc::now().format("%Y%m%dT%H%M%S%.6f")
    ));
    fs::rename(path, &target).await?;
    sync_dir(archive_dir).await?;
    if let Some(parent) = path.parent() {
        sync_dir(parent).await?;
    }
    debug!("Archived {} to {}", path.display(), target.display());
    Ok(target)
}

/// Read a small text file, trimmed; missing or blank files read as `None`
pub async fn read_trimmed(path: &Path) -> Result<Option<String>, CloudInitError> {
    match fs::read_to_string(path).await {
        Ok(content) => {
            let content = content.trim();
            Ok((!content.is_empty()).then(|| content.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
