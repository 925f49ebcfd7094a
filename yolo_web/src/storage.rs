use crate::config::StorageConfig;
use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{fs, sync::broadcast::Receiver, task::JoinHandle};
use uuid::Uuid;

pub const ALLOWED_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Unsupported file type: only jpg, jpeg, png, bmp and webp images are allowed")]
    UnsupportedExtension,
    #[error("Failed to store upload: {0}")]
    Io(#[from] io::Error),
}

/// Lower-cased extension of `file_name` if it is an accepted image type.
pub fn image_extension(file_name: &str) -> Result<String, StorageError> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .ok_or(StorageError::UnsupportedExtension)?;

    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err(StorageError::UnsupportedExtension)
    }
}

/// Writes an uploaded image under a fresh random name that keeps its extension.
pub async fn save_upload(
    upload_dir: &Path,
    original_name: &str,
    data: &[u8],
) -> Result<PathBuf, StorageError> {
    let extension = image_extension(original_name)?;
    fs::create_dir_all(upload_dir).await?;

    let path = upload_dir.join(format!("{}.{}", Uuid::new_v4(), extension));
    fs::write(&path, data).await?;
    tracing::debug!(path = %path.display(), bytes = data.len(), "Stored upload");

    Ok(path)
}

/// Deletes regular files in `dir` last modified more than `max_age` ago.
pub async fn sweep_dir(dir: &Path, max_age: Duration) -> io::Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age > max_age {
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove stale file"),
            }
        }
    }

    Ok(removed)
}

pub async fn sweep(config: &StorageConfig) {
    for dir in [&config.upload_dir, &config.output_dir] {
        match sweep_dir(dir, config.get_max_age()).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(dir = %dir.display(), removed, "Removed stale files"),
            Err(e) => tracing::error!(dir = %dir.display(), error = %e, "Failed to sweep directory"),
        }
    }
}

/// Runs [`sweep`] every `sweep_interval_secs` until shutdown is broadcast.
pub fn start_sweeper(config: StorageConfig, mut shutdown_rx: Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.get_sweep_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => sweep(&config).await,
                _ = shutdown_rx.recv() => {
                    tracing::info!("Stopping storage sweeper");
                    break;
                }
            }
        }
    })
}
