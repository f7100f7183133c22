//! The shared directory fetched files are materialized into.
//!
//! Every key maps to exactly one path, `{dir}/{key}.{extension}`. Fetchers never write to that
//! path directly. They write into a private staging directory inside `dir`, and the finished file
//! is moved into place with a single rename, so a reader either sees nothing or a complete file.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::config::{Config, StorageConfig};
use crate::types::FetchKey;

const STAGING_PREFIX: &str = ".staging-";

/// Entry function for the cleanup command.
///
/// Removes all files and staging directories left behind in the storage directory.
pub fn cleanup(config: &Config) -> Result<()> {
    let storage = Storage::from_config(&config.storage).context("failed to open storage")?;
    let removed = storage.clear().context("failed to clear storage")?;
    tracing::info!(removed, dir = %storage.dir().display(), "Cleaned up storage");
    Ok(())
}

#[derive(Clone, Debug)]
pub struct Storage {
    dir: PathBuf,
    extension: String,
}

impl Storage {
    /// Opens the configured storage directory, creating it if needed.
    pub fn from_config(config: &StorageConfig) -> io::Result<Self> {
        Self::new(config.dir.clone(), config.extension.clone())
    }

    pub fn new(dir: PathBuf, extension: String) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, extension })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// The file name a key is served under.
    pub fn filename(&self, key: &FetchKey) -> String {
        format!("{key}.{}", self.extension)
    }

    /// The deterministic path of the file for `key`.
    pub fn path_for(&self, key: &FetchKey) -> PathBuf {
        self.dir.join(self.filename(key))
    }

    /// Creates a fresh staging directory for one fetch of `key`.
    pub fn staging(&self, key: &FetchKey) -> io::Result<StagingDir> {
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.dir)?;
        let output_template = dir.path().join(format!("{key}.%(ext)s"));
        let output_path = dir.path().join(self.filename(key));
        Ok(StagingDir {
            dir,
            output_template,
            output_path,
        })
    }

    /// Removes served files and staging directories from the storage directory.
    ///
    /// Anything else in the directory is left alone. Returns the number of removed entries.
    pub fn clear(&self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            let result = if file_type.is_dir() && is_staging_dir(&path) {
                fs::remove_dir_all(&path)
            } else if file_type.is_file()
                && path.extension() == Some(OsStr::new(&self.extension))
            {
                fs::remove_file(&path)
            } else {
                continue;
            };

            match result {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Removed stale entry");
                    removed += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }
}

fn is_staging_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| name.starts_with(STAGING_PREFIX))
}

/// A private directory a single fetch writes into.
///
/// The directory and anything left in it are removed on drop.
#[derive(Debug)]
pub struct StagingDir {
    dir: TempDir,
    output_template: PathBuf,
    output_path: PathBuf,
}

impl StagingDir {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The output template handed to the fetcher, `{staging}/{key}.%(ext)s`.
    pub fn output_template(&self) -> &Path {
        &self.output_template
    }

    /// Where the fetcher is expected to leave its result.
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Moves `produced` to `dest` and removes the staging directory.
    pub async fn promote(self, produced: &Path, dest: &Path) -> io::Result<()> {
        tokio::fs::rename(produced, dest).await?;
        let dir = self.dir;
        tokio::task::spawn_blocking(move || dir.close())
            .await
            .map_err(io::Error::other)?
    }
}
