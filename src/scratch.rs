#![forbid(unsafe_code)]

//! Scratch storage for uploaded videos.
//!
//! Every request gets its own uniquely named file; the client's filename is
//! only kept as metadata. The file lives exactly as long as its
//! [`StagedUpload`], so it is removed on success, on failure and when the
//! request is abandoned half way.

use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::{AppConfig, Environment};
use crate::pipeline::UploadMetadata;

const SCRATCH_PREFIX: &str = "upload-";
const FALLBACK_NAME: &str = "video";
const MAX_EXTENSION_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScratchStrategy {
    /// The OS temp directory. Used in production where the working directory
    /// may be read-only.
    TempDir,
    UploadsDir(PathBuf),
}

impl ScratchStrategy {
    pub fn for_config(config: &AppConfig) -> Self {
        match config.environment {
            Environment::Production => Self::TempDir,
            Environment::Development => Self::UploadsDir(config.uploads_dir.clone()),
        }
    }

    pub fn directory(&self) -> PathBuf {
        match self {
            Self::TempDir => env::temp_dir(),
            Self::UploadsDir(path) => path.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn prepare(strategy: &ScratchStrategy) -> io::Result<Self> {
        Self::at(&strategy.directory())
    }

    pub fn at(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Creates an empty scratch file for one upload.
    pub fn stage(&self, original_name: &str, content_type: Option<&str>) -> io::Result<StagedUpload> {
        // Temp cleaners may have removed the directory since startup.
        fs::create_dir_all(&self.root)?;
        let original_name = display_name(original_name);
        let suffix = scratch_suffix(&original_name);
        let file = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .suffix(&suffix)
            .tempfile_in(&self.root)?;
        debug!(path = %file.path().display(), "staged scratch file");
        Ok(StagedUpload {
            file,
            metadata: UploadMetadata {
                original_name,
                content_type: content_type
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string),
                size: 0,
            },
        })
    }
}

pub struct StagedUpload {
    file: NamedTempFile,
    metadata: UploadMetadata,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn metadata(&self) -> &UploadMetadata {
        &self.metadata
    }

    /// Async handle onto the same file, for streaming request bodies into it.
    pub fn open_writer(&self) -> io::Result<tokio::fs::File> {
        Ok(tokio::fs::File::from_std(self.file.as_file().try_clone()?))
    }

    pub fn set_size(&mut self, size: u64) {
        self.metadata.size = size;
    }

    #[cfg(test)]
    pub(crate) fn write_blocking(&mut self, bytes: &[u8]) -> io::Result<()> {
        use std::io::Write;

        self.file.write_all(bytes)?;
        self.file.flush()?;
        self.metadata.size += bytes.len() as u64;
        Ok(())
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        debug!(path = %self.file.path().display(), "removing scratch file");
    }
}

/// Last path component of whatever the browser sent. Some browsers still send
/// `C:\fakepath\clip.mp4`.
fn display_name(raw: &str) -> String {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if name.is_empty() || name == "." || name == ".." {
        FALLBACK_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// Keeps the extension so MIME detection still works on the scratch path.
fn scratch_suffix(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}
