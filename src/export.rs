#![forbid(unsafe_code)]

//! Saving subtitle text the way the web page's download buttons do: the same
//! bytes under either extension, no conversion.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use clap::ValueEnum;

pub const DOWNLOAD_STEM: &str = "subtitle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SubtitleFormat {
    Srt,
    Txt,
}

impl SubtitleFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Srt => "srt",
            Self::Txt => "txt",
        }
    }
}

impl fmt::Display for SubtitleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

pub fn download_file_name(format: SubtitleFormat) -> String {
    format!("{DOWNLOAD_STEM}.{}", format.extension())
}

/// Writes `text` verbatim. A directory target receives `subtitle.<ext>`; any
/// other path is used as given.
pub fn write_download(text: &str, format: SubtitleFormat, target: &Path) -> io::Result<PathBuf> {
    let path = if target.is_dir() {
        target.join(download_file_name(format))
    } else {
        target.to_path_buf()
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, text.as_bytes())?;
    Ok(path)
}
