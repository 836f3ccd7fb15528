#![forbid(unsafe_code)]

//! Upload-then-generate pipeline behind `POST /api/subs/`.
//!
//! Both external services sit behind small blocking traits so the HTTP layer
//! can be exercised with stubs. The pipeline itself is strictly sequential:
//! the generator only ever sees a reference produced by a successful upload.

use std::{path::Path, sync::Arc};

use thiserror::Error;
use tracing::{debug, info};

use crate::scratch::StagedUpload;

/// What the client told us about the file, plus the number of bytes we
/// actually received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub original_name: String,
    pub content_type: Option<String>,
    pub size: u64,
}

/// Opaque handle returned by the storage service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaReference {
    pub uri: String,
    pub mime_type: String,
    pub name: Option<String>,
}

pub trait MediaUploader: Send + Sync {
    fn upload(&self, path: &Path, metadata: &UploadMetadata) -> anyhow::Result<MediaReference>;
}

pub trait SubtitleGenerator: Send + Sync {
    fn generate(&self, reference: &MediaReference) -> anyhow::Result<String>;
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage upload failed: {0:#}")]
    Upload(anyhow::Error),
    #[error("subtitle generation failed: {0:#}")]
    Generation(anyhow::Error),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upload(_) => "upload",
            Self::Generation(_) => "generation",
        }
    }
}

#[derive(Clone)]
pub struct SubtitlePipeline {
    uploader: Arc<dyn MediaUploader>,
    generator: Arc<dyn SubtitleGenerator>,
}

impl SubtitlePipeline {
    pub fn new(uploader: Arc<dyn MediaUploader>, generator: Arc<dyn SubtitleGenerator>) -> Self {
        Self {
            uploader,
            generator,
        }
    }

    /// Blocking. Call from `spawn_blocking`.
    pub fn run(&self, staged: &StagedUpload) -> Result<String, PipelineError> {
        let metadata = staged.metadata();
        let reference = self
            .uploader
            .upload(staged.path(), metadata)
            .map_err(PipelineError::Upload)?;
        info!(
            file = %metadata.original_name,
            uri = %reference.uri,
            "video uploaded to storage"
        );

        let subs = self
            .generator
            .generate(&reference)
            .map_err(PipelineError::Generation)?;
        debug!(chars = subs.len(), "subtitles generated");
        Ok(subs)
    }
}

#[cfg(test)]
pub(crate) mod stubs {
    use super::*;
    use anyhow::bail;
    use parking_lot::Mutex;

    /// Records every call and either returns `reference` or fails.
    pub struct StubUploader {
        reference: Option<MediaReference>,
        pub calls: Mutex<Vec<(UploadMetadata, Vec<u8>)>>,
    }

    impl StubUploader {
        pub fn returning(uri: &str) -> Self {
            Self {
                reference: Some(MediaReference {
                    uri: uri.to_string(),
                    mime_type: "video/mp4".to_string(),
                    name: None,
                }),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                reference: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl MediaUploader for StubUploader {
        fn upload(&self, path: &Path, metadata: &UploadMetadata) -> anyhow::Result<MediaReference> {
            let bytes = std::fs::read(path)?;
            self.calls.lock().push((metadata.clone(), bytes));
            match &self.reference {
                Some(reference) => Ok(reference.clone()),
                None => bail!("storage quota exceeded"),
            }
        }
    }

    pub struct StubGenerator {
        text: Option<String>,
        pub calls: Mutex<Vec<MediaReference>>,
    }

    impl StubGenerator {
        pub fn returning(text: &str) -> Self {
            Self {
                text: Some(text.to_string()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                text: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl SubtitleGenerator for StubGenerator {
        fn generate(&self, reference: &MediaReference) -> anyhow::Result<String> {
            self.calls.lock().push(reference.clone());
            match &self.text {
                Some(text) => Ok(text.clone()),
                None => bail!("model overloaded"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stubs::{StubGenerator, StubUploader};
    use super::*;
    use crate::scratch::ScratchDir;
    use tempfile::tempdir;

    const SRT: &str = "1\n00:00:00,000 --> 00:00:02,000\nHello\n";

    fn staged_clip(scratch: &ScratchDir) -> StagedUpload {
        let mut staged = scratch.stage("clip.mp4", Some("video/mp4")).unwrap();
        staged.write_blocking(b"fake mp4 bytes").unwrap();
        staged
    }

    #[test]
    fn run_passes_reference_to_generator() {
        let dir = tempdir().unwrap();
        let scratch = ScratchDir::at(dir.path()).unwrap();
        let uploader = Arc::new(StubUploader::returning("ref-123"));
        let generator = Arc::new(StubGenerator::returning(SRT));
        let pipeline = SubtitlePipeline::new(uploader.clone(), generator.clone());

        let subs = pipeline.run(&staged_clip(&scratch)).unwrap();

        assert_eq!(subs, SRT);
        let uploads = uploader.calls.lock();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0.original_name, "clip.mp4");
        assert_eq!(uploads[0].0.size, 14);
        assert_eq!(uploads[0].1, b"fake mp4 bytes");
        assert_eq!(generator.calls.lock()[0].uri, "ref-123");
    }

    #[test]
    fn upload_failure_skips_generation() {
        let dir = tempdir().unwrap();
        let scratch = ScratchDir::at(dir.path()).unwrap();
        let generator = Arc::new(StubGenerator::returning(SRT));
        let pipeline = SubtitlePipeline::new(Arc::new(StubUploader::failing()), generator.clone());

        let err = pipeline.run(&staged_clip(&scratch)).unwrap_err();

        assert!(matches!(err, PipelineError::Upload(_)));
        assert_eq!(err.kind(), "upload");
        assert_eq!(err.to_string(), "storage upload failed: storage quota exceeded");
        assert!(generator.calls.lock().is_empty());
    }

    #[test]
    fn generation_failure_is_reported_separately() {
        let dir = tempdir().unwrap();
        let scratch = ScratchDir::at(dir.path()).unwrap();
        let pipeline = SubtitlePipeline::new(
            Arc::new(StubUploader::returning("ref-123")),
            Arc::new(StubGenerator::failing()),
        );

        let err = pipeline.run(&staged_clip(&scratch)).unwrap_err();

        assert_eq!(err.kind(), "generation");
        assert_eq!(err.to_string(), "subtitle generation failed: model overloaded");
    }
}
