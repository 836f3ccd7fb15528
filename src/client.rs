#![forbid(unsafe_code)]

//! Blocking client for `POST /api/subs/`, used by the `subs_client` binary.

use std::{
    fs,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, anyhow, bail};
use mime_guess::MimeGuess;
use serde::Deserialize;

use crate::server::VIDEO_FIELD;

pub const STATUS_ROTATION: Duration = Duration::from_secs(5);

/// Shown one after another while the request is in flight. The service
/// reports no progress, so these are purely cosmetic.
pub const LOADING_TEXTS: [&str; 5] = [
    "Processing your video",
    "This might take a while",
    "Analyzing video content",
    "Generating subtitles",
    "Almost there",
];

pub fn status_text(tick: usize) -> &'static str {
    LOADING_TEXTS[tick % LOADING_TEXTS.len()]
}

#[derive(Deserialize)]
struct SubsResponse {
    subs: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

pub struct SubsClient {
    agent: ureq::Agent,
    base_url: String,
}

impl SubsClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/subs/", self.base_url)
    }

    /// Uploads `video` and blocks until the server has produced subtitles.
    pub fn submit(&self, video: &Path) -> Result<String> {
        let data = fs::read(video).with_context(|| format!("reading {}", video.display()))?;
        let filename = video
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("video.mp4");
        let content_type = MimeGuess::from_path(video)
            .first()
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let boundary = multipart_boundary();
        let body = encode_multipart(&boundary, VIDEO_FIELD, filename, &content_type, &data);

        let result = self
            .agent
            .post(&self.endpoint())
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={boundary}"),
            )
            .send_bytes(&body);

        match result {
            Ok(response) => {
                let payload: SubsResponse = response
                    .into_json()
                    .context("decoding subtitle response")?;
                Ok(payload.subs)
            }
            Err(ureq::Error::Status(code, response)) => {
                let raw = response.into_string().unwrap_or_default();
                let message = serde_json::from_str::<ErrorResponse>(&raw)
                    .map(|body| body.error)
                    .unwrap_or(raw);
                bail!("server rejected the upload ({code}): {message}")
            }
            Err(err) => Err(anyhow!(err).context(format!("posting to {}", self.endpoint()))),
        }
    }
}

fn multipart_boundary() -> String {
    format!(
        "----mp4titles{:016x}",
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    )
}

/// Single-file `multipart/form-data` body, closing boundary included.
pub fn encode_multipart(
    boundary: &str,
    field: &str,
    filename: &str,
    content_type: &str,
    data: &[u8],
) -> Vec<u8> {
    let filename = filename.replace('"', "%22");
    let mut body = Vec::with_capacity(data.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
             Content-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}
