#![forbid(unsafe_code)]

//! Gemini-backed implementations of the storage and subtitle collaborators.
//!
//! The Files API hands out a `uri` that `generateContent` can reference, so a
//! single client plays both roles. Calls are blocking (`ureq`); the server runs
//! them inside `spawn_blocking`.

use std::{
    fs::File,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use mime_guess::MimeGuess;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::GeminiConfig;
use crate::pipeline::{MediaReference, MediaUploader, SubtitleGenerator, UploadMetadata};

const API_KEY_HEADER: &str = "x-goog-api-key";
const UPLOAD_URL_HEADER: &str = "x-goog-upload-url";
const FALLBACK_MIME: &str = "application/octet-stream";

pub struct GeminiClient {
    agent: ureq::Agent,
    api_key: String,
    model: String,
    base_url: String,
    prompt: String,
    poll_interval: Duration,
    max_processing_wait: Duration,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: FileResource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    name: String,
    uri: String,
    mime_type: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<FileError>,
}

#[derive(Debug, Deserialize)]
struct FileError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            prompt: config.prompt.clone(),
            poll_interval: config.poll_interval,
            max_processing_wait: config.max_processing_wait,
        }
    }

    /// Resumable upload in one round trip: `start` hands back a session URL,
    /// `upload, finalize` sends the whole file to it.
    fn upload_file(&self, path: &Path, metadata: &UploadMetadata) -> Result<FileResource> {
        let mime = mime_type_for(metadata);
        let size = std::fs::metadata(path)
            .with_context(|| format!("reading size of {}", path.display()))?
            .len();

        let start = self
            .agent
            .post(&format!("{}/upload/v1beta/files", self.base_url))
            .set(API_KEY_HEADER, &self.api_key)
            .set("X-Goog-Upload-Protocol", "resumable")
            .set("X-Goog-Upload-Command", "start")
            .set("X-Goog-Upload-Header-Content-Length", &size.to_string())
            .set("X-Goog-Upload-Header-Content-Type", &mime)
            .send_json(json!({ "file": { "display_name": metadata.original_name } }));
        let start = check_status(start, "starting file upload")?;
        let session_url = start
            .header(UPLOAD_URL_HEADER)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("upload session response had no {UPLOAD_URL_HEADER} header"))?;

        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let finished = self
            .agent
            .post(&session_url)
            .set("Content-Length", &size.to_string())
            .set("X-Goog-Upload-Offset", "0")
            .set("X-Goog-Upload-Command", "upload, finalize")
            .send(file);
        let finished = check_status(finished, "uploading file bytes")?;
        let response: UploadResponse = finished
            .into_json()
            .context("decoding file upload response")?;
        Ok(response.file)
    }

    /// Videos are not usable until the service finishes processing them.
    fn wait_until_active(&self, mut file: FileResource) -> Result<FileResource> {
        // `None` when the configured wait does not fit in an `Instant`: no deadline.
        let deadline = Instant::now().checked_add(self.max_processing_wait);
        loop {
            match file.state.as_deref() {
                None | Some("ACTIVE") | Some("STATE_UNSPECIFIED") => return Ok(file),
                Some("FAILED") => {
                    let reason = file
                        .error
                        .map(|error| error.message)
                        .filter(|message| !message.is_empty())
                        .unwrap_or_else(|| "no reason given".to_string());
                    bail!("file {} failed processing: {reason}", file.name);
                }
                Some(state) => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        bail!(
                            "file {} still {state} after {}s",
                            file.name,
                            self.max_processing_wait.as_secs()
                        );
                    }
                    debug!(file = %file.name, state, "waiting for file processing");
                    thread::sleep(self.poll_interval);
                    file = self.fetch_file(&file.name)?;
                }
            }
        }
    }

    fn fetch_file(&self, name: &str) -> Result<FileResource> {
        let response = self
            .agent
            .get(&format!("{}/v1beta/{}", self.base_url, name))
            .set(API_KEY_HEADER, &self.api_key)
            .call();
        check_status(response, "polling file state")?
            .into_json()
            .context("decoding file state")
    }
}

impl MediaUploader for GeminiClient {
    fn upload(&self, path: &Path, metadata: &UploadMetadata) -> Result<MediaReference> {
        let uploaded = self.upload_file(path, metadata)?;
        info!(file = %uploaded.name, "uploaded video to Gemini Files API");
        let active = self.wait_until_active(uploaded)?;
        Ok(MediaReference {
            uri: active.uri,
            mime_type: active.mime_type.unwrap_or_else(|| mime_type_for(metadata)),
            name: Some(active.name),
        })
    }
}

impl SubtitleGenerator for GeminiClient {
    fn generate(&self, reference: &MediaReference) -> Result<String> {
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "fileData": { "mimeType": reference.mime_type, "fileUri": reference.uri } },
                    { "text": self.prompt },
                ],
            }],
        });
        let response = self
            .agent
            .post(&format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, self.model
            ))
            .set(API_KEY_HEADER, &self.api_key)
            .send_json(body);
        let response: GenerateResponse = check_status(response, "generating subtitles")?
            .into_json()
            .context("decoding generateContent response")?;
        extract_text(response)
    }
}

fn extract_text(response: GenerateResponse) -> Result<String> {
    let block_reason = response
        .prompt_feedback
        .and_then(|feedback| feedback.block_reason);
    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(match block_reason {
            Some(reason) => anyhow!("prompt was blocked: {reason}"),
            None => anyhow!("model returned no candidates"),
        });
    };

    let text: String = candidate
        .content
        .map(|content| content.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| part.text)
        .collect();
    if text.trim().is_empty() {
        let reason = candidate
            .finish_reason
            .unwrap_or_else(|| "unknown".to_string());
        bail!("model returned no subtitle text (finish reason: {reason})");
    }
    Ok(text)
}

fn mime_type_for(metadata: &UploadMetadata) -> String {
    metadata
        .content_type
        .as_deref()
        .filter(|value| *value != FALLBACK_MIME)
        .map(str::to_string)
        .or_else(|| {
            MimeGuess::from_path(&metadata.original_name)
                .first()
                .map(|mime| mime.to_string())
        })
        .unwrap_or_else(|| FALLBACK_MIME.to_string())
}

/// Turns non-2xx answers into errors that carry the response body, which is
/// where Google puts the useful part of the message.
fn check_status(
    result: std::result::Result<ureq::Response, ureq::Error>,
    action: &str,
) -> Result<ureq::Response> {
    match result {
        Ok(response) => Ok(response),
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            bail!("{action} returned HTTP {code}: {}", body.trim())
        }
        Err(err) => Err(anyhow!(err).context(format!("{action} failed"))),
    }
}
