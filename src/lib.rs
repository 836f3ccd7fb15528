#![forbid(unsafe_code)]

//! Upload a video, get subtitles back.
//!
//! The `backend` binary serves `POST /api/subs/` plus the static page under
//! `www/`; `subs_client` is the command-line counterpart of that page.

pub mod client;
pub mod config;
pub mod export;
pub mod gemini;
pub mod pipeline;
pub mod scratch;
pub mod server;
pub mod telemetry;
