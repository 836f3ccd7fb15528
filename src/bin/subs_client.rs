#![forbid(unsafe_code)]

//! Command-line version of the upload page: sends one video to the backend,
//! waits, and saves (or prints) the subtitles.

use std::{
    io::{self, Write},
    path::PathBuf,
    sync::mpsc::{self, RecvTimeoutError},
    thread,
};

use anyhow::{Context, Result};
use clap::Parser;
use mp4titles::{
    client::{STATUS_ROTATION, SubsClient, status_text},
    export::{SubtitleFormat, write_download},
    telemetry::init_tracing,
};

#[derive(Debug, Parser)]
#[command(name = "subs_client", about = "Generate subtitles for a video file")]
struct ClientArgs {
    /// Video to upload.
    video: PathBuf,
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,
    #[arg(long, value_enum, default_value_t = SubtitleFormat::Srt)]
    format: SubtitleFormat,
    /// File or directory to write to. Defaults to `subtitle.<format>` here.
    #[arg(long, short)]
    output: Option<PathBuf>,
    /// Print the subtitles instead of writing a file.
    #[arg(long, conflicts_with = "output")]
    stdout: bool,
}

fn main() -> Result<()> {
    let args = ClientArgs::parse();
    init_tracing("warn");

    let client = SubsClient::new(&args.server);
    let subs = with_status_ticker(|| client.submit(&args.video))?;

    if args.stdout {
        copy_out(&mut io::stdout().lock(), &subs)?;
        return Ok(());
    }

    let target = args.output.unwrap_or_else(|| PathBuf::from("."));
    let written = write_download(&subs, args.format, &target)
        .with_context(|| format!("writing subtitles to {}", target.display()))?;
    eprintln!("Saved subtitles to {}", written.display());
    Ok(())
}

/// Terminal stand-in for the page's copy button: the text, byte for byte.
fn copy_out(out: &mut impl Write, subs: &str) -> io::Result<()> {
    out.write_all(subs.as_bytes())?;
    out.flush()
}

/// Runs `work` while a helper thread rotates a status line on stderr.
fn with_status_ticker<T>(work: impl FnOnce() -> T) -> T {
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let ticker = thread::spawn(move || {
        let mut tick = 0;
        loop {
            eprintln!("{}...", status_text(tick));
            match done_rx.recv_timeout(STATUS_ROTATION) {
                Err(RecvTimeoutError::Timeout) => tick += 1,
                _ => break,
            }
        }
    });
    let result = work();
    let _ = done_tx.send(());
    let _ = ticker.join();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_args_defaults() {
        let args = ClientArgs::try_parse_from(["subs_client", "clip.mp4"]).unwrap();
        assert_eq!(args.video, PathBuf::from("clip.mp4"));
        assert_eq!(args.server, "http://127.0.0.1:8080");
        assert_eq!(args.format, SubtitleFormat::Srt);
        assert!(args.output.is_none());
        assert!(!args.stdout);
    }

    #[test]
    fn client_args_accept_txt_and_output() {
        let args = ClientArgs::try_parse_from([
            "subs_client",
            "clip.mp4",
            "--format",
            "txt",
            "-o",
            "out/",
        ])
        .unwrap();
        assert_eq!(args.format, SubtitleFormat::Txt);
        assert_eq!(args.output, Some(PathBuf::from("out/")));
    }

    #[test]
    fn stdout_conflicts_with_output() {
        assert!(
            ClientArgs::try_parse_from(["subs_client", "clip.mp4", "--stdout", "-o", "x.srt"])
                .is_err()
        );
        assert!(ClientArgs::try_parse_from(["subs_client", "clip.mp4", "--format", "vtt"]).is_err());
    }

    #[test]
    fn copy_out_writes_text_verbatim() {
        let srt = "1\n00:00:00,000 --> 00:00:02,000\nHello\n";
        let mut out = Vec::new();
        copy_out(&mut out, srt).unwrap();
        assert_eq!(out, srt.as_bytes());

        let mut out = Vec::new();
        copy_out(&mut out, "line one\r\nline two\r\n").unwrap();
        assert_eq!(out, b"line one\r\nline two\r\n");
    }

    #[test]
    fn status_ticker_returns_work_result() {
        assert_eq!(with_status_ticker(|| 42), 42);
    }
}
