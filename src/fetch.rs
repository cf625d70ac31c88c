use std::{io::ErrorKind, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::debug;

/// Retry/timeout budget handed to yt-dlp; there is no outer timeout and no
/// cancellation once a fetch starts.
const FETCH_RETRIES: &str = "5";
const SOCKET_TIMEOUT_SECONDS: &str = "30";

/// Marker for machine-readable progress lines on the child's stdout.
const PROGRESS_PREFIX: &str = "__ytcomet_progress__";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("yt-dlp is not installed on this system")]
    MissingBinary,
    #[error("could not run yt-dlp: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
    #[error("File not found!")]
    NoArtifacts,
}

/// One reported chunk of download progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed: f64,
    pub eta: u64,
}

/// Receives progress events during a fetch. The collaborator decides which
/// task invokes this, so implementations must be safe to call from anywhere.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// A source stream enumerated by the collaborator's metadata probe.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceFormat {
    pub format_id: String,
    #[serde(default)]
    pub format_note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeInfo {
    #[serde(default)]
    formats: Vec<SourceFormat>,
}

/// Post-download processing requested from the collaborator.
#[derive(Debug, Clone)]
pub enum Postprocess {
    /// Extract the audio track into the given codec at the given quality.
    ExtractAudio { codec: &'static str, quality: String },
    /// Merge the selected streams into the given container.
    Merge { container: &'static str },
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub selector: String,
    pub output_template: String,
    pub postprocess: Postprocess,
}

/// Boundary to the external media-fetch/transcode collaborator. Format
/// resolution, chunked I/O and retries all live behind this seam.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn probe_formats(&self, url: &str) -> Result<Vec<SourceFormat>, FetchError>;

    /// Runs one fetch to completion, pushing every reported chunk into
    /// `observer`. Returns the path of every artifact the collaborator
    /// produced (playlists yield several).
    async fn fetch(
        &self,
        request: &FetchRequest,
        observer: &dyn ProgressObserver,
    ) -> Result<Vec<PathBuf>, FetchError>;
}

/// Production fetcher: drives the `yt-dlp` executable as a subprocess.
#[derive(Debug, Clone, Default)]
pub struct YtDlpFetcher {
    cookie_jar: Option<PathBuf>,
}

impl YtDlpFetcher {
    pub fn new(cookie_jar: Option<PathBuf>) -> Self {
        Self { cookie_jar }
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new("yt-dlp");
        command.arg("--no-warnings");
        if let Some(jar) = &self.cookie_jar {
            command.arg("--cookies").arg(jar);
        }
        command
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn probe_formats(&self, url: &str) -> Result<Vec<SourceFormat>, FetchError> {
        let mut command = self.base_command();
        command.arg("-J").arg(url);
        command.stdin(Stdio::null());

        let output = command.output().await.map_err(spawn_error)?;
        if !output.status.success() {
            return Err(FetchError::Failed(condense_stderr(&String::from_utf8_lossy(
                &output.stderr,
            ))));
        }

        let info: ProbeInfo = serde_json::from_slice(&output.stdout)
            .map_err(|error| FetchError::Failed(format!("could not parse metadata: {error}")))?;
        Ok(info.formats)
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        observer: &dyn ProgressObserver,
    ) -> Result<Vec<PathBuf>, FetchError> {
        let mut command = self.base_command();
        command
            .args(["--quiet", "--progress", "--newline"])
            .args(["--retries", FETCH_RETRIES])
            .args(["--socket-timeout", SOCKET_TIMEOUT_SECONDS])
            .args(["--progress-template", &progress_template()])
            .args(["--print", "after_move:filepath"])
            .args(["-f", &request.selector])
            .args(["-o", &request.output_template]);

        match &request.postprocess {
            Postprocess::ExtractAudio { codec, quality } => {
                command.args(["-x", "--audio-format", codec, "--audio-quality", quality]);
            }
            Postprocess::Merge { container } => {
                command.args(["--merge-output-format", container]);
            }
        }

        command.arg(&request.url);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(spawn_error)?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FetchError::Failed("yt-dlp stderr was not captured".to_string()))?;
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Failed("yt-dlp stdout was not captured".to_string()))?;
        let mut artifacts = Vec::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(event) = parse_progress_line(&line) {
                observer.on_progress(event);
            } else if !line.trim().is_empty() {
                // Anything else on stdout is a printed artifact path.
                artifacts.push(PathBuf::from(line.trim()));
            }
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(FetchError::Failed(condense_stderr(&stderr_text)));
        }

        debug!("yt-dlp produced {} artifact(s) for {}", artifacts.len(), request.url);
        Ok(artifacts)
    }
}

fn spawn_error(error: std::io::Error) -> FetchError {
    if error.kind() == ErrorKind::NotFound {
        FetchError::MissingBinary
    } else {
        FetchError::Io(error)
    }
}

fn progress_template() -> String {
    format!(
        "download:{PROGRESS_PREFIX} %(progress.downloaded_bytes|0)s \
         %(progress.total_bytes|0)s %(progress.total_bytes_estimate|0)s \
         %(progress.speed|0)s %(progress.eta|0)s"
    )
}

fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let mut fields = rest.split_whitespace();
    let downloaded_bytes = parse_count(fields.next()?)?;
    let total_bytes = parse_count(fields.next()?)?;
    let total_bytes_estimate = parse_count(fields.next()?)?;
    let speed = parse_quantity(fields.next()?)?;
    let eta = parse_count(fields.next()?)?;

    Some(ProgressEvent {
        downloaded_bytes,
        // Fall back to the estimate when the exact total is unknown.
        total_bytes: if total_bytes > 0 {
            total_bytes
        } else {
            total_bytes_estimate
        },
        speed,
        eta,
    })
}

// yt-dlp renders unknown numeric fields as "NA" or a float string.
fn parse_quantity(field: &str) -> Option<f64> {
    if field == "NA" {
        Some(0.0)
    } else {
        field.parse().ok()
    }
}

fn parse_count(field: &str) -> Option<u64> {
    parse_quantity(field).map(|value| value.max(0.0) as u64)
}

/// The last non-empty stderr line is the most specific failure reason.
fn condense_stderr(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string()
}
