use std::{
    path::PathBuf,
    sync::Arc,
};

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    fetch::{
        FetchError, FetchRequest, MediaFetcher, Postprocess, ProgressEvent, ProgressObserver,
        SourceFormat,
    },
    janitor::{self, ARTIFACT_DELETE_DELAY},
    progress::{ProgressRecord, ProgressStore, compute_percent},
};

/// Quality label to provider stream id. Hardcoded identifiers tied to the
/// provider's current catalog; a table miss falls through to enumeration.
const AUDIO_BITRATE_TABLE: [(&str, &str); 3] = [("128k", "140"), ("192k", "251"), ("320k", "256")];

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Mp3,
    Mp4,
}

/// Writes every reported chunk into the shared store under the job key.
struct StoreObserver {
    progress: Arc<ProgressStore>,
    key: String,
}

impl ProgressObserver for StoreObserver {
    fn on_progress(&self, event: ProgressEvent) {
        self.progress.update_with(&self.key, |record| {
            record.progress =
                compute_percent(event.downloaded_bytes, event.total_bytes, record.progress);
            record.downloaded_bytes = event.downloaded_bytes;
            record.total_bytes = event.total_bytes;
            record.speed = event.speed;
            record.eta = event.eta;
        });
    }
}

/// Orchestrates one download job end to end: progress reset, stream
/// selection, the blocking fetch, terminal progress state and deferred
/// artifact cleanup.
pub struct DownloadCoordinator {
    fetcher: Arc<dyn MediaFetcher>,
    progress: Arc<ProgressStore>,
    downloads_dir: PathBuf,
}

impl DownloadCoordinator {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        progress: Arc<ProgressStore>,
        downloads_dir: PathBuf,
    ) -> Self {
        Self {
            fetcher,
            progress,
            downloads_dir,
        }
    }

    /// Blocks the caller for the full download. Returns every artifact the
    /// job produced (playlists yield several) and schedules each for
    /// deletion after the grace period.
    pub async fn run_job(
        &self,
        url: &str,
        kind: FormatKind,
        quality: &str,
    ) -> Result<Vec<PathBuf>, FetchError> {
        self.progress.set(url, ProgressRecord::reset(Utc::now()));

        let output_template = format!(
            "{}/%(title)s_{quality}.%(ext)s",
            self.downloads_dir.display()
        );
        let request = match kind {
            FormatKind::Mp3 => {
                let formats = self.fetcher.probe_formats(url).await?;
                FetchRequest {
                    url: url.to_owned(),
                    selector: resolve_audio_selector(&formats, quality),
                    output_template,
                    postprocess: Postprocess::ExtractAudio {
                        codec: "mp3",
                        quality: quality.to_owned(),
                    },
                }
            }
            FormatKind::Mp4 => FetchRequest {
                url: url.to_owned(),
                selector: format!("bestvideo[height<={quality}]+bestaudio/best/best"),
                output_template,
                postprocess: Postprocess::Merge { container: "mp4" },
            },
        };

        let observer = StoreObserver {
            progress: Arc::clone(&self.progress),
            key: url.to_owned(),
        };

        let produced = match self.fetcher.fetch(&request, &observer).await {
            Ok(produced) => produced,
            Err(error) => {
                // The record stays at its last-known progress; pollers read
                // the stall below 100 as failure.
                warn!("fetch failed for {url}: {error}");
                return Err(error);
            }
        };

        self.progress.mark_complete(url);

        let mut artifacts = Vec::new();
        for path in produced {
            let resolved = match kind {
                FormatKind::Mp3 => prefer_extracted_audio(path).await,
                FormatKind::Mp4 => path,
            };
            if tokio::fs::try_exists(&resolved).await.unwrap_or(false) {
                artifacts.push(resolved);
            } else {
                warn!("reported artifact missing on disk: {}", resolved.display());
            }
        }

        if artifacts.is_empty() {
            return Err(FetchError::NoArtifacts);
        }

        for artifact in &artifacts {
            janitor::schedule_delete(artifact.clone(), ARTIFACT_DELETE_DELAY);
        }

        info!("job for {url} produced {} artifact(s)", artifacts.len());
        Ok(artifacts)
    }
}

/// Best-effort mapping of a quality label to a concrete stream id; not a
/// guarantee of exact bitrate. Unknown labels fall back to the last
/// enumerated audio stream, then to a generic selector.
fn resolve_audio_selector(formats: &[SourceFormat], quality: &str) -> String {
    if let Some((_, stream_id)) = AUDIO_BITRATE_TABLE
        .iter()
        .find(|(label, _)| *label == quality)
    {
        return (*stream_id).to_string();
    }

    formats
        .iter()
        .filter(|format| {
            format
                .format_note
                .as_deref()
                .is_some_and(|note| note.to_ascii_lowercase().contains("audio"))
        })
        .next_back()
        .map(|format| format.format_id.clone())
        .unwrap_or_else(|| "bestaudio/best".to_string())
}

/// Audio extraction is a post-process step, so the collaborator may report
/// the original container. Prefer the extracted sibling when it exists.
async fn prefer_extracted_audio(path: PathBuf) -> PathBuf {
    if path.extension().and_then(|ext| ext.to_str()) == Some("mp3") {
        return path;
    }
    let sibling = path.with_extension("mp3");
    if tokio::fs::try_exists(&sibling).await.unwrap_or(false) {
        sibling
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    };

    use async_trait::async_trait;

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let dir = std::env::temp_dir().join(format!(
            "ytcomet-dl-{name}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    fn note(value: &str) -> Option<String> {
        Some(value.to_string())
    }

    #[derive(Default)]
    struct MockFetcher {
        formats: Vec<SourceFormat>,
        /// Paths to report; those paired with `true` are created on disk.
        produce: Vec<(PathBuf, bool)>,
        events: Vec<ProgressEvent>,
        fail_with: Option<String>,
        seen_selectors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaFetcher for MockFetcher {
        async fn probe_formats(&self, _url: &str) -> Result<Vec<SourceFormat>, FetchError> {
            Ok(self.formats.clone())
        }

        async fn fetch(
            &self,
            request: &FetchRequest,
            observer: &dyn ProgressObserver,
        ) -> Result<Vec<PathBuf>, FetchError> {
            self.seen_selectors
                .lock()
                .expect("selector log lock")
                .push(request.selector.clone());

            for event in &self.events {
                observer.on_progress(*event);
            }
            if let Some(message) = &self.fail_with {
                return Err(FetchError::Failed(message.clone()));
            }

            let mut reported = Vec::new();
            for (path, materialize) in &self.produce {
                if *materialize {
                    std::fs::write(path, b"media").expect("materialize artifact");
                }
                reported.push(path.clone());
            }
            Ok(reported)
        }
    }

    fn coordinator(
        fetcher: MockFetcher,
        dir: &PathBuf,
    ) -> (DownloadCoordinator, Arc<MockFetcher>, Arc<ProgressStore>) {
        let fetcher = Arc::new(fetcher);
        let progress = Arc::new(ProgressStore::new());
        let coordinator = DownloadCoordinator::new(
            Arc::clone(&fetcher) as Arc<dyn MediaFetcher>,
            Arc::clone(&progress),
            dir.clone(),
        );
        (coordinator, fetcher, progress)
    }

    fn last_selector(fetcher: &MockFetcher) -> String {
        fetcher
            .seen_selectors
            .lock()
            .expect("selector log lock")
            .last()
            .cloned()
            .expect("fetch was never invoked")
    }

    #[tokio::test]
    async fn mp3_at_192k_resolves_stream_251_and_prefers_the_extracted_file() {
        let dir = scratch_dir("mp3-192k");
        let container = dir.join("Song_192k.m4a");
        let extracted = dir.join("Song_192k.mp3");
        std::fs::write(&extracted, b"mp3").expect("materialize extracted sibling");

        let fetcher = MockFetcher {
            produce: vec![(container, true)],
            ..Default::default()
        };
        let (coordinator, fetcher, progress) = coordinator(fetcher, &dir);

        let url = "https://x/y";
        let artifacts = coordinator
            .run_job(url, FormatKind::Mp3, "192k")
            .await
            .expect("job should succeed");

        assert_eq!(last_selector(&fetcher), "251");
        assert_eq!(artifacts, vec![dir.join("Song_192k.mp3")]);
        assert_eq!(progress.get(url).progress, 100.0);
    }

    #[tokio::test]
    async fn table_hit_wins_over_enumerated_formats() {
        let dir = scratch_dir("table-hit");
        let artifact = dir.join("a_192k.mp3");
        let fetcher = MockFetcher {
            formats: vec![SourceFormat {
                format_id: "999".to_string(),
                format_note: note("high audio"),
            }],
            produce: vec![(artifact, true)],
            ..Default::default()
        };
        let (coordinator, fetcher, _) = coordinator(fetcher, &dir);

        coordinator
            .run_job("https://x/y", FormatKind::Mp3, "192k")
            .await
            .expect("job should succeed");

        // The enumerated stream loses to the table entry.
        assert_eq!(last_selector(&fetcher), "251");
        assert_eq!(resolve_audio_selector(&[], "128k"), "140");
        assert_eq!(resolve_audio_selector(&[], "320k"), "256");
    }

    #[test]
    fn unknown_quality_falls_back_to_the_last_enumerated_audio_stream() {
        let formats = vec![
            SourceFormat {
                format_id: "137".to_string(),
                format_note: note("1080p"),
            },
            SourceFormat {
                format_id: "139".to_string(),
                format_note: note("low audio"),
            },
            SourceFormat {
                format_id: "141".to_string(),
                format_note: note("medium Audio"),
            },
        ];
        assert_eq!(resolve_audio_selector(&formats, "64k"), "141");
    }

    #[test]
    fn no_enumerable_audio_falls_back_to_the_generic_selector() {
        assert_eq!(resolve_audio_selector(&[], "64k"), "bestaudio/best");
    }

    #[tokio::test]
    async fn video_selector_embeds_the_height_ceiling() {
        let dir = scratch_dir("video");
        let artifact = dir.join("Clip_720.mp4");
        let fetcher = MockFetcher {
            produce: vec![(artifact.clone(), true)],
            ..Default::default()
        };
        let (coordinator, fetcher, progress) = coordinator(fetcher, &dir);

        let artifacts = coordinator
            .run_job("https://x/v", FormatKind::Mp4, "720")
            .await
            .expect("job should succeed");

        assert_eq!(
            last_selector(&fetcher),
            "bestvideo[height<=720]+bestaudio/best/best"
        );
        assert_eq!(artifacts, vec![artifact]);
        assert_eq!(progress.get("https://x/v").progress, 100.0);
    }

    #[tokio::test]
    async fn a_failed_fetch_leaves_progress_below_one_hundred() {
        let dir = scratch_dir("failure");
        let fetcher = MockFetcher {
            events: vec![ProgressEvent {
                downloaded_bytes: 40,
                total_bytes: 100,
                speed: 10.0,
                eta: 6,
            }],
            fail_with: Some("ERROR: network unreachable".to_string()),
            ..Default::default()
        };
        let (coordinator, _, progress) = coordinator(fetcher, &dir);

        let url = "https://x/broken";
        let error = coordinator
            .run_job(url, FormatKind::Mp4, "1080")
            .await
            .expect_err("job should fail");

        assert_eq!(error.to_string(), "ERROR: network unreachable");
        let record = progress.get(url);
        assert_eq!(record.progress, 40.0);
        assert_eq!(record.downloaded_bytes, 40);
    }

    #[tokio::test]
    async fn a_new_job_resets_a_stale_record_before_fetching() {
        let dir = scratch_dir("reset");
        let fetcher = MockFetcher {
            fail_with: Some("ERROR: no formats".to_string()),
            ..Default::default()
        };
        let (coordinator, _, progress) = coordinator(fetcher, &dir);

        let url = "https://x/retry";
        progress.update_with(url, |record| record.progress = 55.0);

        let _ = coordinator.run_job(url, FormatKind::Mp4, "480").await;
        assert_eq!(progress.get(url).progress, 0.0);
    }

    #[tokio::test]
    async fn playlists_keep_every_artifact_that_made_it_to_disk() {
        let dir = scratch_dir("playlist");
        let fetcher = MockFetcher {
            produce: vec![
                (dir.join("One_720.mp4"), true),
                (dir.join("Two_720.mp4"), false),
                (dir.join("Three_720.mp4"), true),
            ],
            ..Default::default()
        };
        let (coordinator, _, _) = coordinator(fetcher, &dir);

        let artifacts = coordinator
            .run_job("https://x/playlist", FormatKind::Mp4, "720")
            .await
            .expect("job should succeed with the surviving artifacts");

        assert_eq!(
            artifacts,
            vec![dir.join("One_720.mp4"), dir.join("Three_720.mp4")]
        );
    }

    #[tokio::test]
    async fn zero_surviving_artifacts_fails_the_job() {
        let dir = scratch_dir("empty");
        let fetcher = MockFetcher {
            produce: vec![(dir.join("Gone_720.mp4"), false)],
            ..Default::default()
        };
        let (coordinator, _, _) = coordinator(fetcher, &dir);

        let error = coordinator
            .run_job("https://x/none", FormatKind::Mp4, "720")
            .await
            .expect_err("job should fail");
        assert!(matches!(error, FetchError::NoArtifacts));
    }

    #[tokio::test]
    async fn synthetic_progress_is_used_when_the_total_is_unknown() {
        let dir = scratch_dir("synthetic");
        let events = (0..10)
            .map(|step| ProgressEvent {
                downloaded_bytes: step * 1000,
                total_bytes: 0,
                speed: 0.0,
                eta: 0,
            })
            .collect();
        let fetcher = MockFetcher {
            events,
            fail_with: Some("ERROR: interrupted".to_string()),
            ..Default::default()
        };
        let (coordinator, _, progress) = coordinator(fetcher, &dir);

        let url = "https://x/unknown-total";
        let _ = coordinator.run_job(url, FormatKind::Mp4, "720").await;
        assert_eq!(progress.get(url).progress, 10.0);
    }
}
