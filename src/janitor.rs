use std::{io::ErrorKind, path::PathBuf};

use tokio::time::Duration;
use tracing::{info, warn};

/// Grace period between handing an artifact to the caller and deleting it.
pub const ARTIFACT_DELETE_DELAY: Duration = Duration::from_secs(60);

/// Removes `path` after `delay`. Deletion failure is logged and swallowed;
/// it is never retried and never reaches the caller.
pub fn schedule_delete(path: PathBuf, delay: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("deleted artifact {}", path.display()),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                info!("artifact {} already removed", path.display());
            }
            Err(error) => warn!("could not delete artifact {}: {error}", path.display()),
        }
    })
}
