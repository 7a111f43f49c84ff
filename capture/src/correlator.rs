//! Motion correlation: find the segment a motion signal belongs to, move it
//! into `motion/`, and hand it to the notifier.
//!
//! Correlations for the same segment label are serialized on a claim lock
//! held from the directory scan until the rename has finished, so two
//! signals can never pick the same file.  Cameras only ever look at their
//! own label, so different cameras do not contend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{debug, info, warn};

use doorwatch_common::segment;

use crate::notifier::Notifier;

/// One motion signal, resolved against the session.
#[derive(Debug, Clone)]
pub struct MotionEvent {
    pub camera_id: String,
    pub camera_name: String,
    /// Label of the camera's segments.
    pub label: String,
    pub location_name: String,
    pub occurred_at: DateTime<Local>,
}

#[derive(Debug, Error)]
pub enum CorrelateError {
    #[error("cannot scan {}: {source}", dir.display())]
    Locate {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("{} already exists", .0.display())]
    DestinationExists(PathBuf),

    #[error("cannot move {} to {}: {source}", from.display(), to.display())]
    Relocation {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

pub struct Correlator {
    output_dir: PathBuf,
    motion_dir: PathBuf,
    window: chrono::Duration,
    notifier: Option<Notifier>,
    claims: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Correlator {
    pub fn new(output_dir: &Path, window: chrono::Duration, notifier: Option<Notifier>) -> Self {
        Correlator {
            output_dir: output_dir.to_path_buf(),
            motion_dir: output_dir.join("motion"),
            window,
            notifier,
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Lock guarding the segments written under `label`.
    fn claim_lock(&self, label: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.entry(label.to_string()).or_default().clone()
    }

    /// Handle one motion signal.
    ///
    /// Returns the relocated segment, or `None` when no segment of the camera
    /// started within the window before the signal.  The notification is
    /// sent from a detached task and its outcome is not reported here.
    pub async fn handle_motion(&self, event: &MotionEvent) -> Result<Option<PathBuf>, CorrelateError> {
        info!("Motion detected on camera {}", event.camera_name);

        let lock = self.claim_lock(&event.label);
        let _claim = lock.lock().await;

        let Some(found) = self.locate(event).await? else {
            info!("No recent motion video found for camera {}", event.camera_name);
            return Ok(None);
        };

        let from = self.output_dir.join(&found.file_name);
        let to = self.motion_dir.join(&found.file_name);
        relocate(&from, &to).await?;
        info!("Moved {} → {}", from.display(), to.display());

        match &self.notifier {
            Some(notifier) => {
                notifier.spawn_notify(
                    event.camera_name.clone(),
                    event.location_name.clone(),
                    event.occurred_at,
                    to.clone(),
                );
            }
            None => warn!("WEBHOOK_URL not set – not sending notification for {}", found.file_name),
        }

        Ok(Some(to))
    }

    async fn locate(&self, event: &MotionEvent) -> Result<Option<segment::Segment>, CorrelateError> {
        let dir = self.output_dir.clone();
        let label = event.label.clone();
        let reference = event.occurred_at.naive_local();
        let window = self.window;

        let scan_dir = dir.clone();
        let found = tokio::task::spawn_blocking(move || {
            segment::find_most_recent_segment(&scan_dir, Some(&label), reference, window)
        })
        .await
        .map_err(|e| CorrelateError::Locate {
            dir: dir.clone(),
            source: std::io::Error::other(e),
        })?
        .map_err(|source| CorrelateError::Locate { dir, source })?;

        if let Some(s) = &found {
            debug!("Matched {} for camera {}", s.file_name, event.camera_id);
        }
        Ok(found)
    }
}

/// Move `from` to `to` with a rename, refusing to overwrite.
async fn relocate(from: &Path, to: &Path) -> Result<(), CorrelateError> {
    let relocation = |source| CorrelateError::Relocation {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(relocation)?;
    }
    if tokio::fs::try_exists(to).await.map_err(relocation)? {
        return Err(CorrelateError::DestinationExists(to.to_path_buf()));
    }
    tokio::fs::rename(from, to).await.map_err(relocation)
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::StatusCode;
    use chrono::Duration;
    use doorwatch_common::segment::Segment;

    use crate::notifier::tests::fake_webhook;

    fn event(camera_id: &str, occurred_at: DateTime<Local>) -> MotionEvent {
        MotionEvent {
            camera_id: camera_id.to_string(),
            camera_name: camera_id.to_uppercase(),
            label: segment::label_for(camera_id),
            location_name: "Home".to_string(),
            occurred_at,
        }
    }

    /// Write a segment for `label` that started `secs_ago` before `now`.
    fn record(dir: &Path, label: &str, now: DateTime<Local>, secs_ago: i64) -> String {
        let name = Segment::file_name_for(now.naive_local() - Duration::seconds(secs_ago), label);
        std::fs::write(dir.join(&name), b"segment").unwrap();
        name
    }

    fn correlator(dir: &Path, notifier: Option<Notifier>) -> Correlator {
        Correlator::new(dir, Duration::seconds(60), notifier)
    }

    #[tokio::test]
    async fn test_moves_latest_segment() {
        let tmp = tempfile::tempdir().unwrap();
        let now = Local::now();
        record(tmp.path(), "front", now, 40);
        let newest = record(tmp.path(), "front", now, 5);

        let moved = correlator(tmp.path(), None)
            .handle_motion(&event("front", now))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(moved, tmp.path().join("motion").join(&newest));
        assert!(moved.exists());
        assert!(!tmp.path().join(&newest).exists());
    }

    #[tokio::test]
    async fn test_miss_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let now = Local::now();
        let old = record(tmp.path(), "front", now, 65);

        let moved = correlator(tmp.path(), None)
            .handle_motion(&event("front", now))
            .await
            .unwrap();

        assert_eq!(moved, None);
        assert!(tmp.path().join(old).exists());
    }

    #[tokio::test]
    async fn test_other_cameras_segments_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let now = Local::now();
        let garage = record(tmp.path(), "garage", now, 2);

        let moved = correlator(tmp.path(), None)
            .handle_motion(&event("front", now))
            .await
            .unwrap();

        assert_eq!(moved, None);
        assert!(tmp.path().join(garage).exists());
    }

    #[tokio::test]
    async fn test_destination_exists_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let now = Local::now();
        let name = record(tmp.path(), "front", now, 5);
        std::fs::create_dir(tmp.path().join("motion")).unwrap();
        std::fs::write(tmp.path().join("motion").join(&name), b"older").unwrap();

        let err = correlator(tmp.path(), None)
            .handle_motion(&event("front", now))
            .await
            .unwrap_err();

        assert!(matches!(err, CorrelateError::DestinationExists(_)));
        // the source stays where it was
        assert!(tmp.path().join(&name).exists());
    }

    #[tokio::test]
    async fn test_concurrent_signals_never_share_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let now = Local::now();
        record(tmp.path(), "front", now, 30);
        record(tmp.path(), "front", now, 10);

        let correlator = Arc::new(correlator(tmp.path(), None));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let correlator = correlator.clone();
                tokio::spawn(async move { correlator.handle_motion(&event("front", now)).await })
            })
            .collect();

        let mut moved = Vec::new();
        for handle in handles {
            if let Some(path) = handle.await.unwrap().unwrap() {
                moved.push(path);
            }
        }

        moved.sort();
        moved.dedup();
        assert_eq!(moved.len(), 2);
        assert_eq!(std::fs::read_dir(tmp.path().join("motion")).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_signals_sharing_a_label_never_share_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let now = Local::now();
        record(tmp.path(), "side", now, 30);
        record(tmp.path(), "side", now, 10);

        let correlator = Arc::new(correlator(tmp.path(), None));
        let handles: Vec<_> = ["side", "Side", "side_", "SIDE"]
            .into_iter()
            .map(|camera_id| {
                let correlator = correlator.clone();
                let event = event(camera_id, now);
                assert_eq!(event.label, "side");
                tokio::spawn(async move { correlator.handle_motion(&event).await })
            })
            .collect();

        let mut moved = Vec::new();
        for handle in handles {
            if let Some(path) = handle.await.unwrap().unwrap() {
                moved.push(path);
            }
        }

        moved.sort();
        moved.dedup();
        assert_eq!(moved.len(), 2);
        assert_eq!(correlator.claims.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_failure_does_not_block_next_signal() {
        let tmp = tempfile::tempdir().unwrap();
        let (url, captured) = fake_webhook(StatusCode::INTERNAL_SERVER_ERROR).await;
        let correlator = correlator(tmp.path(), Some(Notifier::new(&url).unwrap()));

        let now = Local::now();
        record(tmp.path(), "front", now, 20);
        assert!(correlator.handle_motion(&event("front", now)).await.unwrap().is_some());

        record(tmp.path(), "front", now, 1);
        assert!(correlator.handle_motion(&event("front", now)).await.unwrap().is_some());

        // both notifications were attempted even though the first one failed
        for _ in 0..50 {
            if captured.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(captured.lock().unwrap().len(), 2);
    }
}
