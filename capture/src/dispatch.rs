//! Event dispatch loop.
//!
//! Every camera gets a worker: a cancellation token (child of the service's
//! shutdown token) and a task tracker holding its encoder supervisor and its
//! in-flight motion correlations.  A call-ended signal cancels one worker and
//! leaves the others running.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Local;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use doorwatch_common::config::CameraConfig;

use crate::capture::{Recording, SegmentOptions};
use crate::correlator::{Correlator, MotionEvent};
use crate::session::{Location, Session, SessionEvent};

struct CameraWorker {
    camera: CameraConfig,
    location_name: String,
    token: CancellationToken,
    tasks: TaskTracker,
}

pub struct Dispatcher {
    session: Session,
    correlator: Arc<Correlator>,
    options: SegmentOptions,
    shutdown: CancellationToken,
    workers: HashMap<String, CameraWorker>,
}

impl Dispatcher {
    pub fn new(
        session: Session,
        correlator: Arc<Correlator>,
        options: SegmentOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Dispatcher {
            session,
            correlator,
            options,
            shutdown,
            workers: HashMap::new(),
        }
    }

    /// Register `camera` and start its encoder.
    pub fn start_camera(&mut self, location: &Location, camera: &CameraConfig) -> anyhow::Result<()> {
        let recording = self.session.stream_video(camera, &self.options)?;
        let worker = self.register(location, camera);
        supervise(recording, worker);
        Ok(())
    }

    /// Register `camera` so its signals are handled, without recording.
    fn register(&mut self, location: &Location, camera: &CameraConfig) -> &CameraWorker {
        let worker = CameraWorker {
            camera: camera.clone(),
            location_name: location.name.clone(),
            token: self.shutdown.child_token(),
            tasks: TaskTracker::new(),
        };
        self.workers.insert(camera.id.clone(), worker);
        &self.workers[&camera.id]
    }

    /// Consume session events until the channel closes or shutdown.
    pub async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
            }
        }

        info!("Stopping {} camera(s)", self.workers.len());
        for worker in self.workers.values() {
            worker.token.cancel();
            worker.tasks.close();
        }
        for worker in self.workers.values() {
            worker.tasks.wait().await;
        }
        info!("Dispatch loop stopped");
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        debug!("Session event: {event:?}");
        match event {
            SessionEvent::Motion {
                camera_id,
                occurred_at,
            } => self.on_motion(&camera_id, occurred_at),
            SessionEvent::CallEnded { camera_id } => self.on_call_ended(&camera_id),
            SessionEvent::TokenRotated { old, new } => self.on_token_rotated(old, new).await,
        }
    }

    fn on_motion(&self, camera_id: &str, occurred_at: chrono::DateTime<Local>) {
        let Some(worker) = self.workers.get(camera_id) else {
            warn!("Motion for unknown camera {camera_id}");
            return;
        };
        if worker.token.is_cancelled() {
            warn!("Motion for stopped camera {camera_id} ignored");
            return;
        }

        let event = MotionEvent {
            camera_id: worker.camera.id.clone(),
            camera_name: worker.camera.name.clone(),
            label: worker.camera.label(),
            location_name: worker.location_name.clone(),
            occurred_at,
        };
        let correlator = self.correlator.clone();
        let token = worker.token.clone();

        worker.tasks.spawn(async move {
            tokio::select! {
                result = correlator.handle_motion(&event) => {
                    if let Err(e) = result {
                        error!("Motion on camera {} not handled: {e}", event.camera_name);
                    }
                }
                _ = token.cancelled() => {
                    info!("Motion correlation for {} abandoned", event.camera_id);
                }
            }
        });
    }

    /// Rewrites the config file on the blocking pool; awaited so rotations
    /// are applied in the order they arrived.
    async fn on_token_rotated(&self, old: Option<String>, new: String) {
        let session = self.session.clone();
        let rotated =
            tokio::task::spawn_blocking(move || session.rotate_token(old.as_deref(), &new)).await;
        match rotated {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                "Failed to persist rotated refresh token: {e} – \
                 the next start will authenticate with a revoked token"
            ),
            Err(e) => error!("Token rotation task failed: {e}"),
        }
    }

    fn on_call_ended(&self, camera_id: &str) {
        match self.workers.get(camera_id) {
            Some(worker) => {
                info!("Call has ended for camera {}", worker.camera.name);
                worker.token.cancel();
                worker.tasks.close();
            }
            None => warn!("Call ended for unknown camera {camera_id}"),
        }
    }
}

/// Keep the encoder running until it exits or the camera is stopped.
fn supervise(mut recording: Recording, worker: &CameraWorker) {
    let token = worker.token.clone();
    let camera_id = worker.camera.id.clone();
    worker.tasks.spawn(async move {
        let exited = tokio::select! {
            status = recording.wait() => Some(status),
            _ = token.cancelled() => None,
        };
        match exited {
            Some(Ok(status)) => warn!("Encoder for {camera_id} exited with {status}"),
            Some(Err(e)) => error!("Cannot wait for encoder of {camera_id}: {e}"),
            None => recording.stop().await,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use doorwatch_common::segment::Segment;

    use crate::session::tests::test_config;

    struct Harness {
        tmp: tempfile::TempDir,
        output: std::path::PathBuf,
        session: Session,
        shutdown: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    /// Dispatcher with every configured camera registered but not recording.
    fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        std::fs::create_dir_all(&config.output_dir).unwrap();

        let (session, rx) = Session::new(&config);
        let correlator = Arc::new(Correlator::new(
            &config.output_dir,
            config.motion_window(),
            None,
        ));
        let shutdown = CancellationToken::new();
        let mut dispatcher = Dispatcher::new(
            session.clone(),
            correlator,
            SegmentOptions::from_config(&config),
            shutdown.clone(),
        );
        for location in session.locations() {
            for camera in &location.cameras {
                dispatcher.register(&location, camera);
            }
        }
        let handle = tokio::spawn(dispatcher.run(rx));

        Harness {
            output: config.output_dir.clone(),
            tmp,
            session,
            shutdown,
            handle,
        }
    }

    fn record(dir: &std::path::Path, label: &str) -> String {
        let started = Local::now().naive_local() - chrono::Duration::seconds(3);
        let name = Segment::file_name_for(started, label);
        std::fs::write(dir.join(&name), b"segment").unwrap();
        name
    }

    async fn wait_for(path: &std::path::Path) -> bool {
        for _ in 0..100 {
            if path.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn motion(camera_id: &str) -> SessionEvent {
        SessionEvent::Motion {
            camera_id: camera_id.to_string(),
            occurred_at: Local::now(),
        }
    }

    #[tokio::test]
    async fn test_motion_relocates_segment() {
        let h = harness();
        let name = record(&h.output, "front");

        h.session.events().send(motion("front")).await.unwrap();

        assert!(wait_for(&h.output.join("motion").join(&name)).await);
        h.shutdown.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_ended_stops_only_that_camera() {
        let h = harness();
        let events = h.session.events();

        events
            .send(SessionEvent::CallEnded {
                camera_id: "front".into(),
            })
            .await
            .unwrap();

        let front = record(&h.output, "front");
        let garage = record(&h.output, "garage");
        events.send(motion("front")).await.unwrap();
        events.send(motion("garage")).await.unwrap();

        assert!(wait_for(&h.output.join("motion").join(&garage)).await);
        // front's signal was ignored
        assert!(h.output.join(&front).exists());

        h.shutdown.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_token_rotation_persists() {
        let h = harness();
        h.session
            .events()
            .send(SessionEvent::TokenRotated {
                old: Some("tok-1".into()),
                new: "tok-2".into(),
            })
            .await
            .unwrap();

        for _ in 0..100 {
            if h.session.refresh_token() == "tok-2" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.session.refresh_token(), "tok-2");

        h.shutdown.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_token_rotations_written_in_order() {
        let h = harness();
        let events = h.session.events();
        for n in 2..=5 {
            events
                .send(SessionEvent::TokenRotated {
                    old: None,
                    new: format!("tok-{n}"),
                })
                .await
                .unwrap();
        }

        for _ in 0..100 {
            if h.session.refresh_token() == "tok-5" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.shutdown.cancel();
        h.handle.await.unwrap();

        let text = std::fs::read_to_string(h.tmp.path().join(".env")).unwrap();
        assert!(text.contains("RING_REFRESH_TOKEN=tok-5"));
    }

    #[tokio::test]
    async fn test_unknown_camera_is_ignored() {
        let h = harness();
        h.session.events().send(motion("attic")).await.unwrap();
        h.session
            .events()
            .send(SessionEvent::CallEnded {
                camera_id: "attic".into(),
            })
            .await
            .unwrap();

        h.shutdown.cancel();
        h.handle.await.unwrap();
    }
}
