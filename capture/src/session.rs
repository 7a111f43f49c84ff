//! Camera cloud session.
//!
//! The session knows the configured location and its cameras, starts their
//! encoders, owns the refresh token, and is where motion / call-ended /
//! token-rotated signals enter the process.  Signals are delivered as
//! [`SessionEvent`] messages on one channel; the cloud-side bridge reaches
//! that channel through the HTTP ingress in `server.rs`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::info;

use doorwatch_common::config::{self, CameraConfig, Config, CredentialError};
use doorwatch_common::protocol::{CameraInfo, LocationInfo};

use crate::capture::{self, Recording, SegmentOptions};

/// Capacity of the signal channel.
const EVENT_BUFFER: usize = 64;

/// Signal emitted by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Motion {
        camera_id: String,
        occurred_at: DateTime<Local>,
    },
    CallEnded {
        camera_id: String,
    },
    TokenRotated {
        old: Option<String>,
        new: String,
    },
}

/// A location and its cameras.
#[derive(Debug, Clone)]
pub struct Location {
    pub id: String,
    pub name: String,
    pub cameras: Vec<CameraConfig>,
}

impl Location {
    pub fn info(&self) -> LocationInfo {
        LocationInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            cameras: self
                .cameras
                .iter()
                .map(|c| CameraInfo {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    label: c.label(),
                })
                .collect(),
        }
    }
}

/// Handle to the cloud session.  Cheap to clone.
#[derive(Clone)]
pub struct Session {
    locations: Arc<Vec<Location>>,
    config_path: PathBuf,
    refresh_token: Arc<RwLock<String>>,
    /// Token the config file is known to contain.
    persisted_token: Arc<Mutex<String>>,
    events: mpsc::Sender<SessionEvent>,
}

impl Session {
    /// Build the session and the receiving end of its signal channel.
    pub fn new(config: &Config) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let location = Location {
            id: config.location_id.clone(),
            name: config.location_name.clone(),
            cameras: config.cameras.clone(),
        };
        let session = Session {
            locations: Arc::new(vec![location]),
            config_path: config.path.clone(),
            refresh_token: Arc::new(RwLock::new(config.refresh_token.clone())),
            persisted_token: Arc::new(Mutex::new(config.refresh_token.clone())),
            events: tx,
        };
        (session, rx)
    }

    /// Locations that have at least one camera.
    pub fn locations(&self) -> Vec<Location> {
        self.locations
            .iter()
            .filter(|l| !l.cameras.is_empty())
            .cloned()
            .collect()
    }

    /// Find a camera and the location it belongs to.
    pub fn camera(&self, camera_id: &str) -> Option<(&Location, &CameraConfig)> {
        self.locations.iter().find_map(|l| {
            l.cameras
                .iter()
                .find(|c| c.id == camera_id)
                .map(|c| (l, c))
        })
    }

    /// Sender half of the signal channel.
    pub fn events(&self) -> mpsc::Sender<SessionEvent> {
        self.events.clone()
    }

    /// Start the encoder for `camera`.
    pub fn stream_video(&self, camera: &CameraConfig, options: &SegmentOptions) -> Result<Recording> {
        capture::start(camera, options)
    }

    pub fn refresh_token(&self) -> String {
        self.refresh_token
            .read()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// Adopt a rotated refresh token and write it to the config file.
    ///
    /// The session switches to `new` straight away, whether or not the file
    /// can be updated.  In the file, `old` is replaced when given and
    /// present; otherwise the token last written there is.  A failed write
    /// is therefore retried by the next rotation.
    pub fn rotate_token(&self, old: Option<&str>, new: &str) -> Result<(), CredentialError> {
        // held across the rewrite so rotations reach the file in order
        let mut persisted = self.persisted_token.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(mut token) = self.refresh_token.write() {
            *token = new.to_string();
        }

        let path = &self.config_path;
        let result = match old.filter(|t| !t.is_empty() && *t != persisted.as_str()) {
            Some(old) => match config::replace_credential(path, old, new) {
                Err(CredentialError::TokenNotFound { .. }) => {
                    config::replace_credential(path, persisted.as_str(), new)
                }
                other => other,
            },
            None => config::replace_credential(path, persisted.as_str(), new),
        };

        if result? {
            *persisted = new.to_string();
            info!("Refresh token updated");
        }
        Ok(())
    }
}
