//! Configuration parsing – reads a `KEY=VALUE` file (the `.env` the
//! service has always been configured with).
//!
//! Values in the process environment take precedence over the file, so a
//! container can inject secrets without touching the file on disk.  The file
//! is still the place a rotated refresh token gets written back to, see
//! [`replace_credential`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{info, warn};

use crate::segment;

/// Upper bound for `MOTION_WINDOW_SECS` (one day).
pub const MAX_MOTION_WINDOW_SECS: u64 = 86_400;

/// One camera the session manager knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    pub id: String,
    pub name: String,
    /// Source the encoder reads from (RTSP, HLS, a SIP bridge, ...).
    pub stream_url: String,
}

impl CameraConfig {
    /// Label written into this camera's segment filenames.
    pub fn label(&self) -> String {
        segment::label_for(&self.id)
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// File the configuration was read from.
    pub path: PathBuf,

    // ── cloud session ────────────────────────────────────────────────
    pub refresh_token: String,
    pub location_id: String,
    pub location_name: String,
    pub cameras: Vec<CameraConfig>,

    // ── recording ────────────────────────────────────────────────────
    pub output_dir: PathBuf,
    /// Length of each encoder segment in seconds.
    pub segment_time: u32,

    // ── correlation / notification ───────────────────────────────────
    pub motion_window_secs: u64,
    pub webhook_url: Option<String>,

    // ── signal ingress ───────────────────────────────────────────────
    pub bridge_listen_addr: String,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        ".env"
    }

    /// Where matched segments are moved to.
    pub fn motion_dir(&self) -> PathBuf {
        self.output_dir.join("motion")
    }

    pub fn motion_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.motion_window_secs.min(MAX_MOTION_WINDOW_SECS) as i64)
    }

    pub fn camera(&self, id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == id)
    }
}

/// Load the config file at `path`, letting environment variables override.
pub fn load(path: &Path) -> Result<Config> {
    load_with(path, |key| std::env::var(key).ok())
}

/// Load the config file at `path` using `env` for overrides.
pub fn load_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    info!("Loaded config from {}", path.display());

    let get = |key: &str| -> Option<String> {
        env(key)
            .or_else(|| map.get(key).cloned())
            .filter(|v| !v.is_empty())
    };
    let require = |key: &str| -> Result<String> {
        get(key).with_context(|| format!("{key} is not set in {}", path.display()))
    };

    let cameras = match get("CAMERAS") {
        Some(spec) => parse_cameras(&spec)?,
        None => Vec::new(),
    };
    if cameras.is_empty() {
        warn!("CAMERAS is empty – nothing will be recorded");
    }

    let motion_window_secs = match get("MOTION_WINDOW_SECS") {
        Some(v) => parse_motion_window(&v)?,
        None => 60,
    };

    Ok(Config {
        path: path.to_path_buf(),
        refresh_token: require("RING_REFRESH_TOKEN")?,
        location_id: require("RING_LOCATION_ID")?,
        location_name: get("LOCATION_NAME").unwrap_or_else(|| "Home".into()),
        cameras,
        output_dir: PathBuf::from(get("OUTPUT_DIR").unwrap_or_else(|| "./output".into())),
        segment_time: get("SEGMENT_TIME")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30),
        motion_window_secs,
        webhook_url: get("WEBHOOK_URL"),
        bridge_listen_addr: get("BRIDGE_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8095".into()),
    })
}

fn parse_motion_window(value: &str) -> Result<u64> {
    let secs: u64 = value
        .parse()
        .with_context(|| format!("Bad MOTION_WINDOW_SECS {value:?}: expected whole seconds"))?;
    if secs == 0 || secs > MAX_MOTION_WINDOW_SECS {
        anyhow::bail!("Bad MOTION_WINDOW_SECS {secs}: must be between 1 and {MAX_MOTION_WINDOW_SECS}");
    }
    Ok(secs)
}

/// Parse `id|name|stream_url` entries separated by commas.
fn parse_cameras(spec: &str) -> Result<Vec<CameraConfig>> {
    let mut cameras = Vec::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(3, '|').map(str::trim);
        let (Some(id), Some(name), Some(stream_url)) = (parts.next(), parts.next(), parts.next())
        else {
            anyhow::bail!("Bad CAMERAS entry {entry:?}: expected id|name|stream_url");
        };
        if id.is_empty() || stream_url.is_empty() {
            anyhow::bail!("Bad CAMERAS entry {entry:?}: id and stream_url must be set");
        }
        if cameras.iter().any(|c: &CameraConfig| c.id == id) {
            anyhow::bail!("Duplicate camera id {id:?} in CAMERAS");
        }
        // Cameras sharing a label would write and claim each other's segments
        let label = segment::label_for(id);
        if let Some(other) = cameras.iter().find(|c: &&CameraConfig| c.label() == label) {
            anyhow::bail!(
                "Duplicate camera label {label:?} in CAMERAS: ids {:?} and {id:?} map to the same segment name",
                other.id
            );
        }
        cameras.push(CameraConfig {
            id: id.to_string(),
            name: (if name.is_empty() { id } else { name }).to_string(),
            stream_url: stream_url.to_string(),
        });
    }
    Ok(cameras)
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── credential rotation ─────────────────────────────────────────────────

/// Failure to write a rotated refresh token back to the config file.
///
/// Losing a rotation means the next start authenticates with a revoked
/// token, so callers must report this loudly.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("previous refresh token not found in {}", path.display())]
    TokenNotFound { path: PathBuf },
}

/// Replace `old` with `new` in the config file at `path`.
///
/// Returns `Ok(false)` without touching the file when `old` is empty (the
/// first token of a session has nothing to replace).  The rewrite goes
/// through a sibling temp file and a rename so a crash never leaves a
/// truncated config behind.
pub fn replace_credential(path: &Path, old: &str, new: &str) -> Result<bool, CredentialError> {
    if old.is_empty() {
        return Ok(false);
    }

    let current = std::fs::read_to_string(path).map_err(|source| CredentialError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    if !current.contains(old) {
        return Err(CredentialError::TokenNotFound {
            path: path.to_path_buf(),
        });
    }
    let updated = current.replace(old, new);

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".into());
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let write_err = |source| CredentialError::Write {
        path: path.to_path_buf(),
        source,
    };
    std::fs::write(&tmp, updated).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(write_err)?;

    info!("Refresh token rotated in {}", path.display());
    Ok(true)
}

// ─── tests ───────────────────────────────────────────────────────────────
