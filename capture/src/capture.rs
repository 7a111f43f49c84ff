//! Video capture – one `ffmpeg` child per camera writing rotating segments.
//!
//! `-strftime 1` makes ffmpeg stamp each segment with the local wall-clock
//! time it started, which is what the segment locator keys on.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use doorwatch_common::config::{CameraConfig, Config};
use doorwatch_common::segment;

/// Encoder settings shared by every camera.
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    pub output_dir: PathBuf,
    /// Segment length in seconds.
    pub segment_time: u32,
}

impl SegmentOptions {
    pub fn from_config(config: &Config) -> Self {
        SegmentOptions {
            output_dir: config.output_dir.clone(),
            segment_time: config.segment_time,
        }
    }
}

/// Handle that owns a camera's encoder process.
pub struct Recording {
    camera_id: String,
    child: Child,
}

impl Recording {
    /// Wait for the encoder to exit on its own.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Kill the encoder and reap it.
    pub async fn stop(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Cannot stop encoder for {}: {e}", self.camera_id);
        } else {
            info!("Encoder for {} stopped", self.camera_id);
        }
    }
}

/// ffmpeg arguments recording `camera` into `options.output_dir`.
pub fn encoder_args(camera: &CameraConfig, options: &SegmentOptions) -> Vec<String> {
    let url = camera.stream_url.as_str();
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .map(String::from)
        .to_vec();

    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        args.extend(["-rtsp_transport", "tcp", "-timeout", "10000000"].map(String::from));
    } else if url.contains("://") {
        args.extend(["-rw_timeout", "10000000"].map(String::from));
    }

    args.extend(["-i".to_string(), url.to_string()]);
    args.extend(
        [
            "-c:v",
            "copy",
            "-c:a",
            "aac",
            // separate playable mp4s instead of one file that is only
            // valid once the stream ends
            "-flags",
            "+global_header",
            "-f",
            "segment",
            "-segment_time",
        ]
        .map(String::from),
    );
    args.push(options.segment_time.to_string());
    args.extend(
        [
            "-segment_format_options",
            "movflags=+faststart",
            "-reset_timestamps",
            "1",
            "-strftime",
            "1",
        ]
        .map(String::from),
    );
    args.push(
        segment::output_pattern(&options.output_dir, &camera.label())
            .to_string_lossy()
            .into_owned(),
    );
    args
}

/// Start recording `camera`.
pub fn start(camera: &CameraConfig, options: &SegmentOptions) -> Result<Recording> {
    std::fs::create_dir_all(&options.output_dir).with_context(|| {
        format!("Cannot create output directory {}", options.output_dir.display())
    })?;

    let mut cmd = Command::new("ffmpeg");
    cmd.args(encoder_args(camera, options))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn ffmpeg for camera {}", camera.id))?;

    // Drain stderr so ffmpeg errors show up and the pipe never fills.
    if let Some(stderr) = child.stderr.take() {
        let camera_id = camera.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    warn!("[ffmpeg {camera_id}] {line}");
                }
            }
            debug!("ffmpeg stderr for {camera_id} ended");
        });
    }

    info!(
        "ffmpeg started for camera {} (pid={:?}, segment={}s) → {}",
        camera.id,
        child.id(),
        options.segment_time,
        options.output_dir.display(),
    );

    Ok(Recording {
        camera_id: camera.id.clone(),
        child,
    })
}
