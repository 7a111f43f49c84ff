//! Segment filenames and the locator that correlates a motion event with the
//! segment being recorded when it happened.
//!
//! The encoder names every segment after the local wall-clock time it started
//! recording:
//!   `2024-01-01_12-00-00_front-door.mp4`
//!
//! Version 1 of this format always used the label `doorbell`; version 2 puts
//! the camera label there so several cameras can share one output directory
//! without stealing each other's clips.  Version 1 names still parse, their
//! label is simply `doorbell`.

use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;
use tracing::{info, warn};

/// Version of the filename layout written by [`output_pattern`].
pub const FORMAT_VERSION: u32 = 2;

/// `strftime` prefix the encoder is given; [`Segment::parse`] reverses it.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Container extension of recorded segments.
pub const EXTENSION: &str = "mp4";

/// Why a filename is not a segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentParseError {
    #[error("filename is not valid UTF-8")]
    NotUtf8,

    #[error("no time token after the date")]
    MissingTime,

    #[error("bad date {0:?}")]
    BadDate(String),

    #[error("time {0:?} has fewer than 3 parts")]
    ShortTime(String),

    #[error("bad time {0:?}")]
    BadTime(String),
}

/// A recorded segment identified by its filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub file_name: String,
    /// Local wall-clock time the segment started recording.
    pub recorded_at: NaiveDateTime,
    /// Camera label; empty when the filename carries none.
    pub label: String,
}

impl Segment {
    /// Parse a bare filename (no directory).
    pub fn parse(file_name: &str) -> Result<Self, SegmentParseError> {
        let mut tokens = file_name.splitn(3, '_');
        let date_tok = tokens.next().unwrap_or_default();
        let time_tok = tokens.next().ok_or(SegmentParseError::MissingTime)?;
        let rest = tokens.next();

        let date = NaiveDate::parse_from_str(date_tok, "%Y-%m-%d")
            .map_err(|_| SegmentParseError::BadDate(date_tok.to_string()))?;

        // Without a label the extension hangs off the seconds.
        let time_tok = match rest {
            Some(_) => time_tok,
            None => strip_extension(time_tok),
        };

        let parts: Vec<&str> = time_tok.split('-').collect();
        if parts.len() < 3 {
            return Err(SegmentParseError::ShortTime(time_tok.to_string()));
        }
        let bad_time = || SegmentParseError::BadTime(time_tok.to_string());
        let hour: u32 = parts[0].parse().map_err(|_| bad_time())?;
        let minute: u32 = parts[1].parse().map_err(|_| bad_time())?;
        let second: u32 = parts[2].parse().map_err(|_| bad_time())?;
        let time = NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(bad_time)?;

        Ok(Segment {
            file_name: file_name.to_string(),
            recorded_at: NaiveDateTime::new(date, time),
            label: rest.map(strip_extension).unwrap_or_default().to_string(),
        })
    }

    /// Filename the encoder would write for a segment started at
    /// `recorded_at` by the camera labelled `label`.
    pub fn file_name_for(recorded_at: NaiveDateTime, label: &str) -> String {
        format!("{}_{label}.{EXTENSION}", recorded_at.format(TIMESTAMP_FORMAT))
    }

    /// Whether the segment started within `window` before `reference`.
    ///
    /// Segments stamped after `reference` are rejected: the encoder only
    /// names files for segments that have already started.
    pub fn within_window(&self, reference: NaiveDateTime, window: Duration) -> bool {
        let delta = reference - self.recorded_at;
        delta >= Duration::zero() && delta < window
    }
}

fn strip_extension(s: &str) -> &str {
    s.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(s)
}

/// Turn a camera id into a filename-safe label.
///
/// Underscores are not allowed since they separate the filename tokens.
pub fn label_for(camera_id: &str) -> String {
    let mut label = String::with_capacity(camera_id.len());
    for c in camera_id.chars() {
        if c.is_ascii_alphanumeric() {
            label.push(c.to_ascii_lowercase());
        } else if !label.ends_with('-') {
            label.push('-');
        }
    }
    let label = label.trim_matches('-');
    if label.is_empty() {
        "camera".to_string()
    } else {
        label.to_string()
    }
}

/// Whether a file in the output directory was meant to be a segment.
fn looks_like_segment(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case(EXTENSION))
}

/// `strftime` output path handed to the encoder for one camera.
pub fn output_pattern(dir: &Path, label: &str) -> PathBuf {
    dir.join(format!("{TIMESTAMP_FORMAT}_{label}.{EXTENSION}"))
}

/// Find the newest segment in `dir` that started within `window` before
/// `reference`.
///
/// Only top-level regular files are considered.  With `label` set, segments
/// of other cameras are ignored.  Filenames that do not parse are skipped.
/// When several segments qualify the one with the latest timestamp wins,
/// ties going to the greater filename, so the answer never depends on
/// directory listing order.
pub fn find_most_recent_segment(
    dir: &Path,
    label: Option<&str>,
    reference: NaiveDateTime,
    window: Duration,
) -> std::io::Result<Option<Segment>> {
    let mut best: Option<Segment> = None;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }

        let name = entry.file_name();
        let segment = match name.to_str().ok_or(SegmentParseError::NotUtf8) {
            Ok(name) => Segment::parse(name),
            Err(e) => Err(e),
        };
        let segment = match segment {
            Ok(s) => s,
            Err(e) => {
                let name = name.to_string_lossy();
                if looks_like_segment(&name) {
                    warn!("Skipping {name}: {e}");
                } else {
                    info!("Skipping {name}: {e}");
                }
                continue;
            }
        };

        if label.is_some_and(|l| l != segment.label) {
            continue;
        }
        if !segment.within_window(reference, window) {
            continue;
        }

        let newer = best.as_ref().map_or(true, |b| {
            (&segment.recorded_at, &segment.file_name) > (&b.recorded_at, &b.file_name)
        });
        if newer {
            best = Some(segment);
        }
    }

    Ok(best)
}
