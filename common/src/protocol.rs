//! Wire types: the chat-webhook message and the JSON bodies of the signal
//! ingress.

use serde::{Deserialize, Serialize};

// ── webhook ──────────────────────────────────────────────────────────────

/// Sidebar color of motion embeds.
pub const MOTION_COLOR: u32 = 15258703;

/// Body of the `payload_json` multipart field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub embeds: Vec<Embed>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Describes the file sent in the `files[<id>]` multipart field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: u32,
    pub description: String,
    pub filename: String,
}

impl WebhookPayload {
    /// Message announcing motion on `camera` at `location`, with the clip
    /// `filename` attached as file 0.
    ///
    /// `unix_time` is rendered with the chat client's `<t:…:F>` markup so
    /// every reader sees it in their own timezone.
    pub fn motion(camera: &str, location: &str, unix_time: i64, filename: &str) -> Self {
        let field = |name: &str, value: String| EmbedField {
            name: name.to_string(),
            value,
            inline: true,
        };

        WebhookPayload {
            embeds: vec![Embed {
                title: "Motion Detected".to_string(),
                description: format!("Motion detected on camera {camera}"),
                color: MOTION_COLOR,
                fields: vec![
                    field("Camera Name", camera.to_string()),
                    field("Location", location.to_string()),
                    field("Time", format!("<t:{unix_time}:F>")),
                ],
            }],
            attachments: vec![Attachment {
                id: 0,
                description: "Motion Detected".to_string(),
                filename: filename.to_string(),
            }],
        }
    }
}

// ── signal ingress ───────────────────────────────────────────────────────

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}

/// A location and the cameras recorded there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub id: String,
    pub name: String,
    pub cameras: Vec<CameraInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub id: String,
    pub name: String,
    /// Label the camera's segments carry.
    pub label: String,
}

/// Body of `POST /api/token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRotation {
    #[serde(default)]
    pub old_refresh_token: Option<String>,
    pub new_refresh_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_payload_shape() {
        let payload = WebhookPayload::motion(
            "Front Door",
            "Home",
            1704110400,
            "2024-01-01_12-00-00_front.mp4",
        );
        let json = serde_json::to_value(&payload).unwrap();

        let embed = &json["embeds"][0];
        assert_eq!(embed["title"], "Motion Detected");
        assert_eq!(embed["description"], "Motion detected on camera Front Door");
        assert_eq!(embed["color"], 15258703);
        assert_eq!(embed["fields"][0]["name"], "Camera Name");
        assert_eq!(embed["fields"][1]["value"], "Home");
        assert_eq!(embed["fields"][2]["value"], "<t:1704110400:F>");
        assert_eq!(embed["fields"][2]["inline"], true);

        let attachment = &json["attachments"][0];
        assert_eq!(attachment["id"], 0);
        assert_eq!(attachment["filename"], "2024-01-01_12-00-00_front.mp4");
    }

    #[test]
    fn test_token_rotation_without_old() {
        let body: TokenRotation =
            serde_json::from_str(r#"{"new_refresh_token":"xyz"}"#).unwrap();
        assert_eq!(body.old_refresh_token, None);
        assert_eq!(body.new_refresh_token, "xyz");
    }
}
