//! Chat-webhook notifications with the motion clip attached.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local};
use reqwest::multipart::{Form, Part};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use doorwatch_common::protocol::WebhookPayload;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot encode webhook payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("webhook request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("webhook returned {status}: {body}")]
    Server {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Posts motion messages to one webhook.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    url: String,
}

impl Notifier {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Cannot create HTTP client")?;
        Ok(Notifier {
            client,
            url: url.to_string(),
        })
    }

    /// Send the motion message for `file_path`.
    pub async fn notify(
        &self,
        camera: &str,
        location: &str,
        event_time: DateTime<Local>,
        file_path: &Path,
    ) -> Result<(), NotifyError> {
        let filename = file_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();

        let bytes = tokio::fs::read(file_path)
            .await
            .map_err(|source| NotifyError::Io {
                path: file_path.to_path_buf(),
                source,
            })?;
        let size = bytes.len();

        let payload = WebhookPayload::motion(camera, location, event_time.timestamp(), &filename);
        let payload_json = serde_json::to_string(&payload)?;

        let file = Part::bytes(bytes)
            .file_name(filename.clone())
            .mime_str("video/mp4")?;
        let form = Form::new()
            .text("payload_json", payload_json)
            .part("files[0]", file);

        let resp = self.client.post(&self.url).multipart(form).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Server { status, body });
        }

        info!("Webhook accepted {filename} ({size} bytes): {status}");
        Ok(())
    }

    /// Send in a detached task.  Failures are logged there and go no further.
    pub fn spawn_notify(
        &self,
        camera: String,
        location: String,
        event_time: DateTime<Local>,
        file_path: PathBuf,
    ) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier
                .notify(&camera, &location, event_time, &file_path)
                .await
            {
                log_failure(&notifier.url, &e);
            }
        })
    }
}

fn log_failure(url: &str, err: &NotifyError) {
    match err {
        // the server answered, its body usually says why
        NotifyError::Server { status, body } => {
            error!("Webhook rejected notification ({status}): {body}");
        }
        // no response at all
        NotifyError::Network(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
            error!("No response from webhook {url}: {e:?}");
        }
        other => error!("Notification failed: {other}"),
    }
}
