//! Outbound collaborators: notifications and off-site copies.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Who a notification is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    Admins,
    Operators,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str, priority: Priority, audience: Audience);
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, message: &str, priority: Priority, audience: Audience) {
        match priority {
            Priority::High => {
                tracing::warn!(?audience, title, message, "notification")
            }
            Priority::Normal | Priority::Low => {
                tracing::info!(?audience, title, message, "notification")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    pub ok: bool,
    /// Remote location on success, error text otherwise.
    pub location_or_error: String,
}

#[async_trait]
pub trait CloudUploader: Send + Sync {
    async fn upload(&self, local_path: &Path, remote_path: &str) -> UploadOutcome;
}

/// Copies artifacts under a mirror directory, e.g. a mounted bucket.
pub struct MirrorUploader {
    root: PathBuf,
}

impl MirrorUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl CloudUploader for MirrorUploader {
    async fn upload(&self, local_path: &Path, remote_path: &str) -> UploadOutcome {
        let relative: PathBuf = remote_path
            .split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .collect();
        let dest = self.root.join(relative);
        let copied = async {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(local_path, &dest).await
        }
        .await;
        match copied {
            Ok(_) => UploadOutcome {
                ok: true,
                location_or_error: dest.display().to_string(),
            },
            Err(e) => UploadOutcome {
                ok: false,
                location_or_error: e.to_string(),
            },
        }
    }
}
