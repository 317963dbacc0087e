use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{create_dir_all, File};
use tokio::io::AsyncWriteExt;

use crate::error::DeliveryError;
use crate::layers::digest::Digest;
use crate::layers::DateWindow;

#[async_trait]
pub trait MailClient: Send + Sync {
    async fn send(&self, digest: &Digest) -> Result<(), DeliveryError>;
}

/// Delivers digests by writing them into a local outbox directory,
/// where a mail relay or a human can pick them up.
pub struct FileOutbox {
    base_dir: PathBuf,
}

#[derive(Serialize)]
struct OutboxMeta<'a> {
    subject: &'a str,
    window: DateWindow,
    paper_ids: &'a [String],
    written_at: String,
}

impl FileOutbox {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn stem(digest: &Digest) -> String {
        let stamp = Local::now().format("%Y%m%dT%H%M%S");
        // window text made safe for file names
        let slug: String = digest
            .window
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("{}-{}", slug, stamp)
    }

    async fn write(path: &Path, bytes: &[u8]) -> Result<(), DeliveryError> {
        let io_err = |source| DeliveryError::Io {
            path: path.display().to_string(),
            source,
        };
        let mut file = File::create(path).await.map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)
    }
}

#[async_trait]
impl MailClient for FileOutbox {
    async fn send(&self, digest: &Digest) -> Result<(), DeliveryError> {
        create_dir_all(&self.base_dir)
            .await
            .map_err(|source| DeliveryError::Io {
                path: self.base_dir.display().to_string(),
                source,
            })?;

        let stem = Self::stem(digest);
        let html_path = self.base_dir.join(format!("{}.html", stem));
        tracing::info!("Writing digest '{}' to {:?}", digest.subject, html_path);
        Self::write(&html_path, digest.html.as_bytes()).await?;

        let meta = OutboxMeta {
            subject: &digest.subject,
            window: digest.window,
            paper_ids: &digest.paper_ids,
            written_at: Local::now().to_rfc3339(),
        };
        let meta_path = self.base_dir.join(format!("{}.json", stem));
        let meta_json = serde_json::to_string_pretty(&meta)?;
        Self::write(&meta_path, meta_json.as_bytes()).await?;

        Ok(())
    }
}

/// Fixed message used to check that delivery works end to end.
pub fn test_digest() -> Digest {
    let today = Local::now().date_naive();
    Digest {
        subject: "Paper digest test message".to_string(),
        html: "<html><body><h2>Paper digest test</h2>\
               <p>If you receive this message, delivery is configured correctly.</p></body></html>"
            .to_string(),
        window: DateWindow::single_day(today),
        paper_ids: Vec::new(),
    }
}
