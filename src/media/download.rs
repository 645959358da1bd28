use super::mime::{extension_for, filename_from_disposition, with_extension};
use super::MediaKind;
use crate::{Error, Result};
use chrono::Local;
use futures::StreamExt;
use reqwest::header::{HeaderName, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Deletes a partly written download unless [`PartialFile::keep`] is called.
///
/// Covers both a failed transfer and a dropped download future.
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed incomplete download {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Could not remove incomplete download {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Saves media linked from agent replies into a local directory.
#[derive(Clone)]
pub struct MediaDownloader {
    client: Client,
    download_dir: PathBuf,
    timeout: Duration,
}

impl MediaDownloader {
    pub fn new(client: Client, download_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            client,
            download_dir,
            timeout,
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Download `url` with the given bearer credential.
    ///
    /// Failures are logged and reported as `None`; callers substitute a
    /// user-facing message.
    pub async fn download(&self, url: &str, kind: MediaKind, api_key: &str) -> Option<PathBuf> {
        tracing::info!("Downloading {} from {}", kind, url);
        match self.try_download(url, kind, api_key).await {
            Ok(path) => {
                tracing::info!("Saved {} to {}", kind, path.display());
                Some(path)
            }
            Err(e) => {
                tracing::error!("Failed to download {} from {}: {}", kind, url, e);
                None
            }
        }
    }

    async fn try_download(&self, url: &str, kind: MediaKind, api_key: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.download_dir).await?;

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .bearer_auth(api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Api(format!(
                "download returned status {}",
                response.status()
            )));
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let content_type = header(CONTENT_TYPE);
        let disposition = header(CONTENT_DISPOSITION);

        let base = filename_from_disposition(&disposition).unwrap_or_else(|| {
            format!("{}_{}", kind, Local::now().format("%Y%m%d_%H%M%S"))
        });
        let filename = with_extension(&base, extension_for(kind, &content_type));
        let path = self.download_dir.join(filename);

        let partial = PartialFile::new(path.clone());
        let mut file = tokio::fs::File::create(&path).await?;
        let mut body = response.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;
        drop(file);

        tracing::debug!("Wrote {} bytes to {}", written, path.display());
        Ok(partial.keep())
    }
}
