//! HTTP client with built-in retry logic and error handling.

use anyhow::{Context, Result};
use log::{debug, warn};
use reqwest::Client;
use std::io::Write;
use std::time::Duration;

use super::retry::{NonRetryableError, RetryPolicy, check_retryable};

/// HTTP client with built-in retry logic for network operations.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl HttpClient {
    /// Creates a new HTTP client wrapping the given reqwest Client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build a client with the installer's user agent. `timeout` bounds
    /// connecting and every read, so a server that stops sending fails the
    /// attempt instead of hanging it.
    pub fn build(policy: RetryPolicy, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("pkgenv/", env!("PKGENV_VERSION")))
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::new(client).with_policy(policy))
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Downloads a URL into writers produced by `create_writer`, one per attempt.
    /// Transient failures are retried with exponential backoff; client errors
    /// (4xx) fail immediately as [`NonRetryableError`].
    #[tracing::instrument(skip(self, create_writer))]
    pub async fn download_file<W, F>(&self, url: &str, create_writer: F) -> Result<u64>
    where
        W: Write,
        F: Fn() -> Result<W>,
    {
        debug!("Downloading file from {}...", url);

        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.download_file_once(url, &create_writer).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    if e.downcast_ref::<NonRetryableError>().is_some() {
                        return Err(e);
                    }
                    if attempt >= attempts {
                        return Err(e.context(format!(
                            "Download of {} failed after {} attempts",
                            url, attempts
                        )));
                    }
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        "Download attempt {}/{} failed ({:#}), retrying in {}ms...",
                        attempt,
                        attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Single download attempt without retry.
    async fn download_file_once<W, F>(&self, url: &str, create_writer: &F) -> Result<u64>
    where
        W: Write,
        F: Fn() -> Result<W>,
    {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to start download request")?;

        let mut response = response.error_for_status().map_err(check_retryable)?;

        let mut writer = create_writer()?;
        let mut downloaded_bytes: u64 = 0;

        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed to read chunk from download stream")?
        {
            writer
                .write_all(&chunk)
                .context("Failed to write chunk to file")?;
            downloaded_bytes += chunk.len() as u64;
        }
        writer.flush().context("Failed to flush downloaded file")?;

        debug!(
            "Downloaded {:.2} MB",
            downloaded_bytes as f64 / (1024.0 * 1024.0)
        );

        Ok(downloaded_bytes)
    }
}
