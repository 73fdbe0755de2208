///! HTTP client for the remote orbital element catalog
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest;
use std::time::Duration;

use crate::error::FetchError;

/// Source of raw catalog documents (element-set text or OMM XML)
#[async_trait]
pub trait CatalogFetcher: Send + Sync {
    /// Fetch the body at `url`, retrying up to the configured bound
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

/// Retry and timeout settings for [`HttpCatalogFetcher`]
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    /// Fixed pause between attempts; zero retries immediately
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// reqwest-backed catalog fetcher
pub struct HttpCatalogFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl HttpCatalogFetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(policy.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }
}

#[async_trait]
impl CatalogFetcher for HttpCatalogFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 && !self.policy.retry_delay.is_zero() {
                tracing::debug!(
                    "Retrying {} after {:?} (attempt {}/{})",
                    url,
                    self.policy.retry_delay,
                    attempt,
                    max_attempts
                );
                tokio::time::sleep(self.policy.retry_delay).await;
            }

            match fetch_attempt(&self.client, url).await {
                Ok(body) => {
                    tracing::debug!("Fetched {} bytes from {}", body.len(), url);
                    return Ok(body);
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    if attempt == max_attempts {
                        tracing::error!(
                            "Failed to fetch {} after {} attempts: {}",
                            url,
                            max_attempts,
                            last_error
                        );
                    } else {
                        tracing::warn!(
                            "Attempt {}/{} failed for {}: {}",
                            attempt,
                            max_attempts,
                            url,
                            last_error
                        );
                    }
                }
            }
        }

        Err(FetchError::NoConnectivity {
            url: url.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}

/// Single fetch attempt
async fn fetch_attempt(client: &reqwest::Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .await
        .context(format!("Failed to send request to {}", url))?;

    if !response.status().is_success() {
        return Err(anyhow::anyhow!("HTTP error {} for {}", response.status(), url));
    }

    response
        .text()
        .await
        .context(format!("Failed to read response body from {}", url))
}
