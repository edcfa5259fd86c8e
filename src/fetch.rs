//! Bounded-retry JSON fetcher for the two dynmap endpoints.
//!
//! Network errors, non-2xx statuses, and bodies that fail to decode as JSON
//! are all treated identically as retryable. The transport sits behind
//! [`HttpSource`] so retry behavior is testable without a live server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::FetchError;

const USER_AGENT: &str = concat!("mapwatch/", env!("CARGO_PKG_VERSION"));

/// Capability seam over "GET this URL and give me JSON".
#[async_trait]
pub trait HttpSource: Send + Sync {
    async fn get_json(&self, url: &str) -> anyhow::Result<Value>;
}

/// Production transport: a shared reqwest client with a per-request timeout.
#[derive(Debug, Clone)]
pub struct ReqwestSource {
    http: Client,
}

impl ReqwestSource {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HttpSource for ReqwestSource {
    async fn get_json(&self, url: &str) -> anyhow::Result<Value> {
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(resp.json::<Value>().await?)
    }
}

pub struct Fetcher<S> {
    source: S,
    retry_count: u32,
    retry_delay: Duration,
}

impl<S: HttpSource> Fetcher<S> {
    pub fn new(source: S, retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            source,
            retry_count,
            retry_delay,
        }
    }

    /// Attempts the request up to `retry_count + 1` times, sleeping
    /// `retry_delay` between attempts. On exhaustion returns a terminal
    /// [`FetchError`] carrying the endpoint and the last cause; the caller
    /// abandons that endpoint's branch of the cycle, nothing more.
    pub async fn fetch(&self, endpoint: &str) -> Result<Value, FetchError> {
        let attempts = self.retry_count + 1;
        let mut last_cause = String::new();
        for attempt in 1..=attempts {
            match self.source.get_json(endpoint).await {
                Ok(payload) => {
                    debug!(endpoint = %endpoint, attempt, "fetch succeeded");
                    return Ok(payload);
                }
                Err(err) => {
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        attempts,
                        error = %err,
                        "fetch attempt failed"
                    );
                    last_cause = err.to_string();
                    if attempt < attempts && !self.retry_delay.is_zero() {
                        sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(FetchError {
            endpoint: endpoint.to_string(),
            attempts,
            cause: last_cause,
        })
    }
}
