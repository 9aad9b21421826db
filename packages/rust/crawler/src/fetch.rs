//! Robots-aware HTTP fetch with bounded retries.
//!
//! [`Fetcher::fetch`] never returns an error. Transport failures are retried with
//! exponential backoff and end in a status-`0` result; HTTP error statuses are returned
//! as-is after a single attempt; robots.txt refusals produce a synthetic `403`.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use tracing::{debug, instrument, warn};
use url::Url;

use harvester_shared::{CrawlConfig, FetchResult, HarvestError, Result};

use crate::robots::RobotsCache;

/// Retry, politeness and TLS settings for the fetch layer.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub user_agent: String,
    pub timeout: Duration,
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub backoff_unit: Duration,
    pub respect_robots_txt: bool,
    /// Hosts fetched without certificate verification.
    pub insecure_hosts: HashSet<String>,
}

impl From<&CrawlConfig> for FetchPolicy {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            timeout: config.timeout,
            max_retries: config.max_retries,
            backoff_factor: config.backoff_factor,
            backoff_unit: config.backoff_unit,
            respect_robots_txt: config.respect_robots_txt,
            insecure_hosts: config
                .insecure_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self::from(&CrawlConfig::default())
    }
}

impl FetchPolicy {
    /// Wait before retry number `attempt + 1`: `unit * factor^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        self.backoff_unit
            .mul_f64(self.backoff_factor.powi(exponent).max(0.0))
    }

    /// Waits slept between consecutive attempts, one per retry.
    pub fn retry_waits(&self) -> Vec<Duration> {
        (0..self.max_retries).map(|attempt| self.backoff(attempt)).collect()
    }
}

/// HTTP client pair (verifying and non-verifying) plus the robots.txt cache.
pub struct Fetcher {
    client: Client,
    insecure_client: Client,
    policy: FetchPolicy,
    robots: RobotsCache,
}

impl Fetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self> {
        let client = build_client(&policy, false)?;
        let insecure_client = build_client(&policy, true)?;
        Ok(Self {
            client,
            insecure_client,
            policy,
            robots: RobotsCache::default(),
        })
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Fetch `url`, honoring robots.txt and the retry policy.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn fetch(&self, url: &str) -> FetchResult {
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(e) => return FetchResult::network_failure(url, format!("invalid URL: {e}"), 0),
        };
        let client = self.client_for(&parsed);

        if self.policy.respect_robots_txt
            && !self
                .robots
                .is_allowed(client, &parsed, &self.policy.user_agent)
                .await
        {
            debug!("blocked by robots.txt");
            return FetchResult::robots_blocked(url);
        }

        let attempts = self.policy.max_retries.saturating_add(1);
        let mut waits = self.policy.retry_waits().into_iter();
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match client.get(parsed.clone()).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let final_url = response.url().to_string();
                    let headers = collect_headers(response.headers());
                    match response.text().await {
                        Ok(body) => {
                            debug!(status, attempt = attempt + 1, "fetched");
                            return FetchResult {
                                status,
                                body,
                                headers,
                                final_url,
                                error: (status != 200).then(|| format!("HTTP {status}")),
                                attempts: attempt + 1,
                            };
                        }
                        Err(e) => last_error = format!("body read failed: {e}"),
                    }
                }
                Err(e) => last_error = e.to_string(),
            }

            if let Some(wait) = waits.next() {
                warn!(
                    attempt = attempt + 1,
                    wait_ms = wait.as_millis() as u64,
                    error = %last_error,
                    "fetch failed, retrying"
                );
                tokio::time::sleep(wait).await;
            }
        }

        warn!(attempts, error = %last_error, "fetch failed, giving up");
        FetchResult::network_failure(url, last_error, attempts)
    }

    fn client_for(&self, url: &Url) -> &Client {
        let insecure = url
            .host_str()
            .is_some_and(|h| self.policy.insecure_hosts.contains(&h.to_ascii_lowercase()));
        if insecure {
            &self.insecure_client
        } else {
            &self.client
        }
    }
}

fn build_client(policy: &FetchPolicy, accept_invalid_certs: bool) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("pt-BR,pt;q=0.9,en;q=0.8"),
    );

    Client::builder()
        .user_agent(policy.user_agent.clone())
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(policy.timeout)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .map_err(|e| HarvestError::network("HTTP client", e))
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
