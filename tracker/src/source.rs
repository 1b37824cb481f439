use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::header;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::SourceError;
use crate::event::DiscoveryEvent;
use crate::time::TimeSource;

#[async_trait]
pub trait EventSource {
    /// Fetch the current batch of discovery events for a keyword.
    /// Failures are transient; the pipeline retries the whole fetch.
    async fn fetch(&self, keyword: &str) -> Result<Vec<DiscoveryEvent>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    repository: RepositoryRef,
}

#[derive(Debug, Deserialize)]
struct RepositoryRef {
    full_name: String,
    languages_url: String,
}

/// Event source backed by the GitHub code search API.
///
/// Each matched item is enriched with the repository's language list via a
/// secondary per-item lookup; a failed lookup degrades that event to an
/// empty language list instead of failing the batch. The popularity signal
/// is the repository's running match count within the fetched batch, since
/// the code search payload carries no star counts.
pub struct GithubSource {
    client: reqwest::Client,
    base_url: Url,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl GithubSource {
    pub fn new(
        base_url: &str,
        access_token: Option<&str>,
        request_timeout: Duration,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> anyhow::Result<GithubSource> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/vnd.github.v3+json"),
        );
        if let Some(token) = access_token {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {}", token))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("keyword-tracker")
            .timeout(request_timeout)
            .build()?;

        Ok(GithubSource {
            client,
            base_url: Url::parse(base_url)?,
            timesource,
        })
    }

    async fn languages(&self, languages_url: &str) -> Result<Vec<String>, SourceError> {
        let url = Url::parse(languages_url)?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::UnexpectedStatus(response.status()));
        }

        let payload = response.text().await?;
        let languages: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&payload)?;

        Ok(languages.keys().cloned().collect())
    }
}

#[async_trait]
impl EventSource for GithubSource {
    async fn fetch(&self, keyword: &str) -> Result<Vec<DiscoveryEvent>, SourceError> {
        let mut url = self.base_url.join("search/code")?;
        url.query_pairs_mut().append_pair("q", keyword);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::UnexpectedStatus(response.status()));
        }

        let payload = response.text().await?;
        let results: SearchResponse = serde_json::from_str(&payload)?;
        debug!(keyword, items = results.items.len(), "decoded search response");

        let mut match_counts: HashMap<String, u64> = HashMap::new();
        let mut events = Vec::with_capacity(results.items.len());
        for item in results.items {
            let languages = match self.languages(&item.repository.languages_url).await {
                Ok(languages) => languages,
                Err(e) => {
                    counter!("tracker_language_lookup_failures_total").increment(1);
                    warn!(
                        repository = %item.repository.full_name,
                        "language lookup failed, event proceeds without languages: {}", e
                    );
                    Vec::new()
                }
            };

            let matches = match_counts
                .entry(item.repository.full_name.clone())
                .or_insert(0);
            *matches += 1;

            events.push(DiscoveryEvent {
                repository_name: item.repository.full_name,
                keyword: keyword.to_owned(),
                observed_at: self.timesource.current_time(),
                popularity_signal: *matches,
                languages,
            });
        }

        Ok(events)
    }
}
