//! Trending-video source contract and the YouTube Data API client behind it.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use vtrend_core::Record;

pub const CRATE_NAME: &str = "vtrend-adapters";

pub const DEFAULT_API_URL: &str = "https://www.googleapis.com/youtube/v3/videos";
pub const UNKNOWN_API_ERROR: &str = "Unknown Error";

#[derive(Debug, Error)]
pub enum FetchError {
    /// The platform answered with a non-success status.
    #[error("API Error: {message}")]
    Api { status: u16, message: String },
    /// No usable response: connect, timeout or body read failure.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("malformed API response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait TrendingSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch up to `max_results` trending videos for `country_code`.
    /// `max_results` must already be within the platform's accepted range.
    async fn fetch(
        &self,
        api_key: &str,
        country_code: &str,
        max_results: u32,
    ) -> Result<Vec<Record>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for FetchClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct YouTubeTrendingClient {
    client: reqwest::Client,
    base_url: String,
}

impl YouTubeTrendingClient {
    pub fn new(config: FetchClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_most_popular(
        &self,
        api_key: &str,
        country_code: &str,
        max_results: u32,
    ) -> Result<Vec<Record>, FetchError> {
        let max_results = max_results.to_string();
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("part", "id,snippet,statistics"),
                ("chart", "mostPopular"),
                ("regionCode", country_code),
                ("maxResults", max_results.as_str()),
                ("key", api_key),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(FetchError::Api {
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }

        let records = parse_most_popular(&body, country_code)?;
        debug!(count = records.len(), "mapped trending items");
        Ok(records)
    }
}

#[async_trait]
impl TrendingSource for YouTubeTrendingClient {
    fn name(&self) -> &'static str {
        "youtube"
    }

    async fn fetch(
        &self,
        api_key: &str,
        country_code: &str,
        max_results: u32,
    ) -> Result<Vec<Record>, FetchError> {
        let span = info_span!("trending_fetch", source = self.name(), country_code, max_results);
        self.fetch_most_popular(api_key, country_code, max_results)
            .instrument(span)
            .await
    }
}

#[derive(Debug, Deserialize)]
struct MostPopularResponse {
    #[serde(default)]
    items: Option<Vec<VideoItem>>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    id: String,
    snippet: Snippet,
    #[serde(default)]
    statistics: Statistics,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    title: String,
    published_at: String,
    channel_title: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    #[serde(default, deserialize_with = "count_field")]
    view_count: u64,
    #[serde(default, deserialize_with = "count_field")]
    like_count: u64,
    #[serde(default, deserialize_with = "count_field")]
    comment_count: u64,
}

/// Counts arrive as decimal strings; absent or null counts read as zero.
fn count_field<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(0),
        Some(JsonValue::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid count `{s}`"))),
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .ok_or_else(|| de::Error::custom(format!("invalid count `{n}`"))),
        Some(other) => Err(de::Error::custom(format!("invalid count `{other}`"))),
    }
}

/// Map a successful `videos?chart=mostPopular` body into records tagged with
/// the region they were fetched for.
pub fn parse_most_popular(body: &[u8], country_code: &str) -> Result<Vec<Record>, FetchError> {
    let parsed: MostPopularResponse =
        serde_json::from_slice(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
    Ok(parsed
        .items
        .unwrap_or_default()
        .into_iter()
        .map(|item| Record {
            video_id: item.id,
            title: item.snippet.title,
            channel_title: item.snippet.channel_title,
            published_at: item.snippet.published_at,
            view_count: item.statistics.view_count,
            like_count: item.statistics.like_count,
            comment_count: item.statistics.comment_count,
            country: country_code.to_string(),
        })
        .collect())
}

/// `error.message` from an error body, or [`UNKNOWN_API_ERROR`].
pub fn api_error_message(body: &[u8]) -> String {
    serde_json::from_slice::<JsonValue>(body)
        .ok()
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.get("message"))
        .and_then(JsonValue::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| UNKNOWN_API_ERROR.to_string())
}
