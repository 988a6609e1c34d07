//! Core domain model for VTrend: fetched video records, stored rows and the
//! duplicate-handling vocabulary shared by every other crate.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vtrend-core";

pub const MIN_MAX_RESULTS: u32 = 1;
pub const MAX_MAX_RESULTS: u32 = 50;
pub const DEFAULT_MAX_RESULTS: u32 = 50;
pub const DEFAULT_COUNTRY: &str = "US";

const WATCH_URL_BASE: &str = "https://www.youtube.com/watch?v=";

/// Regions offered for trending fetches, as (display name, region code).
pub const SUPPORTED_COUNTRIES: &[(&str, &str)] = &[
    ("United States", "US"),
    ("Canada", "CA"),
    ("United Kingdom", "GB"),
    ("India", "IN"),
    ("Australia", "AU"),
    ("Germany", "DE"),
    ("France", "FR"),
];

/// Resolve a country given either its region code (any case) or display name.
pub fn resolve_country(input: &str) -> Option<&'static str> {
    let needle = input.trim();
    SUPPORTED_COUNTRIES
        .iter()
        .find(|(name, code)| code.eq_ignore_ascii_case(needle) || name.eq_ignore_ascii_case(needle))
        .map(|(_, code)| *code)
}

/// One observation of a trending video at fetch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub video_id: String,
    pub title: String,
    pub channel_title: String,
    pub published_at: String,
    pub view_count: u64,
    pub like_count: u64,
    pub comment_count: u64,
    pub country: String,
}

/// A persisted record plus its storage-assigned identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    pub row_id: i64,
    #[serde(flatten)]
    pub record: Record,
}

impl StoredRow {
    pub fn watch_url(&self) -> String {
        format!("{WATCH_URL_BASE}{}", self.record.video_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Leave the stored row alone.
    #[default]
    Skip,
    /// Replace the mutable fields of the newest matching row.
    Overwrite,
    /// Always insert, even when the video is already stored.
    Ignore,
}

impl DuplicatePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Overwrite => "overwrite",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown duplicate policy `{0}` (expected skip, overwrite or ignore)")]
pub struct ParsePolicyError(pub String);

impl FromStr for DuplicatePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "overwrite" => Ok(Self::Overwrite),
            "ignore" => Ok(Self::Ignore),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

/// Per-record result of reconciling against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Inserted,
    Updated,
    Skipped,
    InsertedAsDuplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Please provide a valid API key.")]
    EmptyApiKey,
    #[error("Please select a valid country (got `{0}`).")]
    UnknownCountry(String),
    #[error("Max results must be between 1 and 50 (got {0}).")]
    MaxResultsOutOfRange(u32),
    #[error("Schedule interval must be at least one minute.")]
    ZeroInterval,
}

pub fn validate_max_results(max_results: u32) -> Result<u32, ValidationError> {
    if (MIN_MAX_RESULTS..=MAX_MAX_RESULTS).contains(&max_results) {
        Ok(max_results)
    } else {
        Err(ValidationError::MaxResultsOutOfRange(max_results))
    }
}

/// Parameters for one acquisition cycle.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionParams {
    pub api_key: String,
    pub country: String,
    pub max_results: u32,
    #[serde(default)]
    pub policy: DuplicatePolicy,
}

impl AcquisitionParams {
    pub fn new(api_key: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            country: country.into(),
            max_results: DEFAULT_MAX_RESULTS,
            policy: DuplicatePolicy::default(),
        }
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn with_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Check the parameters without touching the network.
    pub fn validate(&self) -> Result<ValidatedParams, ValidationError> {
        let api_key = self.api_key.trim();
        if api_key.is_empty() {
            return Err(ValidationError::EmptyApiKey);
        }
        let country_code = resolve_country(&self.country)
            .ok_or_else(|| ValidationError::UnknownCountry(self.country.clone()))?;
        let max_results = validate_max_results(self.max_results)?;
        Ok(ValidatedParams {
            api_key: api_key.to_string(),
            country_code,
            max_results,
            policy: self.policy,
        })
    }
}

impl fmt::Debug for AcquisitionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionParams")
            .field("api_key", &redact(&self.api_key))
            .field("country", &self.country)
            .field("max_results", &self.max_results)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Parameters that passed validation; the only shape the fetch path accepts.
#[derive(Clone, PartialEq, Eq)]
pub struct ValidatedParams {
    pub api_key: String,
    pub country_code: &'static str,
    pub max_results: u32,
    pub policy: DuplicatePolicy,
}

impl fmt::Debug for ValidatedParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedParams")
            .field("api_key", &redact(&self.api_key))
            .field("country_code", &self.country_code)
            .field("max_results", &self.max_results)
            .field("policy", &self.policy)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

/// A recurring trigger registered with the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub interval_minutes: u32,
    pub next_fire_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelViews {
    pub channel_title: String,
    pub total_views: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryCount {
    pub country: String,
    pub video_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateViews {
    pub date: String,
    pub total_views: u64,
}
