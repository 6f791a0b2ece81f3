//! Core domain model for Trove: harvested content, run telemetry, rollups.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trove-core";

/// Maximum number of keys a journal entry's `details` map may carry.
pub const DETAILS_MAX_KEYS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Image,
    Video,
    Quote,
    Joke,
    Fact,
    Web,
}

impl ContentKind {
    pub const ALL: [ContentKind; 6] = [
        ContentKind::Image,
        ContentKind::Video,
        ContentKind::Quote,
        ContentKind::Joke,
        ContentKind::Fact,
        ContentKind::Web,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Image => "image",
            ContentKind::Video => "video",
            ContentKind::Quote => "quote",
            ContentKind::Joke => "joke",
            ContentKind::Fact => "fact",
            ContentKind::Web => "web",
        }
    }

    pub fn parse(input: &str) -> Option<ContentKind> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == input.trim().to_ascii_lowercase())
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity basis for URL-keyed kinds (image, web).
pub fn natural_key_for_url(url: &str) -> String {
    url.trim().to_string()
}

/// Identity basis for videos: the provider's video identifier.
pub fn natural_key_for_video(video_id: &str) -> String {
    video_id.trim().to_string()
}

/// Identity basis for text kinds (quote, joke, fact): source plus external id.
pub fn natural_key_for_text(source: &str, external_id: &str) -> String {
    format!("{}:{}", source.trim(), external_id.trim())
}

/// A provider result mapped into canonical form, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCandidate {
    pub kind: ContentKind,
    pub natural_key: String,
    pub provider: String,
    pub title: Option<String>,
    pub text: Option<String>,
    pub url: String,
    pub thumb: Option<String>,
    pub language: Option<String>,
}

impl ContentCandidate {
    /// Deterministic record id derived from the candidate's identity.
    pub fn record_id(&self) -> Uuid {
        let identity = format!("{}:{}", self.kind.as_str(), self.natural_key);
        Uuid::new_v5(&Uuid::NAMESPACE_URL, identity.as_bytes())
    }
}

/// A persisted unit of harvested content, unique per (kind, natural_key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: Uuid,
    pub kind: ContentKind,
    pub natural_key: String,
    pub provider: String,
    pub title: Option<String>,
    pub text: Option<String>,
    pub url: String,
    pub thumb: Option<String>,
    pub language: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_shown_at: Option<DateTime<Utc>>,
    pub like_count: i64,
    pub dislike_count: i64,
    pub show_weight: i64,
    pub is_suppressed: bool,
}

impl ContentRecord {
    /// Builds a fresh record from a candidate; `created_at` is set once here
    /// and never touched by later upserts of the same identity.
    pub fn from_candidate(candidate: ContentCandidate, now: DateTime<Utc>) -> Self {
        Self {
            id: candidate.record_id(),
            kind: candidate.kind,
            natural_key: candidate.natural_key,
            provider: candidate.provider,
            title: candidate.title,
            text: candidate.text,
            url: candidate.url,
            thumb: candidate.thumb,
            language: candidate.language,
            created_at: now,
            updated_at: now,
            last_shown_at: None,
            like_count: 0,
            dislike_count: 0,
            show_weight: 0,
            is_suppressed: false,
        }
    }

    /// Applies the mutable fields of a re-harvested candidate.
    pub fn absorb(&mut self, candidate: ContentCandidate, now: DateTime<Utc>) {
        self.provider = candidate.provider;
        self.title = candidate.title;
        self.text = candidate.text;
        self.url = candidate.url;
        self.thumb = candidate.thumb;
        self.language = candidate.language;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }

    pub fn parse(input: &str) -> Option<RunStatus> {
        match input {
            "success" => Some(RunStatus::Success),
            "failure" => Some(RunStatus::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Cron,
    Manual,
    Unknown,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Cron => "cron",
            TriggeredBy::Manual => "manual",
            TriggeredBy::Unknown => "unknown",
        }
    }

    pub fn parse(input: &str) -> TriggeredBy {
        match input {
            "cron" => TriggeredBy::Cron,
            "manual" => TriggeredBy::Manual,
            _ => TriggeredBy::Unknown,
        }
    }
}

/// Bounded, insertion-ordered free-form payload attached to a journal entry.
///
/// Only the first [`DETAILS_MAX_KEYS`] distinct keys are kept; inserts past
/// the bound are counted in `truncated` instead of stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDetails {
    entries: Vec<(String, String)>,
    truncated: u32,
}

impl RunDetails {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a key. Overwrites never count against the bound.
    pub fn push(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
            return;
        }
        if self.entries.len() >= DETAILS_MAX_KEYS {
            self.truncated += 1;
            return;
        }
        self.entries.push((key, value));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of keys dropped because the entry was already full.
    pub fn truncated_keys(&self) -> u32 {
        self.truncated
    }
}

/// One immutable record per scheduled-job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronRunEntry {
    pub id: Uuid,
    pub name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub triggered_by: TriggeredBy,
    pub details: RunDetails,
    pub error: Option<String>,
}

/// Per-local-day usage counts, keyed by the zone-local `YYYY-MM-DD` date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub day_key: String,
    pub by_kind: BTreeMap<String, i64>,
    pub by_language: BTreeMap<String, i64>,
    pub by_provider: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CronJobSummary {
    pub total: u32,
    pub success: u32,
    pub failure: u32,
    pub last: Option<CronRunEntry>,
}

/// All-time store census by content kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub by_kind: BTreeMap<String, i64>,
    pub total: i64,
}

impl InventorySnapshot {
    pub fn from_counts(by_kind: BTreeMap<String, i64>) -> Self {
        let total = by_kind.values().sum();
        Self { by_kind, total }
    }
}

/// Derived daily aggregate; computed on demand, never persisted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyReport {
    pub day_key: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub created_by_kind: BTreeMap<String, i64>,
    pub updated_by_kind: BTreeMap<String, i64>,
    pub usage: Option<UsageCounter>,
    pub cron: BTreeMap<String, CronJobSummary>,
    pub inventory: InventorySnapshot,
}
