//! Keyword dictionary, query synthesis, and per-provider harvesters.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::warn;
use trove_core::{
    natural_key_for_text, natural_key_for_url, natural_key_for_video, ContentCandidate,
    ContentKind,
};
use trove_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "trove-providers";

/// Categorized token lists feeding query synthesis. Immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordDictionary {
    #[serde(default)]
    pub energies: Vec<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub locales: Vec<String>,
    #[serde(default)]
    pub eras: Vec<String>,
    #[serde(default)]
    pub extras: Vec<String>,
}

impl KeywordDictionary {
    pub fn is_empty(&self) -> bool {
        self.energies.is_empty()
            && self.subjects.is_empty()
            && self.formats.is_empty()
            && self.locales.is_empty()
            && self.eras.is_empty()
            && self.extras.is_empty()
    }

    /// Upper bound on distinct full combinations the synthesizer can emit.
    pub fn combination_space(&self) -> usize {
        let optional = [&self.energies, &self.eras, &self.formats, &self.locales, &self.extras];
        optional
            .iter()
            .fold(self.subjects.len().max(1), |acc, tokens| {
                acc.saturating_mul(tokens.len() + 1)
            })
    }
}

pub fn load_dictionary(path: impl AsRef<Path>) -> anyhow::Result<KeywordDictionary> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Lazily-initialized, single-flight dictionary cache. Passed by reference
/// wherever synthesis happens; loads the file at most once per process.
#[derive(Debug)]
pub struct DictionaryCache {
    path: PathBuf,
    cell: OnceCell<KeywordDictionary>,
}

impl DictionaryCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cell: OnceCell::new(),
        }
    }

    pub async fn get(&self) -> anyhow::Result<&KeywordDictionary> {
        self.cell
            .get_or_try_init(|| async { load_dictionary(&self.path) })
            .await
    }
}

/// Per-category inclusion probabilities; the subject slot is always drawn.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisPolicy {
    pub energy: f64,
    pub era: f64,
    pub format: f64,
    pub locale: f64,
    pub extra: f64,
}

impl Default for SynthesisPolicy {
    fn default() -> Self {
        Self {
            energy: 0.8,
            era: 0.6,
            format: 0.9,
            locale: 0.65,
            extra: 0.45,
        }
    }
}

/// Emitted when the dictionary has nothing to combine.
const FALLBACK_QUERIES: [&str; 2] = ["funny pictures", "interesting facts"];

fn pick<'a>(rng: &mut impl Rng, tokens: &'a [String]) -> Option<&'a str> {
    if tokens.is_empty() {
        None
    } else {
        tokens.get(rng.gen_range(0..tokens.len())).map(String::as_str)
    }
}

fn normalized(parts: &[&str]) -> String {
    parts
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn push_unique(out: &mut Vec<String>, query: String) -> bool {
    if query.is_empty() || out.contains(&query) {
        return false;
    }
    out.push(query);
    true
}

/// Builds up to `count` distinct, non-empty query strings by weighted random
/// combination, with a per-subject fallback tier, an extras fallback tier,
/// and a fixed built-in pair when the dictionary is empty.
pub fn synthesize_queries(
    dict: &KeywordDictionary,
    count: usize,
    rng: &mut impl Rng,
) -> Vec<String> {
    if count == 0 {
        return Vec::new();
    }
    if dict.is_empty() {
        return FALLBACK_QUERIES
            .iter()
            .take(count)
            .map(ToString::to_string)
            .collect();
    }

    let policy = SynthesisPolicy::default();
    let mut out: Vec<String> = Vec::with_capacity(count);
    let budget = (12 * count).max(40);

    for _ in 0..budget {
        if out.len() >= count {
            break;
        }
        let mut parts: Vec<&str> = Vec::with_capacity(6);
        if rng.gen_bool(policy.energy) {
            parts.extend(pick(rng, &dict.energies));
        }
        parts.extend(pick(rng, &dict.subjects));
        if rng.gen_bool(policy.era) {
            parts.extend(pick(rng, &dict.eras));
        }
        if rng.gen_bool(policy.format) {
            parts.extend(pick(rng, &dict.formats));
        }
        if rng.gen_bool(policy.locale) {
            parts.extend(pick(rng, &dict.locales));
        }
        if rng.gen_bool(policy.extra) {
            parts.extend(pick(rng, &dict.extras));
        }
        push_unique(&mut out, normalized(&parts));
    }

    if out.len() < count {
        for subject in &dict.subjects {
            if out.len() >= count {
                break;
            }
            let mut parts: Vec<&str> = Vec::with_capacity(3);
            parts.extend(pick(rng, &dict.energies));
            parts.push(subject);
            parts.extend(pick(rng, &dict.formats));
            push_unique(&mut out, normalized(&parts));
        }
    }

    if out.len() < count {
        for extra in &dict.extras {
            if out.len() >= count {
                break;
            }
            let mut parts: Vec<&str> = Vec::with_capacity(3);
            parts.extend(pick(rng, &dict.energies));
            parts.push(extra);
            parts.extend(pick(rng, &dict.formats));
            push_unique(&mut out, normalized(&parts));
        }
    }

    if out.is_empty() {
        return FALLBACK_QUERIES
            .iter()
            .take(count)
            .map(ToString::to_string)
            .collect();
    }
    out
}

/// One provider search call: query plus pagination, recency, and the
/// provider-specific selectors some jobs carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderRequest {
    pub query: String,
    pub per: usize,
    pub page: usize,
    pub days: Option<u32>,
    pub playlist: Option<String>,
    pub channel: Option<String>,
    pub subreddit: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {provider} response: {message}")]
    Decode {
        provider: &'static str,
        message: String,
    },
}

fn decode_err(provider: &'static str, err: impl ToString) -> ProviderError {
    ProviderError::Decode {
        provider,
        message: err.to_string(),
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &'static str;
    fn kind(&self) -> ContentKind;

    async fn search(
        &self,
        http: &HttpFetcher,
        request: &ProviderRequest,
    ) -> Result<Vec<ContentCandidate>, ProviderError>;
}

/// API credentials and endpoints resolved from configuration. A provider
/// whose credential is absent is left out of the registry entirely.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub unsplash_key: Option<String>,
    pub pexels_key: Option<String>,
    pub youtube_key: Option<String>,
    pub api_ninjas_key: Option<String>,
    pub searx_base: Option<String>,
}

/// Harvesters for one content kind, in fixed priority order.
pub fn providers_for(kind: ContentKind, creds: &ProviderCredentials) -> Vec<Arc<dyn Provider>> {
    let mut out: Vec<Arc<dyn Provider>> = Vec::new();
    match kind {
        ContentKind::Image => {
            if let Some(key) = &creds.unsplash_key {
                out.push(Arc::new(UnsplashProvider { key: key.clone() }));
            }
            if let Some(key) = &creds.pexels_key {
                out.push(Arc::new(PexelsProvider { key: key.clone() }));
            }
            out.push(Arc::new(RedditProvider));
        }
        ContentKind::Video => {
            if let Some(key) = &creds.youtube_key {
                out.push(Arc::new(YoutubeProvider { key: key.clone() }));
            }
        }
        ContentKind::Quote => out.push(Arc::new(QuotableProvider)),
        ContentKind::Joke => out.push(Arc::new(JokeApiProvider)),
        ContentKind::Fact => {
            if let Some(key) = &creds.api_ninjas_key {
                out.push(Arc::new(ApiNinjasFactsProvider { key: key.clone() }));
            }
        }
        ContentKind::Web => {
            if let Some(base) = &creds.searx_base {
                out.push(Arc::new(SearxProvider { base: base.clone() }));
            }
        }
    }
    out
}

fn http_url(value: Option<String>) -> Option<String> {
    value.filter(|v| v.starts_with("http://") || v.starts_with("https://"))
}

#[derive(Debug, Clone)]
struct UnsplashProvider {
    key: String,
}

#[derive(Debug, Deserialize)]
struct UnsplashSearch {
    #[serde(default)]
    results: Vec<UnsplashPhoto>,
}

#[derive(Debug, Deserialize)]
struct UnsplashPhoto {
    description: Option<String>,
    alt_description: Option<String>,
    #[serde(default)]
    urls: UnsplashUrls,
}

#[derive(Debug, Default, Deserialize)]
struct UnsplashUrls {
    regular: Option<String>,
    small: Option<String>,
}

fn map_unsplash(value: JsonValue) -> Result<Vec<ContentCandidate>, ProviderError> {
    let search: UnsplashSearch =
        serde_json::from_value(value).map_err(|e| decode_err("unsplash", e))?;
    Ok(search
        .results
        .into_iter()
        .filter_map(|photo| {
            let url = http_url(photo.urls.regular)?;
            Some(ContentCandidate {
                kind: ContentKind::Image,
                natural_key: natural_key_for_url(&url),
                provider: "unsplash".into(),
                title: photo.description.or(photo.alt_description),
                text: None,
                thumb: http_url(photo.urls.small),
                language: Some("en".into()),
                url,
            })
        })
        .collect())
}

#[async_trait]
impl Provider for UnsplashProvider {
    fn id(&self) -> &'static str {
        "unsplash"
    }

    fn kind(&self) -> ContentKind {
        ContentKind::Image
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        request: &ProviderRequest,
    ) -> Result<Vec<ContentCandidate>, ProviderError> {
        let value = http
            .get_json(
                "https://api.unsplash.com/search/photos",
                &[
                    ("query", request.query.clone()),
                    ("per_page", request.per.to_string()),
                    ("page", request.page.max(1).to_string()),
                ],
                &[("Authorization", format!("Client-ID {}", self.key))],
            )
            .await?;
        map_unsplash(value)
    }
}

#[derive(Debug, Clone)]
struct PexelsProvider {
    key: String,
}

#[derive(Debug, Deserialize)]
struct PexelsSearch {
    #[serde(default)]
    photos: Vec<PexelsPhoto>,
}

#[derive(Debug, Deserialize)]
struct PexelsPhoto {
    alt: Option<String>,
    photographer: Option<String>,
    #[serde(default)]
    src: PexelsSrc,
}

#[derive(Debug, Default, Deserialize)]
struct PexelsSrc {
    large: Option<String>,
    medium: Option<String>,
}

fn map_pexels(value: JsonValue) -> Result<Vec<ContentCandidate>, ProviderError> {
    let search: PexelsSearch =
        serde_json::from_value(value).map_err(|e| decode_err("pexels", e))?;
    Ok(search
        .photos
        .into_iter()
        .filter_map(|photo| {
            let url = http_url(photo.src.large)?;
            let title = photo
                .alt
                .filter(|alt| !alt.trim().is_empty())
                .or(photo.photographer);
            Some(ContentCandidate {
                kind: ContentKind::Image,
                natural_key: natural_key_for_url(&url),
                provider: "pexels".into(),
                title,
                text: None,
                thumb: http_url(photo.src.medium),
                language: Some("en".into()),
                url,
            })
        })
        .collect())
}

#[async_trait]
impl Provider for PexelsProvider {
    fn id(&self) -> &'static str {
        "pexels"
    }

    fn kind(&self) -> ContentKind {
        ContentKind::Image
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        request: &ProviderRequest,
    ) -> Result<Vec<ContentCandidate>, ProviderError> {
        let value = http
            .get_json(
                "https://api.pexels.com/v1/search",
                &[
                    ("query", request.query.clone()),
                    ("per_page", request.per.to_string()),
                    ("page", request.page.max(1).to_string()),
                ],
                &[("Authorization", self.key.clone())],
            )
            .await?;
        map_pexels(value)
    }
}

#[derive(Debug, Clone, Copy)]
struct RedditProvider;

#[derive(Debug, Deserialize)]
struct RedditListing {
    data: RedditListingData,
}

#[derive(Debug, Deserialize)]
struct RedditListingData {
    #[serde(default)]
    children: Vec<RedditChild>,
}

#[derive(Debug, Deserialize)]
struct RedditChild {
    data: RedditPost,
}

#[derive(Debug, Deserialize)]
struct RedditPost {
    title: Option<String>,
    url_overridden_by_dest: Option<String>,
    url: Option<String>,
    thumbnail: Option<String>,
}

fn map_reddit(value: JsonValue) -> Result<Vec<ContentCandidate>, ProviderError> {
    let listing: RedditListing =
        serde_json::from_value(value).map_err(|e| decode_err("reddit", e))?;
    Ok(listing
        .data
        .children
        .into_iter()
        .filter_map(|child| {
            let post = child.data;
            let url = http_url(post.url_overridden_by_dest).or_else(|| http_url(post.url))?;
            Some(ContentCandidate {
                kind: ContentKind::Image,
                natural_key: natural_key_for_url(&url),
                provider: "reddit".into(),
                title: post.title,
                text: None,
                thumb: http_url(post.thumbnail),
                language: Some("en".into()),
                url,
            })
        })
        .collect())
}

#[async_trait]
impl Provider for RedditProvider {
    fn id(&self) -> &'static str {
        "reddit"
    }

    fn kind(&self) -> ContentKind {
        ContentKind::Image
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        request: &ProviderRequest,
    ) -> Result<Vec<ContentCandidate>, ProviderError> {
        let subreddit = request.subreddit.as_deref().unwrap_or("pics");
        let url = format!("https://www.reddit.com/r/{subreddit}/search.json");
        let value = http
            .get_json(
                &url,
                &[
                    ("q", request.query.clone()),
                    ("restrict_sr", "1".into()),
                    ("limit", request.per.to_string()),
                    ("raw_json", "1".into()),
                ],
                &[],
            )
            .await?;
        map_reddit(value)
    }
}

#[derive(Debug, Clone)]
struct YoutubeProvider {
    key: String,
}

#[derive(Debug, Deserialize)]
struct YoutubeSearch {
    #[serde(default)]
    items: Vec<YoutubeItem>,
}

#[derive(Debug, Deserialize)]
struct YoutubeItem {
    id: Option<YoutubeItemId>,
    snippet: Option<YoutubeSnippet>,
}

#[derive(Debug, Deserialize)]
struct YoutubeItemId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YoutubeSnippet {
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    thumbnails: YoutubeThumbnails,
    #[serde(rename = "resourceId")]
    resource_id: Option<YoutubeResourceId>,
}

#[derive(Debug, Default, Deserialize)]
struct YoutubeThumbnails {
    medium: Option<YoutubeThumbnail>,
}

#[derive(Debug, Deserialize)]
struct YoutubeThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YoutubeResourceId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

fn youtube_candidate(video_id: String, snippet: Option<YoutubeSnippet>) -> ContentCandidate {
    let (title, description, thumb) = match snippet {
        Some(snippet) => (
            snippet.title,
            snippet.description,
            snippet.thumbnails.medium.and_then(|t| http_url(t.url)),
        ),
        None => (None, None, None),
    };
    ContentCandidate {
        kind: ContentKind::Video,
        url: format!("https://www.youtube.com/watch?v={video_id}"),
        natural_key: natural_key_for_video(&video_id),
        provider: "youtube".into(),
        title,
        text: description,
        thumb,
        language: None,
    }
}

fn map_youtube(value: JsonValue) -> Result<Vec<ContentCandidate>, ProviderError> {
    let search: YoutubeSearch =
        serde_json::from_value(value).map_err(|e| decode_err("youtube", e))?;
    Ok(search
        .items
        .into_iter()
        .filter_map(|item| {
            let video_id = item
                .id
                .and_then(|id| id.video_id)
                .or_else(|| {
                    item.snippet
                        .as_ref()
                        .and_then(|s| s.resource_id.as_ref())
                        .and_then(|r| r.video_id.clone())
                })?
                .trim()
                .to_string();
            if video_id.is_empty() {
                return None;
            }
            Some(youtube_candidate(video_id, item.snippet))
        })
        .collect())
}

#[async_trait]
impl Provider for YoutubeProvider {
    fn id(&self) -> &'static str {
        "youtube"
    }

    fn kind(&self) -> ContentKind {
        ContentKind::Video
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        request: &ProviderRequest,
    ) -> Result<Vec<ContentCandidate>, ProviderError> {
        // The Data API paginates by opaque token; only the first page is
        // addressable here, later pages yield nothing.
        if request.page > 1 {
            return Ok(Vec::new());
        }

        let value = if let Some(playlist) = &request.playlist {
            http.get_json(
                "https://www.googleapis.com/youtube/v3/playlistItems",
                &[
                    ("part", "snippet".into()),
                    ("playlistId", playlist.clone()),
                    ("maxResults", request.per.to_string()),
                    ("key", self.key.clone()),
                ],
                &[],
            )
            .await?
        } else {
            let mut query = vec![
                ("part", "snippet".to_string()),
                ("type", "video".to_string()),
                ("q", request.query.clone()),
                ("maxResults", request.per.to_string()),
                ("key", self.key.clone()),
            ];
            if let Some(channel) = &request.channel {
                query.push(("channelId", channel.clone()));
            }
            if let Some(days) = request.days {
                let after = Utc::now() - chrono::Duration::days(i64::from(days));
                query.push((
                    "publishedAfter",
                    after.to_rfc3339_opts(SecondsFormat::Secs, true),
                ));
            }
            http.get_json("https://www.googleapis.com/youtube/v3/search", &query, &[])
                .await?
        };
        map_youtube(value)
    }
}

#[derive(Debug, Clone, Copy)]
struct QuotableProvider;

#[derive(Debug, Deserialize)]
struct QuotableSearch {
    #[serde(default)]
    results: Vec<QuotableQuote>,
}

#[derive(Debug, Deserialize)]
struct QuotableQuote {
    #[serde(rename = "_id")]
    id: Option<String>,
    content: Option<String>,
    author: Option<String>,
}

fn map_quotable(value: JsonValue) -> Result<Vec<ContentCandidate>, ProviderError> {
    let search: QuotableSearch =
        serde_json::from_value(value).map_err(|e| decode_err("quotable", e))?;
    Ok(search
        .results
        .into_iter()
        .filter_map(|quote| {
            let id = quote.id?;
            let content = quote.content.filter(|c| !c.trim().is_empty())?;
            Some(ContentCandidate {
                kind: ContentKind::Quote,
                natural_key: natural_key_for_text("quotable", &id),
                provider: "quotable".into(),
                title: quote.author,
                text: Some(content),
                url: format!("https://quotable.io/quotes/{id}"),
                thumb: None,
                language: Some("en".into()),
            })
        })
        .collect())
}

#[async_trait]
impl Provider for QuotableProvider {
    fn id(&self) -> &'static str {
        "quotable"
    }

    fn kind(&self) -> ContentKind {
        ContentKind::Quote
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        request: &ProviderRequest,
    ) -> Result<Vec<ContentCandidate>, ProviderError> {
        let value = http
            .get_json(
                "https://api.quotable.io/search/quotes",
                &[
                    ("query", request.query.clone()),
                    ("limit", request.per.to_string()),
                    ("page", request.page.max(1).to_string()),
                ],
                &[],
            )
            .await?;
        map_quotable(value)
    }
}

#[derive(Debug, Clone, Copy)]
struct JokeApiProvider;

#[derive(Debug, Deserialize)]
struct JokeApiEnvelope {
    #[serde(default)]
    error: bool,
    message: Option<String>,
    #[serde(default)]
    jokes: Vec<JokeApiJoke>,
    #[serde(flatten)]
    single: Option<JokeApiJoke>,
}

#[derive(Debug, Deserialize)]
struct JokeApiJoke {
    id: Option<i64>,
    joke: Option<String>,
    setup: Option<String>,
    delivery: Option<String>,
    lang: Option<String>,
}

impl JokeApiJoke {
    fn text(&self) -> Option<String> {
        if let Some(joke) = &self.joke {
            return Some(joke.clone());
        }
        match (&self.setup, &self.delivery) {
            (Some(setup), Some(delivery)) => Some(format!("{setup}\n{delivery}")),
            _ => None,
        }
    }
}

fn map_jokeapi(value: JsonValue) -> Result<Vec<ContentCandidate>, ProviderError> {
    let envelope: JokeApiEnvelope =
        serde_json::from_value(value).map_err(|e| decode_err("jokeapi", e))?;
    if envelope.error {
        return Err(ProviderError::Decode {
            provider: "jokeapi",
            message: envelope.message.unwrap_or_else(|| "error response".into()),
        });
    }
    let jokes = if envelope.jokes.is_empty() {
        envelope.single.into_iter().collect::<Vec<_>>()
    } else {
        envelope.jokes
    };
    Ok(jokes
        .into_iter()
        .filter_map(|joke| {
            let id = joke.id?;
            let text = joke.text()?;
            Some(ContentCandidate {
                kind: ContentKind::Joke,
                natural_key: natural_key_for_text("jokeapi", &id.to_string()),
                provider: "jokeapi".into(),
                title: None,
                text: Some(text),
                url: format!("https://v2.jokeapi.dev/joke/Any?idRange={id}"),
                thumb: None,
                language: joke.lang,
            })
        })
        .collect())
}

#[async_trait]
impl Provider for JokeApiProvider {
    fn id(&self) -> &'static str {
        "jokeapi"
    }

    fn kind(&self) -> ContentKind {
        ContentKind::Joke
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        request: &ProviderRequest,
    ) -> Result<Vec<ContentCandidate>, ProviderError> {
        let value = http
            .get_json(
                "https://v2.jokeapi.dev/joke/Any",
                &[
                    ("contains", request.query.clone()),
                    ("amount", request.per.clamp(1, 10).to_string()),
                    ("safe-mode", String::new()),
                ],
                &[],
            )
            .await?;
        map_jokeapi(value)
    }
}

#[derive(Debug, Clone)]
struct ApiNinjasFactsProvider {
    key: String,
}

#[derive(Debug, Deserialize)]
struct ApiNinjasFact {
    fact: Option<String>,
}

fn map_api_ninjas(value: JsonValue) -> Result<Vec<ContentCandidate>, ProviderError> {
    let facts: Vec<ApiNinjasFact> =
        serde_json::from_value(value).map_err(|e| decode_err("api-ninjas", e))?;
    Ok(facts
        .into_iter()
        .filter_map(|entry| {
            let fact = entry.fact.filter(|f| !f.trim().is_empty())?;
            Some(ContentCandidate {
                kind: ContentKind::Fact,
                natural_key: natural_key_for_text("api-ninjas", &fact),
                provider: "api-ninjas".into(),
                title: None,
                text: Some(fact),
                url: "https://api-ninjas.com/api/facts".into(),
                thumb: None,
                language: Some("en".into()),
            })
        })
        .collect())
}

#[async_trait]
impl Provider for ApiNinjasFactsProvider {
    fn id(&self) -> &'static str {
        "api-ninjas"
    }

    fn kind(&self) -> ContentKind {
        ContentKind::Fact
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        request: &ProviderRequest,
    ) -> Result<Vec<ContentCandidate>, ProviderError> {
        // The facts endpoint is not searchable; each call returns a fresh
        // batch and the sink's dedup absorbs the overlap.
        let value = http
            .get_json(
                "https://api.api-ninjas.com/v1/facts",
                &[("limit", request.per.clamp(1, 30).to_string())],
                &[("X-Api-Key", self.key.clone())],
            )
            .await?;
        map_api_ninjas(value)
    }
}

#[derive(Debug, Clone)]
struct SearxProvider {
    base: String,
}

#[derive(Debug, Deserialize)]
struct SearxSearch {
    #[serde(default)]
    results: Vec<SearxResult>,
}

#[derive(Debug, Deserialize)]
struct SearxResult {
    title: Option<String>,
    url: Option<String>,
    content: Option<String>,
}

fn map_searx(value: JsonValue) -> Result<Vec<ContentCandidate>, ProviderError> {
    let search: SearxSearch =
        serde_json::from_value(value).map_err(|e| decode_err("searx", e))?;
    Ok(search
        .results
        .into_iter()
        .filter_map(|result| {
            let url = http_url(result.url)?;
            Some(ContentCandidate {
                kind: ContentKind::Web,
                natural_key: natural_key_for_url(&url),
                provider: "searx".into(),
                title: result.title,
                text: result.content,
                thumb: None,
                language: None,
                url,
            })
        })
        .collect())
}

#[async_trait]
impl Provider for SearxProvider {
    fn id(&self) -> &'static str {
        "searx"
    }

    fn kind(&self) -> ContentKind {
        ContentKind::Web
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        request: &ProviderRequest,
    ) -> Result<Vec<ContentCandidate>, ProviderError> {
        let url = format!("{}/search", self.base.trim_end_matches('/'));
        let value = http
            .get_json(
                &url,
                &[
                    ("q", request.query.clone()),
                    ("format", "json".into()),
                    ("pageno", request.page.max(1).to_string()),
                ],
                &[],
            )
            .await?;
        map_searx(value)
    }
}

/// Queries and fixed parameters for one harvest pass.
#[derive(Debug, Clone, Default)]
pub struct HarvestPlan {
    pub queries: Vec<String>,
    pub per: usize,
    pub pages: usize,
    pub days: Option<u32>,
    pub playlist: Option<String>,
    pub channel: Option<String>,
    pub subreddit: Option<String>,
}

#[derive(Debug, Default)]
pub struct HarvestOutcome {
    pub candidates: Vec<ContentCandidate>,
    pub scanned: usize,
    pub failed_calls: usize,
}

/// Runs every provider over every query sequentially. A failed call is zero
/// results for that query; it never aborts the remaining queries or
/// providers. Candidate lists concatenate in provider priority order.
pub async fn harvest(
    providers: &[Arc<dyn Provider>],
    http: &HttpFetcher,
    plan: &HarvestPlan,
) -> HarvestOutcome {
    let mut outcome = HarvestOutcome::default();
    for provider in providers {
        for query in &plan.queries {
            for page in 1..=plan.pages.max(1) {
                let request = ProviderRequest {
                    query: query.clone(),
                    per: plan.per.max(1),
                    page,
                    days: plan.days,
                    playlist: plan.playlist.clone(),
                    channel: plan.channel.clone(),
                    subreddit: plan.subreddit.clone(),
                };
                match provider.search(http, &request).await {
                    Ok(candidates) => outcome.candidates.extend(candidates),
                    Err(err) => {
                        outcome.failed_calls += 1;
                        warn!(
                            provider = provider.id(),
                            query = query.as_str(),
                            page,
                            error = %err,
                            "provider call failed, treating as zero results"
                        );
                    }
                }
            }
        }
    }
    outcome.scanned = outcome.candidates.len();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Write;
    use trove_storage::HttpClientConfig;

    fn dict(subjects: &[&str], energies: &[&str], formats: &[&str]) -> KeywordDictionary {
        KeywordDictionary {
            subjects: subjects.iter().map(ToString::to_string).collect(),
            energies: energies.iter().map(ToString::to_string).collect(),
            formats: formats.iter().map(ToString::to_string).collect(),
            ..KeywordDictionary::default()
        }
    }

    #[test]
    fn synthesizes_exactly_n_distinct_queries() {
        let dict = dict(
            &["cats", "dogs", "otters", "space", "trains"],
            &["funny", "calm", "wild"],
            &["clip", "photo"],
        );
        let mut rng = StdRng::seed_from_u64(7);
        let queries = synthesize_queries(&dict, 10, &mut rng);

        assert_eq!(queries.len(), 10);
        let mut unique = queries.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 10);
        assert!(queries.iter().all(|q| !q.trim().is_empty()));
    }

    #[test]
    fn empty_dictionary_yields_builtin_fallback() {
        let mut rng = StdRng::seed_from_u64(1);
        let queries = synthesize_queries(&KeywordDictionary::default(), 5, &mut rng);
        assert_eq!(queries.len(), 2);
        assert!(queries.iter().all(|q| !q.is_empty()));
        assert_ne!(queries[0], queries[1]);

        let one = synthesize_queries(&KeywordDictionary::default(), 1, &mut rng);
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn tiny_dictionary_uses_only_its_tokens() {
        let dict = dict(&["cats"], &["funny"], &["clip"]);
        let mut rng = StdRng::seed_from_u64(3);
        let queries = synthesize_queries(&dict, 1, &mut rng);
        assert_eq!(queries.len(), 1);
        assert!(!queries[0].is_empty());
        for token in queries[0].split_whitespace() {
            assert!(["funny", "cats", "clip"].contains(&token), "stray token {token}");
        }
    }

    #[test]
    fn same_seed_is_deterministic() {
        let dict = dict(&["cats", "dogs"], &["funny"], &["clip", "photo"]);
        let a = synthesize_queries(&dict, 4, &mut StdRng::seed_from_u64(42));
        let b = synthesize_queries(&dict, 4, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn combination_space_counts_optional_absence() {
        let dict = dict(&["cats"], &["funny"], &["clip"]);
        // 1 subject x (energy present or absent) x (format present or absent)
        assert_eq!(dict.combination_space(), 4);
    }

    #[tokio::test]
    async fn dictionary_cache_loads_once() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "subjects: [cats]\nenergies: [funny]").expect("write yaml");
        let cache = DictionaryCache::new(file.path());

        let first = cache.get().await.expect("first load");
        assert_eq!(first.subjects, vec!["cats".to_string()]);
        let second = cache.get().await.expect("second load");
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn unsplash_mapping_discards_urlless_entries() {
        let value = serde_json::json!({
            "results": [
                {
                    "description": "a cat",
                    "urls": {"regular": "https://images.example/cat.jpg",
                             "small": "https://images.example/cat_s.jpg"}
                },
                {"description": "broken", "urls": {}}
            ]
        });
        let candidates = map_unsplash(value).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].natural_key, "https://images.example/cat.jpg");
        assert_eq!(candidates[0].title.as_deref(), Some("a cat"));
        assert_eq!(candidates[0].kind, ContentKind::Image);
    }

    #[test]
    fn youtube_mapping_keys_by_video_id() {
        let value = serde_json::json!({
            "items": [
                {"id": {"videoId": "abc123"},
                 "snippet": {"title": "t", "description": "d",
                             "thumbnails": {"medium": {"url": "https://i.ytimg.com/x.jpg"}}}},
                {"id": {"kind": "youtube#channel"}, "snippet": {"title": "no video"}}
            ]
        });
        let candidates = map_youtube(value).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].natural_key, "abc123");
        assert_eq!(candidates[0].url, "https://www.youtube.com/watch?v=abc123");
    }

    #[test]
    fn jokeapi_mapping_handles_both_shapes() {
        let many = serde_json::json!({
            "error": false,
            "jokes": [
                {"id": 1, "type": "single", "joke": "ha", "lang": "en"},
                {"id": 2, "type": "twopart", "setup": "knock", "delivery": "who", "lang": "en"}
            ]
        });
        let candidates = map_jokeapi(many).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].natural_key, "jokeapi:1");
        assert_eq!(candidates[1].text.as_deref(), Some("knock\nwho"));

        let single = serde_json::json!({
            "error": false, "id": 9, "type": "single", "joke": "solo", "lang": "en"
        });
        let candidates = map_jokeapi(single).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].natural_key, "jokeapi:9");

        let failed = serde_json::json!({"error": true, "message": "no jokes"});
        assert!(map_jokeapi(failed).is_err());
    }

    #[test]
    fn registry_skips_providers_without_credentials() {
        let bare = ProviderCredentials::default();
        let images = providers_for(ContentKind::Image, &bare);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id(), "reddit");
        assert!(providers_for(ContentKind::Video, &bare).is_empty());

        let full = ProviderCredentials {
            unsplash_key: Some("u".into()),
            pexels_key: Some("p".into()),
            youtube_key: Some("y".into()),
            api_ninjas_key: Some("n".into()),
            searx_base: Some("https://searx.example".into()),
        };
        let images = providers_for(ContentKind::Image, &full);
        let ids: Vec<_> = images.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["unsplash", "pexels", "reddit"]);
    }

    struct FlakyProvider;

    #[async_trait]
    impl Provider for FlakyProvider {
        fn id(&self) -> &'static str {
            "flaky"
        }

        fn kind(&self) -> ContentKind {
            ContentKind::Quote
        }

        async fn search(
            &self,
            _http: &HttpFetcher,
            request: &ProviderRequest,
        ) -> Result<Vec<ContentCandidate>, ProviderError> {
            if request.query == "bad" {
                return Err(ProviderError::Decode {
                    provider: "flaky",
                    message: "boom".into(),
                });
            }
            Ok(vec![ContentCandidate {
                kind: ContentKind::Quote,
                natural_key: natural_key_for_text("flaky", &request.query),
                provider: "flaky".into(),
                title: None,
                text: Some(request.query.clone()),
                url: format!("https://flaky.example/{}", request.query),
                thumb: None,
                language: Some("en".into()),
            }])
        }
    }

    #[tokio::test]
    async fn harvest_survives_per_query_failures() {
        let providers: Vec<Arc<dyn Provider>> = vec![Arc::new(FlakyProvider)];
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("http");
        let plan = HarvestPlan {
            queries: vec!["good".into(), "bad".into(), "fine".into()],
            per: 5,
            pages: 1,
            ..HarvestPlan::default()
        };

        let outcome = harvest(&providers, &http, &plan).await;
        assert_eq!(outcome.scanned, 2);
        assert_eq!(outcome.failed_calls, 1);
        assert_eq!(outcome.candidates.len(), 2);
    }
}
