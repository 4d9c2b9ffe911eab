use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use rand::Rng;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::BotConfig;
use crate::record::{PressImage, extension_from_url};
use crate::timeparse;

/// Stable ascending sort field; ties are broken by the remote's own per-item
/// sort value, which is also the pagination cursor.
pub const SORT_FIELD: &str = "dataPublicacioPortal";

const FILTER_PATH: &str = "hits.hits._source,hits.hits.sort,hits.total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct SearchPage {
    pub records: Vec<PressImage>,
    pub total: u64,
    /// The remote omitted `hits.hits`, signalling exhaustion.
    pub exhausted: bool,
}

/// Seam over the remote search API so the collector can be driven by an
/// in-memory fake in tests.
pub trait PressSearchApi {
    fn fetch_page(&mut self, range: &DateRange, after: Option<i64>) -> Result<SearchPage>;
}

/// Cursor for the next page, computed from a page's sort values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorStep {
    pub value: i64,
    /// The entire page shared one sort value; advancing past it may skip
    /// unseen same-valued records. Documented remote-API risk, not solvable
    /// client-side.
    pub whole_page_tied: bool,
}

/// Recompute the cursor for the next `search_after`. A naive "last element's
/// sort value" drops records when a page boundary lands on a tie, so a tied
/// tail run steps back to the preceding sort value and the tied records are
/// re-served on the next page; the idempotent batch merge absorbs them.
pub fn cursor_after_page(sort_keys: &[i64]) -> Option<CursorStep> {
    let last = *sort_keys.last()?;
    let tail_run = sort_keys
        .iter()
        .rev()
        .take_while(|&&key| key == last)
        .count();
    if tail_run == sort_keys.len() {
        return Some(CursorStep {
            value: last,
            whole_page_tied: true,
        });
    }
    if tail_run > 1 {
        return Some(CursorStep {
            value: sort_keys[sort_keys.len() - tail_run - 1],
            whole_page_tied: false,
        });
    }
    Some(CursorStep {
        value: last,
        whole_page_tied: false,
    })
}

/// POST body for one bounded query:
/// sort ascending, date range filter, document type filter, optional cursor.
pub fn build_query(range: &DateRange, after: Option<i64>) -> Value {
    let mut body = json!({
        "sort": { SORT_FIELD: { "order": "asc" } },
        "query": { "bool": {
            "must": [ { "range": { SORT_FIELD: {
                "format": "date_optional_time",
                "gte": timeparse::range_start_iso(range.start),
                "lte": timeparse::range_end_iso(range.end),
            } } } ],
            "filter": [ { "match": { "type.main": "5" } } ],
        } },
    });
    if let Some(cursor) = after {
        body["search_after"] = json!([cursor]);
    }
    body
}

pub struct SearchClient {
    client: Client,
    api_url: String,
    user_agent: String,
    page_size: usize,
    delay_bounds_secs: (u64, u64),
}

impl SearchClient {
    pub fn new(config: &BotConfig) -> Result<Self> {
        let timeout_ms = config.search.timeout_ms.unwrap_or(40_000);
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("failed to build press search HTTP client")?;
        Ok(Self {
            client,
            api_url: config.search_api_url(),
            user_agent: config.user_agent(),
            page_size: config.page_size(),
            delay_bounds_secs: config.delay_bounds_secs(),
        })
    }

    /// Randomized pause before every request to stay under remote throttling.
    fn pause(&self) {
        let (min_delay, max_delay) = self.delay_bounds_secs;
        let secs = if min_delay >= max_delay {
            min_delay
        } else {
            rand::thread_rng().gen_range(min_delay..=max_delay)
        };
        sleep(Duration::from_secs(secs));
    }
}

impl PressSearchApi for SearchClient {
    fn fetch_page(&mut self, range: &DateRange, after: Option<i64>) -> Result<SearchPage> {
        self.pause();
        let response = self
            .client
            .post(&self.api_url)
            .header("User-Agent", self.user_agent.clone())
            .query(&[
                ("size", self.page_size.to_string()),
                ("track_total_hits", "true".to_string()),
                ("filter_path", FILTER_PATH.to_string()),
            ])
            .json(&build_query(range, after))
            .send()
            .context("failed to call press search API")?;

        let status = response.status();
        if !status.is_success() {
            bail!("press search API request failed with HTTP {status}");
        }
        let payload: SearchResponse = response
            .json()
            .context("failed to decode press search JSON response")?;
        Ok(page_from_response(payload))
    }
}

fn page_from_response(payload: SearchResponse) -> SearchPage {
    let envelope = match payload.hits {
        Some(envelope) => envelope,
        None => {
            return SearchPage {
                records: Vec::new(),
                total: 0,
                exhausted: true,
            };
        }
    };
    let total = envelope.total.map(|total| total.value).unwrap_or(0);
    match envelope.hits {
        Some(hits) => SearchPage {
            records: hits.into_iter().map(image_from_hit).collect(),
            total,
            exhausted: false,
        },
        None => SearchPage {
            records: Vec::new(),
            total,
            exhausted: true,
        },
    }
}

fn image_from_hit(hit: Hit) -> PressImage {
    let source = hit.source;
    let download_url = source.multimedia.download_url;
    PressImage {
        id: value_to_code(&source.source_id),
        title: source.titular,
        subtitle: clean_subtitle(source.subtitol.as_deref().unwrap_or("")),
        extension: extension_from_url(&download_url),
        download_url,
        publication_date: source.publication_date,
        agencies: source
            .departaments
            .into_iter()
            .map(|department| department.abreviatura)
            .collect(),
        subtype: value_to_code(&source.doc_type.subtype),
        sort_key: hit.sort.first().copied().unwrap_or_default(),
        status: Default::default(),
        width: source.multimedia.amplada,
        height: source.multimedia.alcada,
    }
}

/// The remote pads some subtitles with a literal trailing " null".
fn clean_subtitle(subtitle: &str) -> String {
    subtitle
        .strip_suffix(" null")
        .unwrap_or(subtitle)
        .trim()
        .to_string()
}

/// Ids and type codes arrive as strings or bare numbers depending on the
/// document generation.
fn value_to_code(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Option<HitsEnvelope>,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    hits: Option<Vec<Hit>>,
    total: Option<HitsTotal>,
}

#[derive(Debug, Deserialize)]
struct HitsTotal {
    value: u64,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: HitSource,
    #[serde(default)]
    sort: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct HitSource {
    #[serde(rename = "sourceId")]
    source_id: Value,
    titular: String,
    #[serde(default)]
    subtitol: Option<String>,
    #[serde(rename = "dataPublicacioPortal")]
    publication_date: String,
    multimedia: Multimedia,
    #[serde(default)]
    departaments: Vec<Departament>,
    #[serde(rename = "type")]
    doc_type: DocType,
}

#[derive(Debug, Deserialize)]
struct Multimedia {
    #[serde(rename = "downloadUrl")]
    download_url: String,
    #[serde(default)]
    alcada: Option<u32>,
    #[serde(default)]
    amplada: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Departament {
    abreviatura: String,
}

#[derive(Debug, Deserialize)]
struct DocType {
    subtype: Value,
}
