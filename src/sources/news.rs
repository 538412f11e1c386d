// src/sources/news.rs
//
// Energy news via RSS. Each feed is fetched and parsed with quick-xml;
// items become raw rows (ts, feed, title) and the validator later folds
// them into per-feed article counts. Unparseable pubDates are kept as
// null timestamps so malformed-row accounting happens in one place.

use async_trait::async_trait;
use metrics::histogram;
use quick_xml::de::from_str;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use crate::batch::RawBatch;
use crate::config::SourceConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{SourceId, SourceKind, Window};
use crate::sources::SourceClient;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

const FIXTURE_WIRE: &str = include_str!("fixtures/energy_wire.rss");
const FIXTURE_GRID: &str = include_str!("fixtures/grid_daily.rss");

pub struct NewsClient {
    id: SourceId,
    mode: Mode,
    request_gap: Duration,
}

enum Mode {
    Fixture(Vec<(String, String)>),
    Http {
        feeds: Vec<String>,
        client: reqwest::Client,
    },
}

impl NewsClient {
    pub fn from_config(sc: &SourceConfig) -> PipelineResult<Self> {
        let id = SourceId::new(&sc.id);
        let mode = if sc.feeds.is_empty() {
            Mode::Fixture(builtin_fixtures())
        } else {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(sc.timeout_secs))
                .build()
                .map_err(|e| PipelineError::config(format!("building http client for {id}: {e}")))?;
            Mode::Http {
                feeds: sc.feeds.clone(),
                client,
            }
        };
        Ok(NewsClient {
            id,
            mode,
            request_gap: Duration::from_millis(sc.min_request_gap_ms),
        })
    }

    pub fn fixture(id: impl Into<String>) -> Self {
        NewsClient {
            id: SourceId::new(id),
            mode: Mode::Fixture(builtin_fixtures()),
            request_gap: Duration::ZERO,
        }
    }

    /// Fixture from caller-supplied XML, for tests.
    pub fn from_fixture_str(id: impl Into<String>, feed: &str, xml: &str) -> Self {
        NewsClient {
            id: SourceId::new(id),
            mode: Mode::Fixture(vec![(feed.to_string(), xml.to_string())]),
            request_gap: Duration::ZERO,
        }
    }

    fn parse_feed(&self, feed: &str, xml: &str) -> PipelineResult<Vec<Value>> {
        let t0 = std::time::Instant::now();
        let clean = scrub_html_entities_for_xml(xml);
        let rss: Rss = from_str(&clean).map_err(|e| {
            PipelineError::schema_drift(self.id.as_str(), format!("feed {feed}: {e}"))
        })?;

        let mut rows = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let title = normalize_title(it.title.as_deref().unwrap_or_default());
            let ts = it.pub_date.as_deref().and_then(parse_rfc2822_to_unix);
            rows.push(json!({
                "ts": ts.map(unix_to_rfc3339),
                "feed": feed,
                "title": title,
            }));
        }

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("collect_parse_ms").record(ms);
        Ok(rows)
    }
}

#[async_trait]
impl SourceClient for NewsClient {
    async fn fetch(&self, _window: &Window) -> PipelineResult<RawBatch> {
        let mut rows: Vec<Value> = Vec::new();
        match &self.mode {
            Mode::Fixture(feeds) => {
                for (feed, xml) in feeds {
                    rows.extend(self.parse_feed(feed, xml)?);
                }
            }
            Mode::Http { feeds, client } => {
                for (i, url) in feeds.iter().enumerate() {
                    if i > 0 && !self.request_gap.is_zero() {
                        tokio::time::sleep(self.request_gap).await;
                    }
                    let resp = client.get(url).send().await.map_err(|e| {
                        PipelineError::transient(self.id.as_str(), format!("feed {url}: {e}"))
                    })?;
                    let status = resp.status();
                    if !status.is_success() {
                        return Err(crate::sources::classify_status(&self.id, status));
                    }
                    let body = resp.text().await.map_err(|e| {
                        PipelineError::transient(self.id.as_str(), format!("feed {url}: {e}"))
                    })?;
                    rows.extend(self.parse_feed(&feed_label(url), &body)?);
                }
            }
        }
        Ok(RawBatch {
            source: self.id.clone(),
            rows,
            truncated: false,
        })
    }

    fn id(&self) -> &SourceId {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::News
    }
}

fn builtin_fixtures() -> Vec<(String, String)> {
    vec![
        ("energy-wire".to_string(), FIXTURE_WIRE.to_string()),
        ("grid-daily".to_string(), FIXTURE_GRID.to_string()),
    ]
}

/// Stable series label for a feed URL: host plus path, slugified.
pub(crate) fn feed_label(url: &str) -> String {
    let stripped = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    let mut label: String = stripped
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    while label.contains("--") {
        label = label.replace("--", "-");
    }
    label.trim_matches('-').to_string()
}

fn parse_rfc2822_to_unix(ts: &str) -> Option<i64> {
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
}

fn unix_to_rfc3339(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Decode entities, strip tags, fold smart quotes, collapse whitespace.
fn normalize_title(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    out = re_tags.replace_all(&out, "").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").expect("ws regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > 300 {
        out = out.chars().take(300).collect();
    }
    out
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
