// src/analysis/narrative.rs
//
// External narrative service client. The report pipeline treats this as
// best-effort: a summary comes back or it does not, and the quantitative
// sections are produced either way. Failure is only distinguished from
// "not configured" so the report status can say which happened.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::NarrativeConfig;

const SYSTEM_PROMPT: &str = "You are an energy-market analyst. Given aggregate \
statistics for one week, write ONE short paragraph (<=600 ASCII chars) of neutral \
insight. Output only the paragraph.";

#[async_trait]
pub trait NarrativeClient: Send + Sync {
    /// Produce a narrative paragraph from serialized aggregates, or `None`.
    async fn summarize(&self, aggregates_json: &str) -> Option<String>;
    /// False only for the not-configured client; a `None` from an enabled
    /// client degrades the report.
    fn enabled(&self) -> bool {
        true
    }
    fn provider_name(&self) -> &'static str;
}

pub type DynNarrativeClient = Arc<dyn NarrativeClient>;

/// Build the client the way the config asks. Misconfiguration (enabled
/// without a key or URL) yields an always-failing client so the gap is
/// visible in report status instead of silently dropping the section.
pub fn build_narrative_client(cfg: &NarrativeConfig) -> DynNarrativeClient {
    if !cfg.enabled {
        return Arc::new(DisabledClient);
    }
    let api_key = match cfg.resolved_api_key() {
        Ok(Some(key)) => key,
        Ok(None) => return Arc::new(DisabledClient),
        Err(e) => {
            warn!(error = %e, "narrative enabled but key unavailable");
            return Arc::new(UnavailableClient);
        }
    };
    let Some(base_url) = cfg.base_url.clone() else {
        warn!("narrative enabled but base_url missing");
        return Arc::new(UnavailableClient);
    };
    match HttpNarrativeClient::new(base_url, api_key, cfg) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!(error = %e, "narrative http client build failed");
            Arc::new(UnavailableClient)
        }
    }
}

/// Narrative turned off in config.
pub struct DisabledClient;

#[async_trait]
impl NarrativeClient for DisabledClient {
    async fn summarize(&self, _aggregates_json: &str) -> Option<String> {
        None
    }
    fn enabled(&self) -> bool {
        false
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

/// Enabled on paper, unusable in practice (missing key or URL).
struct UnavailableClient;

#[async_trait]
impl NarrativeClient for UnavailableClient {
    async fn summarize(&self, _aggregates_json: &str) -> Option<String> {
        None
    }
    fn provider_name(&self) -> &'static str {
        "unavailable"
    }
}

/// Deterministic client for tests.
pub struct MockClient {
    pub fixed: Option<String>,
}

#[async_trait]
impl NarrativeClient for MockClient {
    async fn summarize(&self, _aggregates_json: &str) -> Option<String> {
        self.fixed.clone()
    }
    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

pub struct HttpNarrativeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl HttpNarrativeClient {
    fn new(base_url: String, api_key: String, cfg: &NarrativeConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(HttpNarrativeClient {
            http,
            base_url,
            api_key,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
        })
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}
#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    max_tokens: u32,
}
#[derive(Deserialize)]
struct Resp {
    choices: Vec<Choice>,
}
#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}
#[derive(Deserialize)]
struct ChoiceMsg {
    content: String,
}

#[async_trait]
impl NarrativeClient for HttpNarrativeClient {
    async fn summarize(&self, aggregates_json: &str) -> Option<String> {
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: aggregates_json,
                },
            ],
            temperature: 0.2,
            max_tokens: self.max_tokens,
        };

        let resp = match self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "narrative request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "narrative service returned error");
            return None;
        }
        let body: Resp = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "narrative response decode failed");
                return None;
            }
        };
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        let cleaned = sanitize_summary(content);
        if cleaned.is_empty() {
            None
        } else {
            Some(cleaned)
        }
    }

    fn provider_name(&self) -> &'static str {
        "http"
    }
}

/// Single line, ASCII only, <=600 chars, collapsed whitespace.
pub fn sanitize_summary(input: &str) -> String {
    let mut out = String::with_capacity(600);
    let mut prev_space = false;
    for ch in input.chars() {
        let c = match ch {
            '\r' | '\n' | '\t' => ' ',
            c if c.is_ascii() => c,
            _ => ' ',
        };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
        if out.len() >= 600 {
            break;
        }
    }
    out.trim().to_string()
}
