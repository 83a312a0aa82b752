use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::cli::SearchProvider;
use crate::config::RuntimeConfig;
use crate::error::{ResearchError, Result};

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";
const DUCKDUCKGO_ENDPOINT: &str = "https://api.duckduckgo.com/";
const WIKIPEDIA_ENDPOINT: &str = "https://en.wikipedia.org/w/api.php";

/// Web search returning an opaque, already formatted text blob.
#[async_trait]
pub trait Search: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn query(&self, text: &str) -> Result<String>;
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    provider: &str,
    response: std::result::Result<reqwest::Response, reqwest::Error>,
) -> Result<T> {
    let response = response
        .map_err(|e| ResearchError::Search(format!("failed to perform {provider} search: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ResearchError::Search(format!(
            "{provider} API returned status {status}: {body}"
        )));
    }
    response
        .json()
        .await
        .map_err(|e| ResearchError::Search(format!("failed to decode {provider} response: {e}")))
}

// ---------------------------------------------------------------------------
// Tavily
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct TavilyResponse {
    #[serde(default)]
    pub results: Vec<TavilyHit>,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TavilyHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
}

pub fn format_tavily_results(response: &TavilyResponse) -> Result<String> {
    let mut out = String::new();
    for hit in &response.results {
        out.push_str(&format!(
            "Title: {}\nURL: {}\nContent: {}\n\n",
            hit.title, hit.url, hit.content
        ));
    }

    if !response.images.is_empty() {
        out.push_str("\nRelevant Images:\n");
        for image in &response.images {
            out.push_str(&format!("- Image URL: {image}\n"));
        }
        out.push('\n');
    }

    if out.is_empty() {
        return Err(ResearchError::Search("no results found".to_string()));
    }
    Ok(out)
}

pub struct TavilySearch {
    api_key: String,
    http_client: reqwest::Client,
}

impl TavilySearch {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            http_client: http_client(Duration::from_secs(30)),
        }
    }
}

#[async_trait]
impl Search for TavilySearch {
    fn provider_name(&self) -> &'static str {
        "tavily"
    }

    async fn query(&self, text: &str) -> Result<String> {
        let body = json!({
            "query": text,
            "search_depth": "basic",
            "max_results": 20,
            "include_images": true,
        });
        let response = self
            .http_client
            .post(TAVILY_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await;
        let parsed: TavilyResponse = read_json("Tavily", response).await?;
        tracing::debug!(
            query = text,
            results = parsed.results.len(),
            images = parsed.images.len(),
            "tavily search"
        );
        format_tavily_results(&parsed)
    }
}

// ---------------------------------------------------------------------------
// DuckDuckGo instant answers
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct DuckDuckGoResponse {
    #[serde(rename = "AbstractText", default)]
    pub abstract_text: String,
    #[serde(rename = "AbstractURL", default)]
    pub abstract_url: String,
    #[serde(rename = "RelatedTopics", default)]
    pub related_topics: Vec<DuckDuckGoTopic>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DuckDuckGoTopic {
    #[serde(rename = "Text", default)]
    pub text: String,
}

pub fn format_duckduckgo_results(response: &DuckDuckGoResponse) -> Result<String> {
    if !response.abstract_text.is_empty() {
        return Ok(format!(
            "{} (Source: {})",
            response.abstract_text, response.abstract_url
        ));
    }

    let topics = response
        .related_topics
        .iter()
        .map(|topic| topic.text.as_str())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>();
    if topics.is_empty() {
        return Err(ResearchError::Search("no results found".to_string()));
    }
    Ok(format!(
        "No direct abstract found. Related topics: {}",
        topics.join("; ")
    ))
}

pub struct DuckDuckGoSearch {
    http_client: reqwest::Client,
}

impl Default for DuckDuckGoSearch {
    fn default() -> Self {
        Self {
            http_client: http_client(Duration::from_secs(10)),
        }
    }
}

#[async_trait]
impl Search for DuckDuckGoSearch {
    fn provider_name(&self) -> &'static str {
        "duckduckgo"
    }

    async fn query(&self, text: &str) -> Result<String> {
        let response = self
            .http_client
            .get(DUCKDUCKGO_ENDPOINT)
            .query(&[("format", "json"), ("q", text)])
            .send()
            .await;
        let parsed: DuckDuckGoResponse = read_json("DuckDuckGo", response).await?;
        format_duckduckgo_results(&parsed)
    }
}

// ---------------------------------------------------------------------------
// Wikipedia extracts
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct WikipediaResponse {
    #[serde(default)]
    pub query: WikipediaQuery,
}

#[derive(Debug, Default, Deserialize)]
pub struct WikipediaQuery {
    #[serde(default)]
    pub pages: std::collections::BTreeMap<String, WikipediaPage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WikipediaPage {
    #[serde(default)]
    pub extract: String,
}

pub fn format_wikipedia_results(response: &WikipediaResponse) -> Result<String> {
    response
        .query
        .pages
        .values()
        .find(|page| !page.extract.is_empty())
        .map(|page| page.extract.replace("(listen)", "").trim().to_string())
        .ok_or_else(|| ResearchError::Search("no relevant Wikipedia entry found".to_string()))
}

pub struct WikipediaSearch {
    http_client: reqwest::Client,
}

impl Default for WikipediaSearch {
    fn default() -> Self {
        Self {
            http_client: http_client(Duration::from_secs(10)),
        }
    }
}

#[async_trait]
impl Search for WikipediaSearch {
    fn provider_name(&self) -> &'static str {
        "wikipedia"
    }

    async fn query(&self, text: &str) -> Result<String> {
        let response = self
            .http_client
            .get(WIKIPEDIA_ENDPOINT)
            .query(&[
                ("action", "query"),
                ("format", "json"),
                ("prop", "extracts"),
                ("exintro", ""),
                ("explaintext", ""),
                ("redirects", "1"),
                ("titles", text),
            ])
            .send()
            .await;
        let parsed: WikipediaResponse = read_json("Wikipedia", response).await?;
        format_wikipedia_results(&parsed)
    }
}

pub fn build_search_service(cfg: &RuntimeConfig) -> anyhow::Result<Arc<dyn Search>> {
    match cfg.search_provider {
        SearchProvider::Tavily => {
            let key = cfg.tavily_api_key.clone().ok_or_else(|| {
                anyhow::anyhow!(
                    "search provider 'tavily' requires TAVILY_API_KEY or --tavily-api-key"
                )
            })?;
            Ok(Arc::new(TavilySearch::new(key)))
        }
        SearchProvider::Duckduckgo => Ok(Arc::new(DuckDuckGoSearch::default())),
        SearchProvider::Wikipedia => Ok(Arc::new(WikipediaSearch::default())),
    }
}
