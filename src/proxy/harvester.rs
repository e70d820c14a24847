//! Harvester for pulling candidate proxies from public lists
//!
//! Every source is fetched concurrently. A failing source is recorded in the
//! [`HarvestReport`] and never stops the others.

use crate::error::Error;
use crate::proxy::models::{distinct, Proxy};
use crate::proxy::parser::ProxyParser;
use crate::Result;
use futures::future;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Regex pattern to match IP:PORT patterns in text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b")
        .expect("Invalid IP:PORT regex")
});

/// How a source lays out its entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceFormat {
    /// `host:port` lines, or free text with `IP:PORT` pairs in it
    #[default]
    PlainText,
    /// One JSON object per line with `host` and `port` fields
    JsonLines,
}

/// A public list of HTTP proxies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySource {
    pub name: String,
    pub url: String,
    pub format: SourceFormat,
}

impl ProxySource {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            format: SourceFormat::PlainText,
        }
    }

    pub fn json_lines(name: &str, url: &str) -> Self {
        Self {
            format: SourceFormat::JsonLines,
            ..Self::new(name, url)
        }
    }
}

/// One entry of a JSON-lines list; other fields are ignored
#[derive(Deserialize)]
struct JsonEntry {
    host: String,
    port: u16,
}

/// Configuration for the harvester
#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl HarvesterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Candidates gathered from all sources, and the sources that failed
#[derive(Debug, Default)]
pub struct HarvestReport {
    pub proxies: Vec<Proxy>,
    pub errors: Vec<(String, Error)>,
}

/// Fetches candidate proxies from a set of [`ProxySource`]s
pub struct Harvester {
    sources: Vec<ProxySource>,
    client: Client,
}

impl Harvester {
    pub fn new(sources: Vec<ProxySource>) -> Result<Self> {
        Self::with_config(sources, HarvesterConfig::default())
    }

    pub fn with_config(sources: Vec<ProxySource>, config: HarvesterConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { sources, client })
    }

    /// A harvester over every source in [`Harvester::common_sources`]
    pub fn with_common_sources() -> Result<Self> {
        Self::new(Self::common_sources())
    }

    pub fn sources(&self) -> &[ProxySource] {
        &self.sources
    }

    /// Fetch every source and merge the candidates, first occurrence wins
    pub async fn harvest(&self) -> HarvestReport {
        let fetches = self.sources.iter().map(|source| async move {
            (source, self.fetch_source(source).await)
        });

        let mut report = HarvestReport::default();
        let mut collected = Vec::new();
        for (source, result) in future::join_all(fetches).await {
            match result {
                Ok(proxies) => {
                    info!("Harvested {} proxies from {}", proxies.len(), source.name);
                    collected.extend(proxies);
                }
                Err(e) => {
                    warn!("Failed to harvest {}: {}", source.name, e);
                    report.errors.push((source.name.clone(), e));
                }
            }
        }

        report.proxies = distinct(collected);
        report
    }

    /// Fetch and parse proxies from a single source
    pub async fn fetch_source(&self, source: &ProxySource) -> Result<Vec<Proxy>> {
        let response = self.client.get(&source.url).send().await?.error_for_status()?;
        let content = response.text().await?;
        Ok(match source.format {
            SourceFormat::PlainText => parse_proxies_from_text(&content),
            SourceFormat::JsonLines => parse_json_lines(&content),
        })
    }

    /// Well known public HTTP proxy lists
    pub fn common_sources() -> Vec<ProxySource> {
        vec![
            ProxySource::new(
                "proxy-list.download/http",
                "https://www.proxy-list.download/api/v1/get?type=http",
            ),
            ProxySource::new(
                "proxy-list.download/https",
                "https://www.proxy-list.download/api/v1/get?type=https",
            ),
            ProxySource::json_lines(
                "fate0",
                "https://raw.githubusercontent.com/fate0/proxylist/master/proxy.list",
            ),
            ProxySource::new(
                "clarketm",
                "https://raw.githubusercontent.com/clarketm/proxy-list/master/proxy-list-raw.txt",
            ),
            ProxySource::new("multiproxy", "http://multiproxy.org/txt_all/proxy.txt"),
            ProxySource::new("spys.me", "http://spys.me/proxy.txt"),
            ProxySource::new("proxylists.net/http", "http://www.proxylists.net/http.txt"),
            ProxySource::new(
                "proxylists.net/highanon",
                "http://www.proxylists.net/http_highanon.txt",
            ),
        ]
    }
}

/// Parse proxies from raw text content
///
/// Lines are tried with [`ProxyParser::parse_line`] first; if nothing parses,
/// bare `IP:PORT` pairs are pulled out of the text instead.
pub fn parse_proxies_from_text(content: &str) -> Vec<Proxy> {
    let mut proxies = ProxyParser::parse_string(content);

    if proxies.is_empty() {
        proxies = extract_proxies_with_regex(content);
    }

    distinct(proxies)
}

/// Parse a JSON-lines list, skipping lines that are not a `{host, port}` object
pub fn parse_json_lines(content: &str) -> Vec<Proxy> {
    let proxies = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<JsonEntry>(line) {
            Ok(entry) => Proxy::new(&format!("{}:{}", entry.host, entry.port), "", "").ok(),
            Err(e) => {
                debug!("Skipping JSON line: {}", e);
                None
            }
        })
        .collect::<Vec<_>>();

    distinct(proxies)
}

fn extract_proxies_with_regex(content: &str) -> Vec<Proxy> {
    IP_PORT_REGEX
        .captures_iter(content)
        .filter_map(|cap| {
            let ip: Ipv4Addr = cap.get(1)?.as_str().parse().ok()?;
            let port: u16 = cap.get(2)?.as_str().parse().ok()?;
            Proxy::new(&format!("{}:{}", ip, port), "", "").ok()
        })
        .collect()
}
