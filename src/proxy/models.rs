//! Proxy data models

use crate::error::Error;
use crate::Result;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use uuid::Uuid;

/// A single HTTP forward proxy endpoint.
///
/// Identities are immutable once created. Two identities are duplicates when
/// their `host` strings are equal, whatever their credentials; `PartialEq` and
/// `Hash` follow that rule. Use [`Proxy::same_identity`] to compare the ids
/// assigned at creation instead.
///
/// Deserialized proxies go through the same host validation as [`Proxy::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ProxyRecord")]
pub struct Proxy {
    id: Uuid,
    host: String,
    username: String,
    password: String,
}

/// Serialized form of a [`Proxy`], before validation
#[derive(Deserialize)]
struct ProxyRecord {
    id: Uuid,
    host: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

impl TryFrom<ProxyRecord> for Proxy {
    type Error = Error;

    fn try_from(record: ProxyRecord) -> Result<Self> {
        let mut proxy = Self::new(&record.host, &record.username, &record.password)?;
        proxy.id = record.id;
        Ok(proxy)
    }
}

impl Proxy {
    /// Create a proxy from a bare `host:port` string.
    ///
    /// Only syntactic checks are made here; nothing touches the network.
    pub fn new(uri: &str, username: &str, password: &str) -> Result<Self> {
        let host = normalize_host(uri)?;
        Ok(Self {
            id: Uuid::new_v4(),
            host,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Restore a proxy that was stored earlier, keeping its id.
    ///
    /// An empty or unparsable id gets a fresh one.
    pub fn from_existing(id: &str, uri: &str, username: &str, password: &str) -> Result<Self> {
        let mut proxy = Self::new(uri, username, password)?;
        if let Ok(id) = Uuid::parse_str(id) {
            proxy.id = id;
        }
        Ok(proxy)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The `host:port` this proxy listens on
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Whether both halves of the credentials are present
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// Get the proxy URL string, `http://[user:pass@]host:port`
    pub fn url(&self) -> String {
        if self.has_credentials() {
            format!("http://{}:{}@{}", self.username, self.password, self.host)
        } else {
            format!("http://{}", self.host)
        }
    }

    /// True when both values were created by the same `Proxy::new` call
    pub fn same_identity(&self, other: &Proxy) -> bool {
        self.id == other.id
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
    }
}

impl Eq for Proxy {}

impl Hash for Proxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)
    }
}

fn normalize_host(uri: &str) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidProxy {
        input: uri.to_string(),
        reason: reason.to_string(),
    };

    let host = uri.trim();
    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    if host.contains(&['/', '@', '?', '#'][..]) || host.contains(char::is_whitespace) {
        return Err(invalid("expected a bare host:port"));
    }

    let (name, port) = host
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    if name.is_empty() {
        return Err(invalid("missing host name"));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => return Err(invalid("port must be a number between 1 and 65535")),
        Ok(_) => {}
    }

    let url = Url::parse(&format!("http://{}", host)).map_err(|e| invalid(&e.to_string()))?;
    if url.host_str().is_none() {
        return Err(invalid("missing host name"));
    }

    Ok(host.to_string())
}

/// Keep the first proxy seen for every distinct host, in input order.
pub fn distinct<I>(proxies: I) -> Vec<Proxy>
where
    I: IntoIterator<Item = Proxy>,
{
    let mut seen = HashSet::new();
    proxies
        .into_iter()
        .filter(|proxy| seen.insert(proxy.host.clone()))
        .collect()
}

/// How a single probe concluded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeStatus {
    /// Answered the primary probe with 200 OK
    Alive { anonymous: bool },
    /// Answered with any status other than 200 OK
    Rejected(u16),
    /// Transport error before a response could be classified
    Failed(String),
    /// No complete response before the deadline
    Timeout,
}

/// The classification of one proxy after one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub proxy: Proxy,
    pub status: ProbeStatus,
    pub response_time: Option<Duration>,
    pub checked_at: DateTime<Utc>,
}

impl ProbeOutcome {
    pub fn alive(proxy: Proxy, response_time: Duration, anonymous: bool) -> Self {
        Self {
            proxy,
            status: ProbeStatus::Alive { anonymous },
            response_time: Some(response_time),
            checked_at: Utc::now(),
        }
    }

    pub fn rejected(proxy: Proxy, status: u16) -> Self {
        Self::dead(proxy, ProbeStatus::Rejected(status))
    }

    pub fn failed(proxy: Proxy, error: String) -> Self {
        Self::dead(proxy, ProbeStatus::Failed(error))
    }

    pub fn timeout(proxy: Proxy) -> Self {
        Self::dead(proxy, ProbeStatus::Timeout)
    }

    fn dead(proxy: Proxy, status: ProbeStatus) -> Self {
        Self {
            proxy,
            status,
            response_time: None,
            checked_at: Utc::now(),
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.status, ProbeStatus::Alive { .. })
    }

    /// Anonymity is only meaningful for live proxies; dead ones report false
    pub fn is_anonymous(&self) -> bool {
        matches!(self.status, ProbeStatus::Alive { anonymous: true })
    }

    /// The failure cause, present when the probe never got a classifiable response
    pub fn error(&self) -> Option<String> {
        match &self.status {
            ProbeStatus::Failed(cause) => Some(cause.clone()),
            ProbeStatus::Timeout => Some("timed out".to_string()),
            ProbeStatus::Alive { .. } | ProbeStatus::Rejected(_) => None,
        }
    }

    pub fn response_time_ms(&self) -> Option<u64> {
        self.response_time.map(|t| t.as_millis() as u64)
    }
}
