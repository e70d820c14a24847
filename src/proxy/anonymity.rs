//! Anonymity detection by comparing IP echoes against our own public addresses

use crate::proxy::models::Proxy;
use reqwest::{Client, StatusCode};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The caller's real public IP addresses.
///
/// Resolved once when a checker is built and shared read-only by every probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealIps {
    addrs: HashSet<String>,
}

impl RealIps {
    /// Build from known addresses; blank entries are dropped
    pub fn from_addrs<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let addrs = addrs
            .into_iter()
            .map(|a| a.as_ref().trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        Self { addrs }
    }

    /// Ask the IPv4 and IPv6 echo services for our public addresses.
    ///
    /// A family that cannot be resolved is simply left out.
    pub async fn resolve(ipv4_url: &str, ipv6_url: &str, timeout: Duration) -> Self {
        let client = match Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                warn!("Could not build client for real IP lookup: {}", e);
                return Self::default();
            }
        };

        let (v4, v6) = futures::join!(
            fetch_echo(&client, ipv4_url),
            fetch_echo(&client, ipv6_url)
        );

        let mut found = Vec::new();
        for (family, result) in [("IPv4", v4), ("IPv6", v6)] {
            match result {
                Ok(ip) if !ip.is_empty() => {
                    info!("Resolved real {} address {}", family, ip);
                    found.push(ip);
                }
                Ok(_) => warn!("Echo service returned an empty {} address", family),
                Err(e) => warn!("Could not resolve real {} address: {}", family, e),
            }
        }

        Self::from_addrs(found)
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.addrs.contains(ip)
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// A proxy is transparent when the echo endpoint saw one of our real IPs
    pub fn is_anonymous_echo(&self, body: &str) -> bool {
        !self.contains(body.trim())
    }
}

async fn fetch_echo(client: &Client, url: &str) -> reqwest::Result<String> {
    let response = client.get(url).send().await?.error_for_status()?;
    Ok(response.text().await?.trim().to_string())
}

/// Fetch the echo endpoint with `client`, which routes through `proxy`,
/// and classify the result.
///
/// Anything short of a 200 response with a body counts as not anonymous.
pub async fn check_anonymity(
    client: &Client,
    proxy: &Proxy,
    echo_url: &str,
    timeout: Duration,
    real_ips: &RealIps,
) -> bool {
    let request = async {
        let response = client.get(echo_url).send().await?;
        if response.status() != StatusCode::OK {
            return Ok(None);
        }
        response.text().await.map(Some)
    };

    match tokio::time::timeout(timeout, request).await {
        Ok(Ok(Some(body))) => real_ips.is_anonymous_echo(&body),
        Ok(Ok(None)) => false,
        Ok(Err(e)) => {
            debug!(proxy = %proxy, "Anonymity check failed: {}", e);
            false
        }
        Err(_) => {
            debug!(proxy = %proxy, "Anonymity check timed out");
            false
        }
    }
}
