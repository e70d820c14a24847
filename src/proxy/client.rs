//! Builds the short-lived HTTP clients used for probing

use crate::proxy::models::Proxy;
use crate::Result;
use reqwest::{redirect, Client, Proxy as ReqwestProxy};
use std::time::Duration;

/// Create a reqwest client that routes every request through `proxy`.
///
/// Idle connections are never pooled, so each client makes exactly one cold
/// connection. Redirects are not followed: a 3xx is the proxy's answer.
/// `timeout` bounds connect plus the full response body.
///
/// Building a client loads the TLS backend synchronously; async callers
/// should go through [`build_probe_clients`].
pub fn build_probe_client(proxy: &Proxy, timeout: Duration) -> Result<Client> {
    let mut reqwest_proxy = ReqwestProxy::all(format!("http://{}", proxy.host()))?;
    if proxy.has_credentials() {
        reqwest_proxy = reqwest_proxy.basic_auth(proxy.username(), proxy.password());
    }

    let client = Client::builder()
        .proxy(reqwest_proxy)
        .redirect(redirect::Policy::none())
        .pool_max_idle_per_host(0)
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()?;

    Ok(client)
}

/// Clients for the liveness and anonymity requests of one probe.
pub struct ProbeClients {
    pub primary: Client,
    pub anonymity: Client,
}

/// Build both clients of a probe on the blocking pool, off the runtime threads
pub async fn build_probe_clients(
    proxy: &Proxy,
    timeout: Duration,
    anonymity_timeout: Duration,
) -> Result<ProbeClients> {
    let proxy = proxy.clone();
    tokio::task::spawn_blocking(move || {
        Ok(ProbeClients {
            primary: build_probe_client(&proxy, timeout)?,
            anonymity: build_probe_client(&proxy, anonymity_timeout)?,
        })
    })
    .await?
}
