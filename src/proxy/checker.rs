//! Proxy checker module for probing proxies concurrently

use crate::error::Error;
use crate::proxy::anonymity::{check_anonymity, RealIps};
use crate::proxy::client::build_probe_clients;
use crate::proxy::models::{distinct, ProbeOutcome, Proxy};
use crate::proxy::results::{Predicate, ResultStore, Results};
use crate::Result;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default timeout for the liveness probe in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default timeout for the anonymity probe in seconds
const DEFAULT_ANONYMITY_TIMEOUT_SECS: u64 = 5;

/// Default number of probes in flight
const DEFAULT_CONCURRENCY: usize = 10;

/// Default URL to test proxies against
const DEFAULT_TEST_URL: &str = "http://httpbin.org/ip";

/// IP echo endpoint fetched through live proxies
const DEFAULT_ECHO_URL: &str = "http://api.ipify.org";

/// Services used to learn our own public addresses
const DEFAULT_IPV4_ECHO_URL: &str = "https://api.ipify.org";
const DEFAULT_IPV6_ECHO_URL: &str = "https://api6.ipify.org";

/// Configuration for proxy checker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Deadline for the liveness probe, connect through full response
    pub timeout: Duration,
    /// Deadline for the anonymity probe run after a successful liveness probe
    pub anonymity_timeout: Duration,
    /// Maximum number of probes in flight
    pub concurrency: usize,
    /// URL fetched through each proxy to decide liveness
    pub test_url: String,
    /// IP echo URL fetched through live proxies
    pub echo_url: String,
    /// Echo service for our own IPv4 address
    pub ipv4_echo_url: String,
    /// Echo service for our own IPv6 address
    pub ipv6_echo_url: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            anonymity_timeout: Duration::from_secs(DEFAULT_ANONYMITY_TIMEOUT_SECS),
            concurrency: DEFAULT_CONCURRENCY,
            test_url: DEFAULT_TEST_URL.to_string(),
            echo_url: DEFAULT_ECHO_URL.to_string(),
            ipv4_echo_url: DEFAULT_IPV4_ECHO_URL.to_string(),
            ipv6_echo_url: DEFAULT_IPV6_ECHO_URL.to_string(),
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `PROXY_PROBE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(secs) = env_var::<u64>("PROXY_PROBE_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_var::<u64>("PROXY_PROBE_ANONYMITY_TIMEOUT_SECS")? {
            config.anonymity_timeout = Duration::from_secs(secs);
        }
        if let Some(concurrency) = env_var::<usize>("PROXY_PROBE_CONCURRENCY")? {
            config.concurrency = concurrency;
        }
        if let Some(url) = env_var::<String>("PROXY_PROBE_TEST_URL")? {
            config.test_url = url;
        }
        if let Some(url) = env_var::<String>("PROXY_PROBE_ECHO_URL")? {
            config.echo_url = url;
        }
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_anonymity_timeout(mut self, timeout: Duration) -> Self {
        self.anonymity_timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_test_url(mut self, url: String) -> Self {
        self.test_url = url;
        self
    }

    pub fn with_echo_url(mut self, url: String) -> Self {
        self.echo_url = url;
        self
    }

    pub fn with_ipv4_echo_url(mut self, url: String) -> Self {
        self.ipv4_echo_url = url;
        self
    }

    pub fn with_ipv6_echo_url(mut self, url: String) -> Self {
        self.ipv6_echo_url = url;
        self
    }

    /// Reject settings a run could not work with
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::InvalidConcurrency);
        }
        if self.timeout.is_zero() || self.anonymity_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be non-zero".to_string()));
        }
        for url in [
            &self.test_url,
            &self.echo_url,
            &self.ipv4_echo_url,
            &self.ipv6_echo_url,
        ] {
            check_url(url)?;
        }
        Ok(())
    }
}

fn check_url(url: &str) -> Result<()> {
    let invalid = |reason: String| Error::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme {:?}", other))),
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}

fn env_var<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

/// Lifecycle of a checker's single run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunState::Idle,
            1 => RunState::Running,
            2 => RunState::Completed,
            _ => RunState::Cancelled,
        }
    }
}

/// Requests cancellation of a run from anywhere, any number of times.
#[derive(Debug, Clone)]
pub struct StopHandle {
    cancelled: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl StopHandle {
    /// Stop dispatching new probes. Probes already in flight run to completion.
    pub fn stop(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("Stop requested");
        }
        let _ = self.state.compare_exchange(
            RunState::Running as u8,
            RunState::Cancelled as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// What each spawned probe task needs, shared read-only
#[derive(Clone)]
struct Prober {
    config: Arc<CheckerConfig>,
    real_ips: Arc<RealIps>,
}

impl Prober {
    async fn check_proxy(&self, proxy: Proxy) -> ProbeOutcome {
        let outcome = self.probe(proxy).await;
        match outcome.error() {
            Some(error) => debug!(proxy = %outcome.proxy, %error, "Proxy dead"),
            None if outcome.is_alive() => debug!(
                proxy = %outcome.proxy,
                response_ms = outcome.response_time_ms(),
                anonymous = outcome.is_anonymous(),
                "Proxy alive"
            ),
            None => debug!(proxy = %outcome.proxy, status = ?outcome.status, "Proxy rejected probe"),
        }
        outcome
    }

    async fn probe(&self, proxy: Proxy) -> ProbeOutcome {
        // Built before the clock starts so setup never counts as latency
        let clients = match build_probe_clients(
            &proxy,
            self.config.timeout,
            self.config.anonymity_timeout,
        )
        .await
        {
            Ok(clients) => clients,
            Err(e) => return ProbeOutcome::failed(proxy, e.to_string()),
        };

        let start = Instant::now();
        let request = async {
            let response = clients.primary.get(&self.config.test_url).send().await?;
            let status = response.status();
            if status == StatusCode::OK {
                // Latency covers the whole response, not just the headers
                response.bytes().await?;
            }
            Ok::<_, reqwest::Error>(status)
        };

        match tokio::time::timeout(self.config.timeout, request).await {
            Ok(Ok(status)) if status == StatusCode::OK => {
                let elapsed = start.elapsed();
                let anonymous = check_anonymity(
                    &clients.anonymity,
                    &proxy,
                    &self.config.echo_url,
                    self.config.anonymity_timeout,
                    &self.real_ips,
                )
                .await;
                ProbeOutcome::alive(proxy, elapsed, anonymous)
            }
            Ok(Ok(status)) => ProbeOutcome::rejected(proxy, status.as_u16()),
            Ok(Err(e)) if e.is_timeout() => ProbeOutcome::timeout(proxy),
            Ok(Err(e)) => ProbeOutcome::failed(proxy, e.to_string()),
            Err(_) => ProbeOutcome::timeout(proxy),
        }
    }
}

/// Probes a fixed set of candidate proxies once each.
///
/// A checker is single-use: `add` the candidates, `run` once, drain the
/// returned receiver, then query [`ProxyChecker::results`].
pub struct ProxyChecker {
    prober: Prober,
    candidates: Vec<Proxy>,
    store: ResultStore,
    stop: StopHandle,
}

impl ProxyChecker {
    /// Create a checker, resolving our real public IPs once up front
    pub async fn new(config: CheckerConfig) -> Result<Self> {
        config.validate()?;
        let real_ips = RealIps::resolve(
            &config.ipv4_echo_url,
            &config.ipv6_echo_url,
            config.anonymity_timeout,
        )
        .await;
        Self::with_real_ips(config, real_ips)
    }

    /// Create a checker with an already known set of real IPs
    pub fn with_real_ips(config: CheckerConfig, real_ips: RealIps) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            prober: Prober {
                config: Arc::new(config),
                real_ips: Arc::new(real_ips),
            },
            candidates: Vec::new(),
            store: ResultStore::new(),
            stop: StopHandle {
                cancelled: Arc::new(AtomicBool::new(false)),
                state: Arc::new(AtomicU8::new(RunState::Idle as u8)),
            },
        })
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.prober.config
    }

    pub fn real_ips(&self) -> &RealIps {
        &self.prober.real_ips
    }

    /// Replace the candidate set with the distinct hosts of `proxies`
    pub fn add<I>(&mut self, proxies: I) -> Result<()>
    where
        I: IntoIterator<Item = Proxy>,
    {
        if self.state() != RunState::Idle {
            return Err(Error::AlreadyStarted);
        }
        self.candidates = distinct(proxies);
        Ok(())
    }

    pub fn candidates(&self) -> &[Proxy] {
        &self.candidates
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.stop.state.load(Ordering::SeqCst))
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop dispatching new probes; see [`StopHandle::stop`]
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Probe a single proxy without touching the run or its results
    pub async fn check_proxy(&self, proxy: &Proxy) -> ProbeOutcome {
        self.prober.check_proxy(proxy.clone()).await
    }

    /// Start probing every candidate and stream the outcomes as they complete.
    ///
    /// The receiver closes once every dispatched probe has reported. Calling
    /// `run` again does not probe anything; it replays what was recorded.
    /// Must be called from within a tokio runtime.
    pub fn run(&self) -> mpsc::Receiver<ProbeOutcome> {
        let started = self.stop.state.compare_exchange(
            RunState::Idle as u8,
            RunState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if started.is_err() {
            debug!("Run already started, replaying recorded outcomes");
            return self.replay();
        }

        let candidates = self.candidates.clone();
        let concurrency = self.prober.config.concurrency;
        // Room for every outcome, so probe tasks never wait on a slow reader
        let (tx, rx) = mpsc::channel(candidates.len().max(1));
        let prober = self.prober.clone();
        let store = self.store.clone();
        let stop = self.stop.clone();

        info!(
            candidates = candidates.len(),
            concurrency, "Starting proxy check run"
        );

        tokio::spawn(async move {
            let total = candidates.len();
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut tasks = JoinSet::new();

            for proxy in candidates {
                if stop.is_stopped() {
                    break;
                }
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                // Stop may have arrived while waiting for a slot
                if stop.is_stopped() {
                    break;
                }

                let prober = prober.clone();
                let store = store.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    let outcome = prober.check_proxy(proxy).await;
                    drop(permit);
                    store.push(outcome.clone());
                    // The reader may have gone away; the store still has it
                    let _ = tx.send(outcome).await;
                });
            }
            let dispatched = tasks.len();
            drop(tx);

            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!("Probe task failed: {}", e);
                }
            }

            let finished = if stop.is_stopped() {
                RunState::Cancelled
            } else {
                RunState::Completed
            };
            let _ = stop.state.compare_exchange(
                RunState::Running as u8,
                finished as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );

            let results = store.snapshot();
            let alive = results.filter(Predicate::Alive).len();
            info!(
                total,
                dispatched,
                alive,
                dead = results.len() - alive,
                cancelled = stop.is_stopped(),
                "Proxy check run finished"
            );
        });

        rx
    }

    fn replay(&self) -> mpsc::Receiver<ProbeOutcome> {
        let recorded = self.store.snapshot();
        let (tx, rx) = mpsc::channel(recorded.len().max(1));
        for outcome in recorded {
            // Capacity matches the snapshot, so this cannot be full
            let _ = tx.try_send(outcome);
        }
        rx
    }

    /// Everything recorded so far, in completion order
    pub fn results(&self) -> Results {
        self.store.snapshot()
    }

    /// Every proxy that produced an outcome, in completion order
    pub fn proxies(&self) -> Vec<Proxy> {
        self.results().proxies()
    }

    pub fn filter(&self, predicate: Predicate) -> Results {
        self.results().filter(predicate)
    }

    pub fn sort_by_response_time(&self) -> Results {
        self.results().sort_by_response_time()
    }
}

impl Drop for ProxyChecker {
    fn drop(&mut self) {
        // Nothing new is dispatched once the owner is gone
        self.stop.cancelled.store(true, Ordering::SeqCst);
    }
}
