//! End-to-end probing against fake HTTP proxies on localhost

use proxy_probe::{
    CheckerConfig, Predicate, ProbeStatus, Proxy, ProxyChecker, RealIps, RunState,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const TEST_URL: &str = "http://probe.test/";
const ECHO_URL: &str = "http://echo.test/ip";

/// How a fake proxy answers
#[derive(Clone)]
enum Behavior {
    Respond {
        status: u16,
        echo_status: u16,
        echo_body: String,
    },
    Stall,
}

impl Behavior {
    fn ok(echo_body: &str) -> Self {
        Behavior::Respond {
            status: 200,
            echo_status: 200,
            echo_body: echo_body.to_string(),
        }
    }
}

#[derive(Default)]
struct Stats {
    requests: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    saw_proxy_auth: AtomicBool,
}

struct FakeProxy {
    host: String,
    stats: Arc<Stats>,
}

impl FakeProxy {
    async fn start(behavior: Behavior, delay: Duration) -> Self {
        Self::start_with_stats(behavior, delay, Arc::new(Stats::default())).await
    }

    async fn start_with_stats(behavior: Behavior, delay: Duration, stats: Arc<Stats>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        let shared = Arc::clone(&stats);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let behavior = behavior.clone();
                let stats = Arc::clone(&shared);
                tokio::spawn(serve(stream, behavior, delay, stats));
            }
        });

        Self { host, stats }
    }

    fn proxy(&self) -> Proxy {
        Proxy::new(&self.host, "", "").unwrap()
    }
}

async fn serve(mut stream: TcpStream, behavior: Behavior, delay: Duration, stats: Arc<Stats>) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    let request = String::from_utf8_lossy(&request).to_string();

    stats.requests.fetch_add(1, Ordering::SeqCst);
    if request.to_ascii_lowercase().contains("proxy-authorization:") {
        stats.saw_proxy_auth.store(true, Ordering::SeqCst);
    }
    let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    stats.max_in_flight.fetch_max(now, Ordering::SeqCst);

    tokio::time::sleep(delay).await;

    match behavior {
        Behavior::Stall => {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Behavior::Respond {
            status,
            echo_status,
            echo_body,
        } => {
            let first_line = request.lines().next().unwrap_or_default();
            let (code, body) = if first_line.contains("echo.test") {
                (echo_status, echo_body)
            } else {
                (status, "ok".to_string())
            };
            let response = match code {
                204 => "HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n".to_string(),
                300..=399 => format!(
                    "HTTP/1.1 {} {}\r\nLocation: http://portal.test/login\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    code,
                    reason(code)
                ),
                _ => format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    code,
                    reason(code),
                    body.len(),
                    body
                ),
            };
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    }

    stats.in_flight.fetch_sub(1, Ordering::SeqCst);
}

fn reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        301 => "Moved Permanently",
        302 => "Found",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn config() -> CheckerConfig {
    CheckerConfig::new()
        .with_test_url(TEST_URL.to_string())
        .with_echo_url(ECHO_URL.to_string())
        .with_timeout(Duration::from_secs(3))
        .with_anonymity_timeout(Duration::from_secs(2))
        .with_concurrency(4)
}

fn checker(config: CheckerConfig) -> ProxyChecker {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    ProxyChecker::with_real_ips(config, RealIps::from_addrs(["1.2.3.4"])).unwrap()
}

async fn drain(checker: &ProxyChecker) -> Vec<proxy_probe::ProbeOutcome> {
    let mut rx = checker.run();
    let mut outcomes = Vec::new();
    while let Some(outcome) = rx.recv().await {
        outcomes.push(outcome);
    }
    outcomes
}

#[tokio::test]
async fn alive_proxy_has_latency_and_anonymity() {
    let fake = FakeProxy::start(Behavior::ok("5.6.7.8"), Duration::ZERO).await;
    let mut checker = checker(config());
    checker.add(vec![fake.proxy()]).unwrap();

    let outcomes = drain(&checker).await;
    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    assert!(outcome.is_alive());
    assert!(outcome.is_anonymous());
    assert!(outcome.response_time.is_some());
    assert!(outcome.error().is_none());
    // One liveness request and one echo request
    assert_eq!(fake.stats.requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn echo_of_real_ip_marks_transparent() {
    let fake = FakeProxy::start(Behavior::ok("1.2.3.4\n"), Duration::ZERO).await;
    let mut checker = checker(config());
    checker.add(vec![fake.proxy()]).unwrap();

    let outcomes = drain(&checker).await;
    assert_eq!(outcomes[0].status, ProbeStatus::Alive { anonymous: false });
    assert!(checker.filter(Predicate::Anonymous).is_empty());
    assert_eq!(checker.filter(Predicate::Alive).len(), 1);
}

#[tokio::test]
async fn failed_echo_is_not_anonymous() {
    let behavior = Behavior::Respond {
        status: 200,
        echo_status: 500,
        echo_body: "5.6.7.8".to_string(),
    };
    let fake = FakeProxy::start(behavior, Duration::ZERO).await;
    let mut checker = checker(config());
    checker.add(vec![fake.proxy()]).unwrap();

    let outcomes = drain(&checker).await;
    assert!(outcomes[0].is_alive());
    assert!(!outcomes[0].is_anonymous());
}

#[tokio::test]
async fn non_200_status_is_dead() {
    // Redirects are not followed and other 2xx codes do not count
    for status in [201, 204, 301, 302, 403, 404, 503] {
        let behavior = Behavior::Respond {
            status,
            echo_status: 200,
            echo_body: "5.6.7.8".to_string(),
        };
        let fake = FakeProxy::start(behavior, Duration::ZERO).await;
        let mut checker = checker(config());
        checker.add(vec![fake.proxy()]).unwrap();

        let outcomes = drain(&checker).await;
        assert_eq!(
            outcomes[0].status,
            ProbeStatus::Rejected(status),
            "status {} should be rejected",
            status
        );
        assert!(!outcomes[0].is_alive());
        assert!(outcomes[0].response_time.is_none());
        // No anonymity probe for a dead proxy
        assert_eq!(fake.stats.requests.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn stalled_proxy_times_out_within_deadline() {
    let fake = FakeProxy::start(Behavior::Stall, Duration::ZERO).await;
    let timeout = Duration::from_millis(300);
    let mut checker = checker(config().with_timeout(timeout));
    checker.add(vec![fake.proxy()]).unwrap();

    let start = Instant::now();
    let outcomes = drain(&checker).await;
    let elapsed = start.elapsed();

    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].is_alive());
    assert!(outcomes[0].error().is_some_and(|e| !e.is_empty()));
    assert!(elapsed < timeout + Duration::from_secs(2), "took {:?}", elapsed);
}

#[tokio::test]
async fn credentials_are_sent_to_the_proxy() {
    let fake = FakeProxy::start(Behavior::ok("5.6.7.8"), Duration::ZERO).await;
    let mut checker = checker(config());
    checker
        .add(vec![Proxy::new(&fake.host, "user", "secret").unwrap()])
        .unwrap();

    let outcomes = drain(&checker).await;
    assert!(outcomes[0].is_alive());
    assert!(fake.stats.saw_proxy_auth.load(Ordering::SeqCst));
}

#[tokio::test]
async fn mixed_run_reports_every_candidate_once() {
    let good = FakeProxy::start(Behavior::ok("5.6.7.8"), Duration::ZERO).await;
    let slow = FakeProxy::start(Behavior::ok("1.2.3.4"), Duration::from_millis(150)).await;
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let mut checker = checker(config());
    checker
        .add(vec![
            good.proxy(),
            slow.proxy(),
            Proxy::new(&dead, "", "").unwrap(),
            good.proxy(),
        ])
        .unwrap();
    assert_eq!(checker.candidates().len(), 3);

    let outcomes = drain(&checker).await;
    assert_eq!(outcomes.len(), 3);
    assert_eq!(checker.proxies().len(), 3);

    let sorted = checker.sort_by_response_time();
    let hosts: Vec<&str> = sorted.iter().map(|o| o.proxy.host()).collect();
    assert_eq!(hosts, vec![good.host.as_str(), slow.host.as_str()]);

    let fast = checker.filter(Predicate::ResponseTime(Duration::from_millis(100)));
    assert_eq!(fast.len(), 1);
    assert_eq!(fast.outcomes()[0].proxy.host(), good.host);

    let (alive, dead_results) = checker.results().partition_alive();
    assert_eq!(alive.len(), 2);
    assert_eq!(dead_results.outcomes()[0].proxy.host(), dead);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(checker.state(), RunState::Completed);
}

#[tokio::test]
async fn latency_excludes_client_setup() {
    let mut fakes = Vec::new();
    for _ in 0..4 {
        fakes.push(FakeProxy::start(Behavior::ok("5.6.7.8"), Duration::ZERO).await);
    }

    let mut checker = checker(config().with_concurrency(4));
    checker.add(fakes.iter().map(|f| f.proxy())).unwrap();

    let outcomes = drain(&checker).await;
    assert_eq!(outcomes.len(), 4);
    for outcome in &outcomes {
        let latency = outcome.response_time.unwrap();
        assert!(
            latency < Duration::from_millis(100),
            "{} reported {:?} against a local proxy",
            outcome.proxy,
            latency
        );
    }
    assert_eq!(
        checker
            .filter(Predicate::ResponseTime(Duration::from_millis(100)))
            .len(),
        4
    );
}

#[tokio::test]
async fn concurrency_limit_is_respected() {
    let stats = Arc::new(Stats::default());
    let mut fakes = Vec::new();
    for _ in 0..6 {
        let fake = FakeProxy::start_with_stats(
            Behavior::ok("5.6.7.8"),
            Duration::from_millis(100),
            Arc::clone(&stats),
        )
        .await;
        fakes.push(fake);
    }

    let mut checker = checker(config().with_concurrency(2));
    checker.add(fakes.iter().map(|f| f.proxy())).unwrap();

    let outcomes = drain(&checker).await;
    assert_eq!(outcomes.len(), 6);
    assert!(outcomes.iter().all(|o| o.is_alive()));

    let max = stats.max_in_flight.load(Ordering::SeqCst);
    assert!(max >= 1 && max <= 2, "max in flight was {}", max);
}

#[tokio::test]
async fn second_run_does_not_probe_again() {
    let fake = FakeProxy::start(Behavior::ok("5.6.7.8"), Duration::ZERO).await;
    let mut checker = checker(config());
    checker.add(vec![fake.proxy()]).unwrap();

    let first = drain(&checker).await;
    let requests = fake.stats.requests.load(Ordering::SeqCst);

    let second = drain(&checker).await;
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].proxy.host(), fake.host);
    assert_eq!(fake.stats.requests.load(Ordering::SeqCst), requests);
}

#[tokio::test]
async fn stop_mid_run_skips_undispatched_probes() {
    let stats = Arc::new(Stats::default());
    let mut fakes = Vec::new();
    for _ in 0..5 {
        let fake = FakeProxy::start_with_stats(
            Behavior::ok("5.6.7.8"),
            Duration::from_millis(100),
            Arc::clone(&stats),
        )
        .await;
        fakes.push(fake);
    }

    let mut checker = checker(config().with_concurrency(1));
    checker.add(fakes.iter().map(|f| f.proxy())).unwrap();
    let stop = checker.stop_handle();

    let mut rx = checker.run();
    let mut seen = 0;
    while let Some(outcome) = rx.recv().await {
        // Probes already in flight still finish normally
        assert!(outcome.is_alive());
        seen += 1;
        stop.stop();
    }

    assert!(seen >= 1 && seen < 5, "saw {} outcomes", seen);
    assert_eq!(checker.results().len(), seen);
    assert_eq!(checker.state(), RunState::Cancelled);
}

#[tokio::test]
async fn stop_before_run_yields_closed_empty_stream() {
    let fake = FakeProxy::start(Behavior::ok("5.6.7.8"), Duration::ZERO).await;
    let mut checker = checker(config());
    checker.add(vec![fake.proxy()]).unwrap();
    checker.stop();

    let outcomes = drain(&checker).await;
    assert!(outcomes.is_empty());
    assert_eq!(fake.stats.requests.load(Ordering::SeqCst), 0);
}
