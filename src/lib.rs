//! Proxy Probe - concurrent HTTP proxy validation
//!
//! Probes candidate HTTP forward proxies with a bounded number of requests in
//! flight, classifies each one as alive or dead, measures its latency and
//! checks whether it hides the caller's real IP.
//!
//! ```no_run
//! use proxy_probe::{CheckerConfig, Predicate, Proxy, ProxyChecker};
//!
//! # async fn demo() -> proxy_probe::Result<()> {
//! let mut checker = ProxyChecker::new(CheckerConfig::from_env()?).await?;
//! checker.add(vec![Proxy::new("203.0.113.7:3128", "", "")?])?;
//!
//! let mut outcomes = checker.run();
//! while let Some(outcome) = outcomes.recv().await {
//!     println!("{} alive={}", outcome.proxy, outcome.is_alive());
//! }
//!
//! let fastest = checker.filter(Predicate::Anonymous).sort_by_response_time();
//! # let _ = fastest;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod proxy;

pub use error::Error;
pub use proxy::*;

/// Application result type
pub type Result<T> = std::result::Result<T, Error>;
