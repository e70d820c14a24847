//! Proxy module for validating HTTP proxies
//!
//! This module provides functionality for:
//! - Parsing candidate proxies and persisting them as delimited records
//! - Harvesting candidates from public proxy lists
//! - Probing candidates concurrently for liveness, latency and anonymity
//! - Filtering and sorting the collected outcomes

pub mod anonymity;
pub mod checker;
pub mod client;
pub mod harvester;
pub mod models;
pub mod parser;
pub mod results;

pub use anonymity::RealIps;
pub use checker::{CheckerConfig, ProxyChecker, RunState, StopHandle};
pub use harvester::{HarvestReport, Harvester, HarvesterConfig, ProxySource, SourceFormat};
pub use models::{distinct, ProbeOutcome, ProbeStatus, Proxy};
pub use parser::{LoadReport, ProxyParser};
pub use results::{Predicate, ResultStore, Results};
