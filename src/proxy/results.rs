//! Accumulated probe outcomes and the queries over them

use crate::proxy::models::{ProbeOutcome, Proxy};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ways to narrow down a result set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// Proxies that answered the primary probe with 200 OK
    Alive,
    /// Live proxies that hid our real IP
    Anonymous,
    /// Live proxies that answered faster than the threshold
    ResponseTime(Duration),
}

impl Predicate {
    pub fn matches(&self, outcome: &ProbeOutcome) -> bool {
        match self {
            Predicate::Alive => outcome.is_alive(),
            Predicate::Anonymous => outcome.is_anonymous(),
            Predicate::ResponseTime(max) => outcome
                .response_time
                .is_some_and(|t| outcome.is_alive() && t < *max),
        }
    }
}

/// Append-only outcome log shared between the run coordinator and readers.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    outcomes: Arc<Mutex<Vec<ProbeOutcome>>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: ProbeOutcome) {
        self.lock().push(outcome);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of everything recorded so far, in completion order
    pub fn snapshot(&self) -> Results {
        Results::from(self.lock().clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ProbeOutcome>> {
        // Outcomes are pushed whole, so a poisoned Vec is still consistent
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An immutable set of outcomes that can be filtered and sorted repeatedly.
#[derive(Debug, Clone, Default)]
pub struct Results {
    outcomes: Vec<ProbeOutcome>,
}

impl Results {
    pub fn outcomes(&self) -> &[ProbeOutcome] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<ProbeOutcome> {
        self.outcomes
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProbeOutcome> {
        self.outcomes.iter()
    }

    /// Every probed proxy, alive or not, in the order the results came in
    pub fn proxies(&self) -> Vec<Proxy> {
        self.outcomes.iter().map(|o| o.proxy.clone()).collect()
    }

    pub fn filter(&self, predicate: Predicate) -> Results {
        self.outcomes
            .iter()
            .filter(|o| predicate.matches(o))
            .cloned()
            .collect()
    }

    /// Live proxies, fastest first. Dead proxies have no latency and are left out.
    pub fn sort_by_response_time(&self) -> Results {
        let mut measured: Vec<ProbeOutcome> = self
            .outcomes
            .iter()
            .filter(|o| o.is_alive() && o.response_time.is_some())
            .cloned()
            .collect();
        measured.sort_by_key(|o| o.response_time);
        Results::from(measured)
    }

    /// Split into (alive, dead)
    pub fn partition_alive(&self) -> (Results, Results) {
        let (good, bad): (Vec<_>, Vec<_>) =
            self.outcomes.iter().cloned().partition(|o| o.is_alive());
        (Results::from(good), Results::from(bad))
    }
}

impl From<Vec<ProbeOutcome>> for Results {
    fn from(outcomes: Vec<ProbeOutcome>) -> Self {
        Self { outcomes }
    }
}

impl FromIterator<ProbeOutcome> for Results {
    fn from_iter<T: IntoIterator<Item = ProbeOutcome>>(iter: T) -> Self {
        Self {
            outcomes: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Results {
    type Item = ProbeOutcome;
    type IntoIter = std::vec::IntoIter<ProbeOutcome>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.into_iter()
    }
}

impl<'a> IntoIterator for &'a Results {
    type Item = &'a ProbeOutcome;
    type IntoIter = std::slice::Iter<'a, ProbeOutcome>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.iter()
    }
}
