//! Instance selection strategies

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use waypoint_types::ServiceRecord;

/// Picks one instance per outgoing call.
///
/// Implementations are shared between request paths and must tolerate
/// concurrent calls.
pub trait Strategy: Send + Sync {
    /// Choose an instance, or `None` when there is nothing to choose from.
    fn select<'a>(&self, instances: &'a [ServiceRecord]) -> Option<&'a ServiceRecord>;
}

/// Returns `instances[n % len]` for a counter `n` that grows by one per call.
///
/// The counter is never reset, so when the list changes length the next pick
/// is still a valid index but not necessarily the "next" instance.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobin {
    fn select<'a>(&self, instances: &'a [ServiceRecord]) -> Option<&'a ServiceRecord> {
        if instances.is_empty() {
            return None;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        instances.get(n % instances.len())
    }
}

/// Uniformly random pick.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomChoice;

impl Strategy for RandomChoice {
    fn select<'a>(&self, instances: &'a [ServiceRecord]) -> Option<&'a ServiceRecord> {
        if instances.is_empty() {
            return None;
        }
        instances.get(rand::thread_rng().gen_range(0..instances.len()))
    }
}

/// Strategy selection as it appears in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
}

impl LoadBalanceStrategy {
    pub fn build(self) -> Box<dyn Strategy> {
        match self {
            LoadBalanceStrategy::RoundRobin => Box::new(RoundRobin::new()),
            LoadBalanceStrategy::Random => Box::new(RandomChoice),
        }
    }
}
