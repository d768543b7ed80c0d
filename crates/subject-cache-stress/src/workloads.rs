use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use subject_cache::coordinator::{FallbackReason, LoadCoordinator};
use subject_cache_test::{TestSubject, TransientFallback};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct subjects that are resolved.
    pub subjects: usize,
    /// How long the backing store takes to fetch a single subject.
    #[serde(default, with = "humantime_serde")]
    pub storage_latency: Duration,
    /// The share of resolves that use a malformed key.
    #[serde(default)]
    pub invalid_ratio: f64,
    /// The share of resolved subjects that are marked for cleanup afterwards.
    #[serde(default)]
    pub cleanup_ratio: f64,
}

/// A workload ready to be run against a coordinator.
pub struct PreparedWorkload {
    pub subjects: Vec<Uuid>,
    pub invalid_ratio: f64,
    pub cleanup_ratio: f64,
}

impl PreparedWorkload {
    pub fn new(workload: &Workload) -> Self {
        Self {
            subjects: (0..workload.subjects.max(1))
                .map(|_| Uuid::new_v4())
                .collect(),
            invalid_ratio: workload.invalid_ratio,
            cleanup_ratio: workload.cleanup_ratio,
        }
    }

    /// Picks the key for the next resolve.
    pub fn next_key(&self) -> String {
        let mut rng = rand::rng();
        if rng.random_bool(self.invalid_ratio.clamp(0.0, 1.0)) {
            return format!("invalid-{}", rng.random_range(0..self.subjects.len()));
        }
        self.subjects[rng.random_range(0..self.subjects.len())].to_string()
    }

    fn should_cleanup(&self) -> bool {
        rand::rng().random_bool(self.cleanup_ratio.clamp(0.0, 1.0))
    }
}

/// The outcome of a single resolve, as counted by the stresstest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    Loaded,
    Invalid,
    TimedOut,
    Failed,
}

pub async fn process_payload(
    coordinator: &LoadCoordinator<TestSubject, TransientFallback>,
    workload: &PreparedWorkload,
) -> Outcome {
    let key = workload.next_key();
    let resolved = coordinator.resolve(&key).await;

    if let Some(entry) = resolved.entry() {
        if workload.should_cleanup() {
            entry.set_cleanup(true);
        }
    }

    match resolved.fallback_reason() {
        None => Outcome::Loaded,
        Some(FallbackReason::InvalidKey | FallbackReason::TranslationFailed) => Outcome::Invalid,
        Some(FallbackReason::TimedOut(_)) => Outcome::TimedOut,
        Some(FallbackReason::LoadFailed(_) | FallbackReason::Missing) => Outcome::Failed,
    }
}
