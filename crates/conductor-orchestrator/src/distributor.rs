use crate::types::ProcessInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Selection rule used by the [`TaskDistributor`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Most specialised candidate holding every required capability.
    #[default]
    CapabilityBased,
    /// Lowest load, then fewest selections.
    LoadBalanced,
    /// Highest weighted score of speed, reliability, and free CPU.
    PerformanceBased,
    /// Rotate through candidates ordered by id.
    RoundRobin,
}

/// Weights of the performance score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerformanceWeights {
    #[serde(default = "default_speed_weight")]
    pub speed: f64,
    #[serde(default = "default_reliability_weight")]
    pub reliability: f64,
    #[serde(default = "default_cpu_weight")]
    pub cpu: f64,
}

fn default_speed_weight() -> f64 {
    0.4
}

fn default_reliability_weight() -> f64 {
    0.4
}

fn default_cpu_weight() -> f64 {
    0.2
}

impl Default for PerformanceWeights {
    fn default() -> Self {
        Self {
            speed: default_speed_weight(),
            reliability: default_reliability_weight(),
            cpu: default_cpu_weight(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributorConfig {
    #[serde(default)]
    pub strategy: DistributionStrategy,
    #[serde(default)]
    pub weights: PerformanceWeights,
}

/// Picks the process that should run a task.
///
/// Selection reads only the candidate snapshot it is given; the only state it
/// mutates is its own round-robin cursor and per-candidate selection counts.
#[derive(Debug, Default)]
pub struct TaskDistributor {
    config: DistributorConfig,
    cursor: usize,
    selections: HashMap<String, u64>,
}

impl TaskDistributor {
    pub fn new(config: DistributorConfig) -> Self {
        Self {
            config,
            cursor: 0,
            selections: HashMap::new(),
        }
    }

    pub fn strategy(&self) -> DistributionStrategy {
        self.config.strategy
    }

    pub fn set_config(&mut self, config: DistributorConfig) {
        self.config = config;
    }

    /// How many times a candidate has been chosen.
    pub fn selections(&self, id: &str) -> u64 {
        self.selections.get(id).copied().unwrap_or(0)
    }

    /// Forget counters of candidates that no longer exist.
    pub fn forget(&mut self, id: &str) {
        self.selections.remove(id);
    }

    /// Choose an idle candidate holding every required capability, or `None`.
    pub fn select(&mut self, required: &[String], candidates: &[ProcessInfo]) -> Option<String> {
        let mut qualifying: Vec<&ProcessInfo> = candidates
            .iter()
            .filter(|c| c.is_idle() && c.has_capabilities(required))
            .collect();
        if qualifying.is_empty() {
            return None;
        }
        qualifying.sort_by(|a, b| a.id.cmp(&b.id));

        let chosen = match self.config.strategy {
            DistributionStrategy::CapabilityBased => self.by_specialisation(required, &qualifying),
            DistributionStrategy::LoadBalanced => self.by_load(&qualifying),
            DistributionStrategy::PerformanceBased => self.by_performance(&qualifying),
            DistributionStrategy::RoundRobin => {
                let pick = qualifying[self.cursor % qualifying.len()];
                self.cursor = self.cursor.wrapping_add(1);
                pick
            }
        };
        let id = chosen.id.clone();
        *self.selections.entry(id.clone()).or_insert(0) += 1;
        Some(id)
    }

    fn by_specialisation<'a>(&self, required: &[String], qualifying: &[&'a ProcessInfo]) -> &'a ProcessInfo {
        let specialisation = |c: &ProcessInfo| {
            if c.capabilities.is_empty() {
                // Nothing offered, nothing required: neutral match.
                return if required.is_empty() { 1.0 } else { 0.0 };
            }
            let matched = required.iter().filter(|r| c.capabilities.contains(r)).count();
            if required.is_empty() {
                1.0 / c.capabilities.len() as f64
            } else {
                matched as f64 / c.capabilities.len() as f64
            }
        };
        let mut best = qualifying[0];
        for candidate in &qualifying[1..] {
            let (s, best_s) = (specialisation(*candidate), specialisation(best));
            if s > best_s || (s == best_s && candidate.load < best.load) {
                best = *candidate;
            }
        }
        best
    }

    fn by_load<'a>(&self, qualifying: &[&'a ProcessInfo]) -> &'a ProcessInfo {
        let mut best = qualifying[0];
        for candidate in &qualifying[1..] {
            let fewer = self.selections(&candidate.id) < self.selections(&best.id);
            if candidate.load < best.load || (candidate.load == best.load && fewer) {
                best = *candidate;
            }
        }
        best
    }

    fn by_performance<'a>(&self, qualifying: &[&'a ProcessInfo]) -> &'a ProcessInfo {
        let mut best = qualifying[0];
        let mut best_score = self.score(best);
        for candidate in &qualifying[1..] {
            let score = self.score(candidate);
            if score > best_score {
                best = *candidate;
                best_score = score;
            }
        }
        best
    }

    /// `w_speed * min(1, 1/avg_secs) + w_rel * (1 - error_rate) + w_cpu * (1 - cpu)`.
    /// A process without history scores full speed.
    pub fn score(&self, candidate: &ProcessInfo) -> f64 {
        let w = self.config.weights;
        let speed = match candidate.avg_duration_secs() {
            Some(secs) if secs > 0.0 => (1.0 / secs).min(1.0),
            _ => 1.0,
        };
        w.speed * speed
            + w.reliability * (1.0 - candidate.error_rate())
            + w.cpu * (1.0 - candidate.cpu_usage.clamp(0.0, 1.0))
    }
}
