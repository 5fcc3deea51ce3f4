use crate::template::ReportTemplate;
use conductor_core::ConductorResult;
use serde::Deserialize;
use std::time::Duration;

/// History bounds, escalation rules, and delivery templates for the
/// [`ReportingSystem`](crate::ReportingSystem).
#[derive(Debug, Clone, Deserialize)]
pub struct ReportingConfig {
    /// Reports kept in the append-only history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Session metric samples kept for `get_metrics_history`.
    #[serde(default = "default_metrics_history_limit")]
    pub metrics_history_limit: usize,
    /// Interval over which a level's issues are counted for escalation.
    #[serde(default = "default_rollup_window_ms")]
    pub rollup_window_ms: u64,
    /// Issues within one rollup window that trigger an escalation.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: usize,
    /// Upper bound on a single channel delivery.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    /// Deliveries kept by the built-in `memory` channel.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    /// Buffer of the built-in `stream` channel.
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
    #[serde(default = "default_templates")]
    pub templates: Vec<ReportTemplate>,
}

fn default_history_limit() -> usize {
    1000
}

fn default_metrics_history_limit() -> usize {
    500
}

fn default_rollup_window_ms() -> u64 {
    300_000
}

fn default_escalation_threshold() -> usize {
    3
}

fn default_delivery_timeout_ms() -> u64 {
    5_000
}

fn default_memory_capacity() -> usize {
    256
}

fn default_stream_capacity() -> usize {
    256
}

fn default_templates() -> Vec<ReportTemplate> {
    vec![ReportTemplate::realtime("log", &["log"])]
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            metrics_history_limit: default_metrics_history_limit(),
            rollup_window_ms: default_rollup_window_ms(),
            escalation_threshold: default_escalation_threshold(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            memory_capacity: default_memory_capacity(),
            stream_capacity: default_stream_capacity(),
            templates: default_templates(),
        }
    }
}

impl ReportingConfig {
    pub fn rollup_window(&self) -> Duration {
        Duration::from_millis(self.rollup_window_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Reject templates whose cron expression does not parse or that name no channel.
    pub fn validate(&self) -> ConductorResult<()> {
        for template in &self.templates {
            template.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ReportingConfig = serde_json::from_value(serde_json::json!({
            "escalation_threshold": 5
        }))
        .unwrap();
        assert_eq!(config.escalation_threshold, 5);
        assert_eq!(config.history_limit, 1000);
        assert_eq!(config.templates.len(), 1);
        assert_eq!(config.templates[0].channels, ["log"]);
        assert!(config.validate().is_ok());
    }
}
