use crate::template::ReportFormat;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::ConductorResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;

/// One batch of rendered reports sent to one channel by one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub template: String,
    pub format: ReportFormat,
    pub reports: Vec<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A destination for report deliveries.
#[async_trait]
pub trait ReportChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, delivery: &Delivery) -> ConductorResult<()>;
}

/// Writes each delivery to the tracing log.
pub struct LogChannel;

#[async_trait]
impl ReportChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, delivery: &Delivery) -> ConductorResult<()> {
        for report in &delivery.reports {
            match report.get("summary").and_then(|s| s.as_str()) {
                Some(summary) => tracing::info!(template = %delivery.template, "{summary}"),
                None => tracing::info!(template = %delivery.template, report = %report, "Report"),
            }
        }
        Ok(())
    }
}

/// Keeps the most recent deliveries in memory.
pub struct MemoryChannel {
    capacity: usize,
    deliveries: Mutex<VecDeque<Delivery>>,
}

impl MemoryChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            deliveries: Mutex::new(VecDeque::new()),
        }
    }

    /// Oldest first.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.lock().is_empty()
    }
}

#[async_trait]
impl ReportChannel for MemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, delivery: &Delivery) -> ConductorResult<()> {
        let mut deliveries = self.deliveries.lock();
        if deliveries.len() == self.capacity {
            deliveries.pop_front();
        }
        deliveries.push_back(delivery.clone());
        Ok(())
    }
}

/// Fans deliveries out to live subscribers (dashboards, websockets).
///
/// Having no subscriber is not an error.
pub struct StreamChannel {
    tx: broadcast::Sender<Delivery>,
}

impl StreamChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ReportChannel for StreamChannel {
    fn name(&self) -> &str {
        "stream"
    }

    async fn deliver(&self, delivery: &Delivery) -> ConductorResult<()> {
        let _ = self.tx.send(delivery.clone());
        Ok(())
    }
}
