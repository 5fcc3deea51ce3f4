use crate::channel::{Delivery, LogChannel, MemoryChannel, ReportChannel, StreamChannel};
use crate::config::ReportingConfig;
use crate::dashboard::{CommandUpdate, Dashboard, DashboardData};
use crate::issue::{Escalation, Issue, IssueCategory, IssueTracker, Severity};
use crate::report::{MetricsSample, ProgressReport, ReportKind, ReportLevel, ReportQuery, ReportSource};
use crate::template::{render, ReportTemplate};
use chrono::Utc;
use conductor_core::{
    AgentTier, ConductorError, ConductorResult, ErrorKind, EventBus, Failure, OrchestratorEvent,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct DeliveryJob {
    channel: String,
    delivery: Delivery,
}

struct ReportState {
    history: VecDeque<ProgressReport>,
    metrics: VecDeque<MetricsSample>,
    dashboard: Dashboard,
    issues: IssueTracker,
    /// Rendered reports waiting for their periodic template to fire.
    batches: HashMap<String, VecDeque<serde_json::Value>>,
    /// Commands whose terminal event has been fully ingested.
    settled: VecDeque<Uuid>,
}

struct Shared {
    config: ReportingConfig,
    state: Mutex<ReportState>,
    templates: RwLock<Vec<ReportTemplate>>,
    channels: RwLock<HashMap<String, Arc<dyn ReportChannel>>>,
    events: RwLock<Option<EventBus>>,
    settled_notify: Notify,
}

impl Shared {
    /// Store a report built under the state lock and route it.
    ///
    /// Issues are merged into the tracker (possibly escalating), a metrics
    /// sample is taken, and matching templates either queue the report for
    /// their next periodic flush or produce delivery jobs right away.
    fn ingest(
        &self,
        state: &mut ReportState,
        mut report: ProgressReport,
        route: bool,
    ) -> (ProgressReport, Vec<DeliveryJob>, Vec<Escalation>) {
        let mut escalations = Vec::new();
        for issue in &mut report.issues {
            let (stored, escalation) = state.issues.record(report.level, issue.clone(), report.timestamp);
            *issue = stored;
            escalations.extend(escalation);
        }

        state.dashboard.count_report();
        let sample = state.dashboard.sample(state.issues.active_count());
        push_bounded(&mut state.metrics, sample, self.config.metrics_history_limit);
        push_bounded(&mut state.history, report.clone(), self.config.history_limit);

        let mut jobs = Vec::new();
        if route {
            for template in self.templates.read().iter().filter(|t| t.matches(&report)) {
                let rendered = render(template.format, &report);
                if template.is_periodic() && !report.is_high_priority() {
                    let batch = state.batches.entry(template.name.clone()).or_default();
                    push_bounded(batch, rendered, self.config.history_limit);
                    continue;
                }
                let delivery = Delivery {
                    template: template.name.clone(),
                    format: template.format,
                    reports: vec![rendered],
                    created_at: report.timestamp,
                };
                jobs.extend(template.channels.iter().map(|channel| DeliveryJob {
                    channel: channel.clone(),
                    delivery: delivery.clone(),
                }));
            }
        }
        (report, jobs, escalations)
    }

    fn emit_escalations(&self, escalations: Vec<Escalation>) {
        let events = self.events.read();
        let Some(events) = events.as_ref() else {
            return;
        };
        for escalation in escalations {
            events.emit(OrchestratorEvent::IssueEscalated {
                issue_id: escalation.issue_id,
                level: escalation.level.to_string(),
                severity: escalation.severity.to_string(),
            });
        }
    }

    /// Take the pending batch of one periodic template.
    fn take_batch(&self, template: &ReportTemplate) -> Vec<DeliveryJob> {
        let reports: Vec<serde_json::Value> = match self.state.lock().batches.remove(&template.name) {
            Some(batch) if !batch.is_empty() => batch.into_iter().collect(),
            _ => return Vec::new(),
        };
        let delivery = Delivery {
            template: template.name.clone(),
            format: template.format,
            reports,
            created_at: Utc::now(),
        };
        template
            .channels
            .iter()
            .map(|channel| DeliveryJob {
                channel: channel.clone(),
                delivery: delivery.clone(),
            })
            .collect()
    }

    /// A failed delivery becomes a session-level delivery issue. It is stored
    /// but not routed, so a broken channel cannot feed itself.
    fn delivery_failed(&self, job: &DeliveryJob, error: &ConductorError) {
        warn!(
            channel = %job.channel,
            template = %job.delivery.template,
            error = %error,
            "Report delivery failed"
        );
        let issue = Issue::new(
            Severity::Medium,
            IssueCategory::Delivery,
            format!("delivery to channel '{}' failed: {error}", job.channel),
        )
        .with_components(vec![job.channel.clone(), job.delivery.template.clone()]);
        let escalations = {
            let mut state = self.state.lock();
            let metrics = snapshot(&state.dashboard.overview());
            let mut report = ProgressReport::new(ReportKind::Error, ReportSource::System, ReportLevel::Session, metrics);
            report.issues.push(issue);
            self.ingest(&mut state, report, false).2
        };
        self.emit_escalations(escalations);
    }

    async fn deliver(&self, job: &DeliveryJob) -> ConductorResult<()> {
        let channel = self
            .channels
            .read()
            .get(&job.channel)
            .cloned()
            .ok_or_else(|| ConductorError::NotFound(format!("report channel '{}'", job.channel)))?;
        match tokio::time::timeout(self.config.delivery_timeout(), channel.deliver(&job.delivery)).await {
            Ok(result) => result,
            Err(_) => Err(ConductorError::Timeout(format!(
                "channel '{}' did not accept the delivery within {}ms",
                job.channel, self.config.delivery_timeout_ms
            ))),
        }
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, limit: usize) {
    if queue.len() >= limit.max(1) {
        queue.pop_front();
    }
    queue.push_back(item);
}

fn snapshot<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Single ingestion point for progress and error facts.
///
/// Every `report_*` call builds an immutable [`ProgressReport`], updates
/// the dashboard aggregates for its level, appends it to the bounded
/// history, and hands matching deliveries to a background worker. Delivery
/// never blocks ingestion; a channel that errors or times out produces a
/// delivery [`Issue`] instead.
pub struct ReportingSystem {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<DeliveryJob>,
    memory: Arc<MemoryChannel>,
    stream: Arc<StreamChannel>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReportingSystem {
    /// Build the system and start its delivery worker and periodic flushes.
    ///
    /// Registers the built-in `log`, `memory`, and `stream` channels. Must be
    /// called inside a tokio runtime.
    pub fn new(config: ReportingConfig) -> ConductorResult<Arc<Self>> {
        config.validate()?;
        let memory = Arc::new(MemoryChannel::new(config.memory_capacity));
        let stream = Arc::new(StreamChannel::new(config.stream_capacity));
        let mut channels: HashMap<String, Arc<dyn ReportChannel>> = HashMap::new();
        channels.insert("log".to_string(), Arc::new(LogChannel));
        channels.insert("memory".to_string(), memory.clone());
        channels.insert("stream".to_string(), stream.clone());

        let state = ReportState {
            history: VecDeque::new(),
            metrics: VecDeque::new(),
            dashboard: Dashboard::new(config.history_limit),
            issues: IssueTracker::new(config.rollup_window(), config.escalation_threshold),
            batches: HashMap::new(),
            settled: VecDeque::new(),
        };
        let templates = config.templates.clone();
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(state),
            templates: RwLock::new(Vec::new()),
            channels: RwLock::new(channels),
            events: RwLock::new(None),
            settled_notify: Notify::new(),
        });

        let (jobs, mut rx) = mpsc::unbounded_channel::<DeliveryJob>();
        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = worker_shared.deliver(&job).await {
                    worker_shared.delivery_failed(&job, &e);
                }
            }
        });

        let system = Arc::new(Self {
            shared,
            jobs,
            memory,
            stream,
            tasks: Mutex::new(vec![worker]),
        });
        for template in templates {
            system.add_template(template)?;
        }
        info!(templates = system.shared.templates.read().len(), "Reporting system started");
        Ok(system)
    }

    pub fn config(&self) -> &ReportingConfig {
        &self.shared.config
    }

    /// Add or replace a channel under its own name.
    pub fn register_channel(&self, channel: Arc<dyn ReportChannel>) {
        let name = channel.name().to_string();
        debug!(channel = %name, "Report channel registered");
        self.shared.channels.write().insert(name, channel);
    }

    /// Add a template; periodic templates get their own flush schedule.
    pub fn add_template(&self, template: ReportTemplate) -> ConductorResult<()> {
        template.validate()?;
        if template.is_periodic() {
            let shared = self.shared.clone();
            let jobs = self.jobs.clone();
            let periodic = template.clone();
            let handle = tokio::spawn(async move {
                while let Some(next) = periodic.next_flush(Utc::now()) {
                    let wait = (next - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(wait).await;
                    for job in shared.take_batch(&periodic) {
                        if jobs.send(job).is_err() {
                            return;
                        }
                    }
                }
            });
            self.tasks.lock().push(handle);
        }
        let mut templates = self.shared.templates.write();
        templates.retain(|t| t.name != template.name);
        templates.push(template);
        Ok(())
    }

    /// The built-in bounded `memory` channel.
    pub fn memory_channel(&self) -> Arc<MemoryChannel> {
        self.memory.clone()
    }

    /// Live deliveries sent to the built-in `stream` channel.
    pub fn subscribe_stream(&self) -> broadcast::Receiver<Delivery> {
        self.stream.subscribe()
    }

    pub fn report_task_progress(
        &self,
        task_id: Uuid,
        command_id: Option<Uuid>,
        agent_id: Option<&str>,
        progress: f64,
        message: Option<String>,
    ) -> ProgressReport {
        self.record(|dashboard| {
            let view = dashboard.task_progress(task_id, command_id, agent_id, progress, message);
            ProgressReport::new(
                ReportKind::TaskProgress,
                ReportSource::Task(task_id),
                ReportLevel::Task,
                snapshot(view),
            )
        })
    }

    /// Record a finished task. `failure` is `None` on success; cancellations
    /// are recorded without an issue.
    pub fn report_task_completion(
        &self,
        task_id: Uuid,
        command_id: Option<Uuid>,
        agent_id: Option<&str>,
        duration_ms: u64,
        failure: Option<&Failure>,
    ) -> ProgressReport {
        self.record(|dashboard| {
            let view = dashboard.task_completion(task_id, command_id, agent_id, duration_ms, failure.is_none());
            let mut report = ProgressReport::new(
                ReportKind::TaskCompletion,
                ReportSource::Task(task_id),
                ReportLevel::Task,
                snapshot(view),
            );
            if let Some(failure) = failure.filter(|f| !f.is_cancellation()) {
                let mut components = vec![task_id.to_string()];
                components.extend(agent_id.map(str::to_string));
                let issue = Issue::from_failure(failure).with_components(components);
                report.recommendations = issue.suggested_actions.clone();
                report.issues.push(issue);
            }
            report
        })
    }

    pub fn report_agent_status(&self, agent_id: &str, tier: Option<AgentTier>, status: &str, load: f64) -> ProgressReport {
        self.record(|dashboard| {
            let perf = dashboard.agent_status(agent_id, tier, status, load);
            ProgressReport::new(
                ReportKind::AgentStatus,
                ReportSource::Agent(agent_id.to_string()),
                ReportLevel::Agent,
                snapshot(perf),
            )
        })
    }

    pub fn report_command_progress(&self, update: CommandUpdate) -> ProgressReport {
        let command_id = update.command_id;
        self.record(|dashboard| {
            let view = dashboard.command_progress(update);
            ProgressReport::new(
                ReportKind::CommandProgress,
                ReportSource::Command(command_id),
                ReportLevel::Command,
                snapshot(view),
            )
        })
    }

    /// Record an error against `source`. The report's metrics are the
    /// source's current aggregate at the source's level.
    pub fn report_error(&self, source: ReportSource, failure: &Failure, components: Vec<String>) -> ProgressReport {
        self.record(|dashboard| {
            let metrics = match &source {
                ReportSource::Agent(id) => dashboard.agent(id).map(snapshot),
                ReportSource::Task(id) => dashboard.task(*id).map(snapshot),
                ReportSource::Command(id) => dashboard.command(*id).map(snapshot),
                ReportSource::System => Some(snapshot(&dashboard.overview())),
            };
            let level = source.level();
            let mut report = ProgressReport::new(
                ReportKind::Error,
                source,
                level,
                metrics.unwrap_or(serde_json::Value::Null),
            );
            let issue = Issue::from_failure(failure).with_components(components);
            report.recommendations = issue.suggested_actions.clone();
            report.issues.push(issue);
            report
        })
    }

    /// Record one tier pool's utilisation.
    pub fn report_pool_utilisation(&self, tier: AgentTier, busy: usize, total: usize, queued: usize) -> ProgressReport {
        self.record(|dashboard| {
            let pool = dashboard.pool_utilisation(tier, busy, total, queued);
            let mut report = ProgressReport::new(
                ReportKind::Resource,
                ReportSource::System,
                ReportLevel::Session,
                snapshot(pool),
            );
            if queued > 0 && busy == total {
                report
                    .recommendations
                    .push(format!("Raise the {tier} pool maximum; {queued} tasks are waiting"));
            }
            report
        })
    }

    /// Remove an issue from the active list. Level severities stay raised.
    pub fn resolve_issue(&self, issue_id: Uuid) -> Option<Issue> {
        let resolved = self.shared.state.lock().issues.resolve(issue_id);
        if resolved.is_some() {
            info!(issue_id = %issue_id, "Issue resolved");
        }
        resolved
    }

    pub fn get_dashboard_data(&self) -> DashboardData {
        let state = self.shared.state.lock();
        state.dashboard.data(state.issues.active(), state.issues.severities())
    }

    /// Matching reports, oldest first.
    pub fn get_report_history(&self, query: &ReportQuery) -> Vec<ProgressReport> {
        let state = self.shared.state.lock();
        let mut reports: Vec<ProgressReport> = state.history.iter().filter(|r| query.matches(r)).cloned().collect();
        if let Some(limit) = query.limit {
            let skip = reports.len().saturating_sub(limit);
            reports.drain(..skip);
        }
        reports
    }

    /// The most recent `limit` session samples, oldest first.
    pub fn get_metrics_history(&self, limit: usize) -> Vec<MetricsSample> {
        let state = self.shared.state.lock();
        let skip = state.metrics.len().saturating_sub(limit);
        state.metrics.iter().skip(skip).cloned().collect()
    }

    /// Flush every periodic batch now. Returns the number of reports sent.
    pub fn flush_periodic(&self) -> usize {
        let templates: Vec<ReportTemplate> = self
            .shared
            .templates
            .read()
            .iter()
            .filter(|t| t.is_periodic())
            .cloned()
            .collect();
        let mut flushed = 0;
        for template in &templates {
            let jobs = self.shared.take_batch(template);
            flushed += jobs.first().map_or(0, |j| j.delivery.reports.len());
            self.dispatch(jobs);
        }
        flushed
    }

    /// Ingest every subsequent orchestration event as a report.
    ///
    /// Escalations are published back on the same bus.
    pub fn attach(self: &Arc<Self>, events: &EventBus) {
        *self.shared.events.write() = Some(events.clone());
        let mut rx = events.subscribe();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(system) = weak.upgrade() else {
                            break;
                        };
                        system.ingest_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Reporting lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Wait until the terminal event of a command has been ingested from the
    /// bus, including any error report it produces.
    pub async fn wait_for_command_reports(&self, command_id: Uuid, timeout: Duration) -> ConductorResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.settled_notify.notified();
            if self.shared.state.lock().settled.contains(&command_id) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConductorError::Timeout(format!(
                    "reports for command {command_id} not settled after {}ms",
                    timeout.as_millis()
                )));
            }
            let _ = tokio::time::timeout((deadline - now).min(Duration::from_millis(50)), notified).await;
        }
    }

    fn ingest_event(&self, event: OrchestratorEvent) {
        let settled = match &event {
            OrchestratorEvent::CommandCompleted { command_id, .. }
            | OrchestratorEvent::CommandFailed { command_id, .. }
            | OrchestratorEvent::CommandCancelled { command_id } => Some(*command_id),
            _ => None,
        };
        match event {
            OrchestratorEvent::CommandStarted {
                command_id,
                command_type,
                title,
            } => {
                self.report_command_progress(
                    CommandUpdate::new(command_id, "pending")
                        .with_identity(command_type, title)
                        .with_progress(0.0),
                );
            }
            OrchestratorEvent::CommandProgress {
                command_id,
                status,
                progress,
                completed_tasks,
                total_tasks,
            } => {
                self.report_command_progress(
                    CommandUpdate::new(command_id, status)
                        .with_progress(progress)
                        .with_tasks(completed_tasks, total_tasks),
                );
            }
            OrchestratorEvent::CommandCompleted { command_id, .. } => {
                self.report_command_progress(CommandUpdate::new(command_id, "completed").with_progress(100.0));
            }
            OrchestratorEvent::CommandFailed { command_id, failure } => {
                self.report_command_progress(CommandUpdate::new(command_id, "failed"));
                // Gate failures were already reported by their own event.
                if !failure.is_cancellation() && failure.kind != ErrorKind::QualityGate {
                    self.report_error(ReportSource::Command(command_id), &failure, vec![command_id.to_string()]);
                }
            }
            OrchestratorEvent::CommandCancelled { command_id } => {
                self.report_command_progress(CommandUpdate::new(command_id, "failed"));
            }
            OrchestratorEvent::QualityGateFailed {
                command_id,
                gate,
                reason,
            } => {
                let failure = Failure::new(
                    ErrorKind::QualityGate,
                    format!("Quality gate '{gate}' failed: {reason}"),
                );
                self.report_error(ReportSource::Command(command_id), &failure, vec![command_id.to_string(), gate]);
            }
            OrchestratorEvent::TaskAssigned {
                task_id,
                command_id,
                process_id,
                ..
            } => {
                self.report_task_progress(task_id, command_id, Some(&process_id), 0.0, Some("assigned".to_string()));
            }
            OrchestratorEvent::TaskProgress {
                task_id,
                agent_id,
                progress,
                message,
            } => {
                self.report_task_progress(task_id, None, Some(&agent_id), progress, message);
            }
            OrchestratorEvent::TaskRequeued {
                task_id,
                attempt,
                retries_left,
            } => {
                let message = format!("requeued after attempt {attempt}, {retries_left} retries left");
                self.report_task_progress(task_id, None, None, 0.0, Some(message));
            }
            OrchestratorEvent::TaskCompleted {
                task_id,
                command_id,
                process_id,
                duration_ms,
            } => {
                self.report_task_completion(task_id, command_id, process_id.as_deref(), duration_ms, None);
            }
            OrchestratorEvent::TaskFailed {
                task_id,
                command_id,
                process_id,
                failure,
                ..
            } => {
                self.report_task_completion(task_id, command_id, process_id.as_deref(), 0, Some(&failure));
            }
            OrchestratorEvent::AgentRegistered { agent_id, tier } => {
                self.report_agent_status(&agent_id, Some(tier), "online", 0.0);
            }
            OrchestratorEvent::AgentStatusChanged { agent_id, status, load } => {
                self.report_agent_status(&agent_id, None, &status, load);
            }
            OrchestratorEvent::AgentTimeout { agent_id } => {
                self.report_agent_status(&agent_id, None, "offline", 0.0);
                let failure = Failure::new(
                    ErrorKind::Timeout,
                    format!("agent '{agent_id}' stopped answering heartbeats"),
                );
                self.report_error(ReportSource::Agent(agent_id.clone()), &failure, vec![agent_id]);
            }
            OrchestratorEvent::AgentDisconnected { agent_id } => {
                self.report_agent_status(&agent_id, None, "offline", 0.0);
            }
            OrchestratorEvent::AgentError { agent_id, message } => {
                let failure = Failure::new(ErrorKind::Execution, message);
                self.report_error(ReportSource::Agent(agent_id.clone()), &failure, vec![agent_id]);
            }
            OrchestratorEvent::ProcessSpawned { tier, process_id } => {
                self.report_agent_status(&process_id, Some(tier), "idle", 0.0);
            }
            OrchestratorEvent::ProcessTerminated { tier, process_id, .. } => {
                self.report_agent_status(&process_id, Some(tier), "terminated", 0.0);
            }
            OrchestratorEvent::PoolUtilization {
                tier,
                busy,
                total,
                queued,
            } => {
                self.report_pool_utilisation(tier, busy, total, queued);
            }
            OrchestratorEvent::TaskQueued { .. }
            | OrchestratorEvent::PoolScaled { .. }
            | OrchestratorEvent::IssueEscalated { .. } => {}
        }
        if let Some(command_id) = settled {
            push_bounded(&mut self.shared.state.lock().settled, command_id, self.shared.config.history_limit);
            self.shared.settled_notify.notify_waiters();
        }
    }

    /// Build a report under the state lock, ingest it, then deliver and
    /// publish escalations after the lock is released.
    fn record<F>(&self, build: F) -> ProgressReport
    where
        F: FnOnce(&mut Dashboard) -> ProgressReport,
    {
        let (report, jobs, escalations) = {
            let mut state = self.shared.state.lock();
            let report = build(&mut state.dashboard);
            self.shared.ingest(&mut state, report, true)
        };
        debug!(
            report_id = %report.id,
            kind = %report.kind,
            source = %report.source,
            deliveries = jobs.len(),
            "Report ingested"
        );
        self.dispatch(jobs);
        self.shared.emit_escalations(escalations);
        report
    }

    fn dispatch(&self, jobs: Vec<DeliveryJob>) {
        for job in jobs {
            if self.jobs.send(job).is_err() {
                warn!("Report delivery worker has stopped");
                return;
            }
        }
    }
}

impl Drop for ReportingSystem {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
