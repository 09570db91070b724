use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};
use warden_core::domain::event::ThreatClassificationPayload;
use warden_core::{
    AgentId, AggregationError, EventLog, EventLogError, EventPayload, EventRecord, EventType,
    LogAggregator, SessionId,
};

use crate::classifier::{Classifier, ClassifierError};

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PollStats {
    pub sessions_found: u64,
    pub sessions_classified: u64,
    pub already_classified: u64,
    pub errors: u64,
}

/// Classifies finished sessions that have no verdict yet.
pub struct ClassificationPoller {
    log: EventLog,
    aggregator: LogAggregator,
    classifier: Arc<dyn Classifier>,
    interval: Duration,
    last_run: Option<Instant>,
}

impl ClassificationPoller {
    pub fn new(log: EventLog, classifier: Arc<dyn Classifier>, polling_interval_minutes: u64) -> Self {
        Self {
            aggregator: LogAggregator::new(log.clone()),
            log,
            classifier,
            interval: Duration::from_secs(polling_interval_minutes.saturating_mul(60)),
            last_run: None,
        }
    }

    pub fn with_aggregator(mut self, aggregator: LogAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True once a full interval has passed since the last completed cycle.
    /// The first poll is always eligible.
    pub fn should_poll(&self) -> bool {
        self.last_run.map_or(true, |last_run| last_run.elapsed() >= self.interval)
    }

    pub async fn find_unclassified_sessions(&self) -> Result<Vec<(SessionId, AgentId)>, PollError> {
        let mut unclassified = Vec::new();
        for (session_id, agent_id) in self.log.finished_sessions().await? {
            if !self.log.has_event(&session_id, EventType::ThreatClassification).await? {
                unclassified.push((session_id, agent_id));
            }
        }
        Ok(unclassified)
    }

    /// Aggregates, classifies and persists one verdict.
    ///
    /// Returns `None` when another writer classified the session first.
    pub async fn classify_session(
        &self,
        session_id: &SessionId,
        agent_id: AgentId,
    ) -> Result<Option<EventRecord>, PollError> {
        let summary = self.aggregator.aggregate_session(session_id, agent_id).await?;
        let classification =
            self.classifier.classify(&summary.to_classification_context()).await?;

        let payload = EventPayload::ThreatClassification(ThreatClassificationPayload {
            classification,
            analysis_window: summary.window,
            classification_timestamp: Utc::now().trunc_subsecs(6),
        });
        Ok(self
            .log
            .emit_if_absent(session_id, agent_id, payload, EventType::ThreatClassification)
            .await?)
    }

    /// Runs one cycle. A failing session is counted and skipped.
    pub async fn poll_once(&mut self) -> Result<PollStats, PollError> {
        let candidates = self.find_unclassified_sessions().await?;
        let mut stats = PollStats { sessions_found: candidates.len() as u64, ..PollStats::default() };
        info!(
            event_name = "worker.poll.started",
            sessions_found = stats.sessions_found,
            "poll cycle started"
        );

        for (session_id, agent_id) in candidates {
            match self.classify_session(&session_id, agent_id).await {
                Ok(Some(_)) => stats.sessions_classified += 1,
                Ok(None) => {
                    info!(
                        event_name = "worker.session.already_classified",
                        session_id = %session_id,
                        agent_id = agent_id.0,
                        "session was classified concurrently"
                    );
                    stats.already_classified += 1;
                }
                Err(error) => {
                    warn!(
                        event_name = "worker.session.classification_failed",
                        session_id = %session_id,
                        agent_id = agent_id.0,
                        error = %error,
                        "session classification failed"
                    );
                    stats.errors += 1;
                }
            }
        }

        self.last_run = Some(Instant::now());
        info!(
            event_name = "worker.poll.completed",
            sessions_found = stats.sessions_found,
            sessions_classified = stats.sessions_classified,
            already_classified = stats.already_classified,
            errors = stats.errors,
            "poll cycle completed"
        );
        Ok(stats)
    }

    /// Polls until `shutdown` flips to true. An in-flight cycle finishes
    /// first; the wait between cycles is cut short.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            event_name = "worker.poller.started",
            interval_secs = self.interval.as_secs(),
            "classification poller started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = if self.should_poll() {
                if let Err(error) = self.poll_once().await {
                    error!(
                        event_name = "worker.poll.failed",
                        error = %error,
                        "poll cycle failed"
                    );
                }
                self.interval
            } else {
                self.last_run
                    .map(|last_run| self.interval.saturating_sub(last_run.elapsed()))
                    .unwrap_or_default()
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(event_name = "worker.poller.stopped", "classification poller stopped");
    }
}
