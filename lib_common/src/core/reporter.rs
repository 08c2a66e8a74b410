//! # Stats Reporter
//!
//! Sink for live stats and terminal notifications. Engines never depend on
//! delivery: a reporter error is logged at debug level and the loop goes on.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::model::{StatsSnapshot, TerminalReason};
use crate::core::registry::TaskView;

/// Delivery failure of a reporter.
#[derive(Debug, Error)]
#[error("report not delivered: {0}")]
pub struct ReportError(pub String);

/// Receives per-cycle updates and exactly one terminal notification per task.
#[async_trait]
pub trait StatsReporter: Send + Sync {
    /// A cycle completed.
    async fn on_cycle(&self, task: &TaskView, snapshot: &StatsSnapshot) -> Result<(), ReportError>;

    /// The task ended. `snapshot` carries the rendered reason.
    async fn on_terminal(
        &self,
        task: &TaskView,
        reason: &TerminalReason,
        snapshot: &StatsSnapshot,
    ) -> Result<(), ReportError>;
}

/// Writes every event to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

#[async_trait]
impl StatsReporter for TracingReporter {
    async fn on_cycle(&self, task: &TaskView, snapshot: &StatsSnapshot) -> Result<(), ReportError> {
        tracing::info!(
            task_id = %task.task_id,
            owner = %task.owner,
            credential = %task.credential,
            requests = snapshot.requests_sent,
            cycles = snapshot.cycles_completed,
            errors = snapshot.error_count,
            "cycle completed"
        );
        Ok(())
    }

    async fn on_terminal(
        &self,
        task: &TaskView,
        reason: &TerminalReason,
        snapshot: &StatsSnapshot,
    ) -> Result<(), ReportError> {
        if reason.is_failure() {
            tracing::warn!(task_id = %task.task_id, owner = %task.owner, "{}", snapshot.render());
        } else {
            tracing::info!(task_id = %task.task_id, owner = %task.owner, "{}", snapshot.render());
        }
        Ok(())
    }
}

/// One reporter event, as forwarded by [`ChannelReporter`].
#[derive(Debug, Clone)]
pub enum ReportEvent {
    /// See [`StatsReporter::on_cycle`].
    Cycle {
        /// The task.
        task: TaskView,
        /// Counters after the cycle.
        snapshot: StatsSnapshot,
    },
    /// See [`StatsReporter::on_terminal`].
    Terminal {
        /// The task.
        task: TaskView,
        /// Why it ended.
        reason: TerminalReason,
        /// Final counters, reason included.
        snapshot: StatsSnapshot,
    },
}

/// Forwards events into an unbounded channel. Front ends that push updates
/// (chat bots, websockets) drain the receiving half.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ReportEvent>,
}

impl ChannelReporter {
    /// A reporter and the receiver its events arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ReportEvent) -> Result<(), ReportError> {
        self.tx
            .send(event)
            .map_err(|_| ReportError("receiver dropped".to_string()))
    }
}

#[async_trait]
impl StatsReporter for ChannelReporter {
    async fn on_cycle(&self, task: &TaskView, snapshot: &StatsSnapshot) -> Result<(), ReportError> {
        self.send(ReportEvent::Cycle {
            task: task.clone(),
            snapshot: snapshot.clone(),
        })
    }

    async fn on_terminal(
        &self,
        task: &TaskView,
        reason: &TerminalReason,
        snapshot: &StatsSnapshot,
    ) -> Result<(), ReportError> {
        self.send(ReportEvent::Terminal {
            task: task.clone(),
            reason: reason.clone(),
            snapshot: snapshot.clone(),
        })
    }
}
