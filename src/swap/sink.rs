use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, SwapState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Info,
    Success,
    Error,
}

/// Progress report of a job, delivered to the caller while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub state: SwapState,
    pub message: String,
}

impl LogMessage {
    pub fn new(job_id: JobId, state: SwapState, kind: MessageKind, message: String) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            kind,
            state,
            message,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }
}

/// Receiver of job progress. Delivery failures are logged and otherwise
/// ignored; they never change the job.
pub trait LogSink: Send + Sync {
    fn log(&self, msg: LogMessage) -> anyhow::Result<()>;
}

impl<F> LogSink for F
where
    F: Fn(LogMessage) -> anyhow::Result<()> + Send + Sync,
{
    fn log(&self, msg: LogMessage) -> anyhow::Result<()> {
        self(msg)
    }
}

/// Drops every message. Progress still reaches `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _msg: LogMessage) -> anyhow::Result<()> {
        Ok(())
    }
}

pub(crate) fn deliver(sink: &dyn LogSink, msg: LogMessage) {
    match msg.kind {
        MessageKind::Error => {
            tracing::warn!(job_id = %msg.job_id, state = %msg.state, "{}", msg.message)
        }
        MessageKind::Info | MessageKind::Success => {
            tracing::info!(job_id = %msg.job_id, state = %msg.state, "{}", msg.message)
        }
    }

    let job_id = msg.job_id;
    if let Err(err) = sink.log(msg) {
        tracing::warn!(job_id = %job_id, error = %format!("{err:#}"), "log sink rejected message");
    }
}
