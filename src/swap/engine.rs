use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::machine::{SwapMachine, terminal_message};
use super::sink::{LogMessage, LogSink, MessageKind, deliver};
use super::store::JobStore;
use super::{JobId, JobOutcome, LiquidityTarget, SwapJob};
use crate::chain::keys::{MasterSeed, SecretDeriver};
use crate::config::SwapConfig;
use crate::error::SwapError;
use crate::exchange::ExchangeClient;
use crate::lightning::NodeAdapter;

/// Entry point for swap jobs. Clones share one store and one set of per-job
/// locks.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<JobStore>,
    node: Arc<dyn NodeAdapter>,
    exchange: Arc<dyn ExchangeClient>,
    deriver: SecretDeriver,
    config: SwapConfig,
    locks: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
}

/// A caller's share of a per-job lock. The last one out removes the entry.
struct LockLease<'a> {
    locks: &'a Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
    job_id: JobId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.job_id);
        }
    }
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<JobStore>,
        node: Arc<dyn NodeAdapter>,
        exchange: Arc<dyn ExchangeClient>,
        seed: &MasterSeed,
        config: SwapConfig,
    ) -> Result<Self, SwapError> {
        config
            .validate()
            .map_err(|e| SwapError::InvalidArgument(format!("{e:#}")))?;
        let deriver = SecretDeriver::new(seed).map_err(|e| SwapError::Key(format!("{e:#}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                node,
                exchange,
                deriver,
                config,
                locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &SwapConfig {
        &self.inner.config
    }

    /// Number of jobs currently running or waiting for their lock.
    pub fn jobs_in_flight(&self) -> usize {
        self.inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn execute(
        &self,
        job_id: JobId,
        target: &[u8],
        sink: &dyn LogSink,
    ) -> Result<JobOutcome, SwapError> {
        self.execute_with_cancel(job_id, target, sink, CancellationToken::new())
            .await
    }

    /// Starts or resumes `job_id`.
    ///
    /// A job that already exists is resumed from its persisted state and
    /// `target` is ignored, so an empty target is fine for resumption. A
    /// finished job is reported as is. Concurrent calls for the same id are
    /// serialized; the later one observes whatever the earlier one persisted.
    pub async fn execute_with_cancel(
        &self,
        job_id: JobId,
        target: &[u8],
        sink: &dyn LogSink,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, SwapError> {
        let lease = self.job_lock(job_id);
        let _guard = lease.lock.lock().await;

        let job = match self.inner.store.get(job_id)? {
            Some(job) if job.state.is_terminal() => {
                deliver(sink, terminal_message(&job, None));
                return Ok(JobOutcome::from_job(&job, true));
            }
            Some(job) => {
                deliver(
                    sink,
                    LogMessage::new(
                        job_id,
                        job.state,
                        MessageKind::Info,
                        format!("resuming swap job {job_id} in state {}", job.state),
                    ),
                );
                job
            }
            None => {
                let target = LiquidityTarget::parse(target)?;
                let job = SwapJob::new(job_id, target);
                self.inner.store.insert(&job)?;
                deliver(
                    sink,
                    LogMessage::new(
                        job_id,
                        job.state,
                        MessageKind::Info,
                        format!(
                            "accepted swap job {job_id}: {:?} {}%",
                            target.strategy, target.percentage
                        ),
                    ),
                );
                job
            }
        };

        let machine = SwapMachine::new(
            &self.inner.store,
            self.inner.node.as_ref(),
            self.inner.exchange.as_ref(),
            &self.inner.deriver,
            &self.inner.config,
            sink,
            &cancel,
        );
        let job = machine.run(job).await?;
        Ok(JobOutcome::from_job(&job, false))
    }

    /// Spawns one task per job the store holds in a non-terminal state.
    pub fn resume_unfinished(
        &self,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Result<Vec<(JobId, JoinHandle<Result<JobOutcome, SwapError>>)>, SwapError> {
        let jobs = self.inner.store.list_unfinished()?;
        tracing::info!(count = jobs.len(), "resuming unfinished swap jobs");

        Ok(jobs
            .into_iter()
            .map(|job| {
                let engine = self.clone();
                let sink = Arc::clone(&sink);
                let cancel = cancel.child_token();
                let job_id = job.job_id;
                let handle = tokio::spawn(async move {
                    engine
                        .execute_with_cancel(job_id, &[], sink.as_ref(), cancel)
                        .await
                });
                (job_id, handle)
            })
            .collect())
    }

    fn job_lock(&self, job_id: JobId) -> LockLease<'_> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        LockLease {
            locks: &self.inner.locks,
            job_id,
            lock: Arc::clone(locks.entry(job_id).or_default()),
        }
    }
}
