use std::future::Future;
use std::str::FromStr as _;
use std::time::Duration;

use bitcoin::{Address, ScriptBuf};
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::sink::{LogMessage, LogSink, MessageKind, deliver};
use super::store::JobStore;
use super::{ExchangeSwap, FailureKind, JobFailure, SwapJob, SwapSizing, SwapState};
use crate::chain::htlc::{self, ScriptTemplate, SwapScript};
use crate::chain::keys::{SecretDeriver, SwapSecret};
use crate::config::SwapConfig;
use crate::error::{RemoteError, RemoteResult, StoreError, SwapError};
use crate::exchange::{
    CreateSwapRequest, CreatedSwap, ExchangeClient, ExchangeSwapStatus, SwapDirection,
    SwapStatusResponse,
};
use crate::lightning::invoice::decode_bolt11;
use crate::lightning::{CreateInvoice, NodeAdapter, PayInvoice};

const CURRENCY: &str = "BTC";

/// Why a step stopped before reaching its next state.
enum Halt {
    /// The node or the exchange refused, or returned something we cannot
    /// accept. The job fails.
    Reject(String),
    /// Transient errors outlasted the retry policy. The job fails.
    Exhausted(String),
    /// The orchestration budget ran out. The job stays resumable.
    Suspend,
    /// Storage errors and cancellation. Returned to the caller as is.
    Abort(SwapError),
}

impl From<SwapError> for Halt {
    fn from(err: SwapError) -> Self {
        Self::Abort(err)
    }
}

impl From<StoreError> for Halt {
    fn from(err: StoreError) -> Self {
        Self::Abort(err.into())
    }
}

fn reject(context: &str) -> impl FnOnce(anyhow::Error) -> Halt + '_ {
    move |e| Halt::Reject(format!("{context}: {e:#}"))
}

type Step = Result<(), Halt>;

/// Drives one job from its persisted state towards a terminal one.
pub(crate) struct SwapMachine<'a> {
    store: &'a JobStore,
    node: &'a dyn NodeAdapter,
    exchange: &'a dyn ExchangeClient,
    deriver: &'a SecretDeriver,
    config: &'a SwapConfig,
    sink: &'a dyn LogSink,
    cancel: &'a CancellationToken,
    deadline: Option<Instant>,
}

impl<'a> SwapMachine<'a> {
    pub(crate) fn new(
        store: &'a JobStore,
        node: &'a dyn NodeAdapter,
        exchange: &'a dyn ExchangeClient,
        deriver: &'a SecretDeriver,
        config: &'a SwapConfig,
        sink: &'a dyn LogSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            node,
            exchange,
            deriver,
            config,
            sink,
            cancel,
            deadline: config.orchestration_budget.map(|b| Instant::now() + b),
        }
    }

    /// Returns the job once it is terminal, or earlier in a non-terminal
    /// state when the orchestration budget runs out.
    pub(crate) async fn run(&self, mut job: SwapJob) -> Result<SwapJob, SwapError> {
        while !job.state.is_terminal() {
            let step = match self.checkpoint(&job) {
                Err(halt) => Err(halt),
                Ok(()) => match job.state {
                    SwapState::Created => self.compute_liquidity(&mut job).await,
                    SwapState::LiquidityComputed => self.request_swap(&mut job).await,
                    SwapState::SwapRequested => self.fund_swap(&mut job).await,
                    SwapState::SwapPending => self.await_claimable(&mut job).await,
                    SwapState::SwapClaimable => self.complete(&mut job).await,
                    SwapState::Success | SwapState::Failed | SwapState::Refunded => break,
                },
            };

            match step {
                Ok(()) => {}
                Err(Halt::Reject(reason)) => {
                    self.fail(&mut job, FailureKind::ProtocolRejection, reason)?
                }
                Err(Halt::Exhausted(reason)) => {
                    self.fail(&mut job, FailureKind::RetryBudgetExhausted, reason)?
                }
                Err(Halt::Suspend) => {
                    self.emit(
                        &job,
                        MessageKind::Info,
                        "orchestration budget exhausted, job left resumable",
                    );
                    return Ok(job);
                }
                Err(Halt::Abort(err)) => return Err(err),
            }
        }
        Ok(job)
    }

    fn checkpoint(&self, job: &SwapJob) -> Step {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled(job));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Halt::Suspend);
        }
        Ok(())
    }

    fn cancelled(&self, job: &SwapJob) -> Halt {
        Halt::Abort(SwapError::Cancelled {
            job_id: job.job_id,
            state: job.state,
        })
    }

    /// Persists `job` in state `next`. Nothing else in the machine writes
    /// to the store.
    fn commit(&self, job: &mut SwapJob, next: SwapState) -> Result<(), SwapError> {
        let prev = job.state;
        if !prev.can_advance_to(next) {
            return Err(SwapError::IllegalTransition {
                job_id: job.job_id,
                from: prev,
                to: next,
            });
        }

        job.state = next;
        job.updated_at = Utc::now();
        if let Err(err) = self.store.update(job) {
            job.state = prev;
            return Err(err.into());
        }
        if prev != next {
            tracing::debug!(job_id = %job.job_id, from = %prev, to = %next, "transition persisted");
        }
        Ok(())
    }

    fn fail(&self, job: &mut SwapJob, kind: FailureKind, reason: String) -> Result<(), SwapError> {
        job.failure = Some(JobFailure { kind, reason });
        self.commit(job, SwapState::Failed)?;
        self.emit_terminal(job, None);
        Ok(())
    }

    fn emit(&self, job: &SwapJob, kind: MessageKind, message: impl Into<String>) {
        deliver(
            self.sink,
            LogMessage::new(job.job_id, job.state, kind, message.into()),
        );
    }

    fn emit_terminal(&self, job: &SwapJob, detail: Option<&str>) {
        deliver(self.sink, terminal_message(job, detail));
    }

    async fn sleep(&self, job: &SwapJob, delay: Duration) -> Step {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.cancelled(job)),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn timed<T>(
        &self,
        what: &str,
        call: impl Future<Output = RemoteResult<T>>,
    ) -> RemoteResult<T> {
        tokio::time::timeout(self.config.call_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(RemoteError::transient(format!(
                    "{what} timed out after {:?}",
                    self.config.call_timeout
                )))
            })
    }

    async fn retry<T, F, Fut>(&self, job: &SwapJob, what: &str, mut call: F) -> Result<T, Halt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut backoff = self.config.retry.backoff();
        let mut attempt = 1;
        loop {
            match self.timed(what, call()).await {
                Ok(v) => return Ok(v),
                Err(RemoteError::Rejected(reason)) => {
                    return Err(Halt::Reject(format!("{what}: {reason}")));
                }
                Err(RemoteError::Transient(reason)) => {
                    if attempt >= max_attempts {
                        return Err(Halt::Exhausted(format!(
                            "{what} failed {attempt} times, last error: {reason}"
                        )));
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        job_id = %job.job_id,
                        state = %job.state,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "{what} failed, retrying"
                    );
                    self.sleep(job, delay).await?;
                    attempt += 1;
                }
            }
        }
    }

    fn secret(&self, job: &SwapJob) -> Result<SwapSecret, SwapError> {
        self.deriver
            .derive(job.derived_key_index)
            .map_err(|e| SwapError::Key(format!("{e:#}")))
    }

    fn direction(job: &SwapJob) -> Result<SwapDirection, Halt> {
        job.direction
            .ok_or_else(|| Halt::Reject(format!("job in {} has no swap direction", job.state)))
    }

    fn exchange_swap(job: &SwapJob) -> Result<ExchangeSwap, Halt> {
        job.exchange_swap
            .clone()
            .ok_or_else(|| Halt::Reject(format!("job in {} has no exchange swap", job.state)))
    }

    fn destination(&self, address: &str) -> Result<Address, Halt> {
        Address::from_str(address)
            .map_err(|e| Halt::Reject(format!("node address {address}: {e}")))?
            .require_network(self.config.network)
            .map_err(|e| Halt::Reject(format!("node address {address}: {e}")))
    }

    async fn compute_liquidity(&self, job: &mut SwapJob) -> Step {
        let info = self
            .retry(job, "get node info", || self.node.get_info())
            .await?;
        let balance = self
            .retry(job, "get channel balance", || self.node.channel_balance())
            .await?;

        let plan = job.target.plan(&balance);
        tracing::debug!(
            job_id = %job.job_id,
            capacity_sats = plan.capacity_sats,
            current_sats = plan.current_sats,
            target_sats = plan.target_sats,
            "liquidity computed"
        );

        let (amount, shortfall) =
            match plan.sizing(self.config.min_swap_sats, self.config.max_swap_sats) {
                SwapSizing::Satisfied => {
                    job.amount_sats = 0;
                    self.commit(job, SwapState::Success)?;
                    self.emit_terminal(job, None);
                    return Ok(());
                }
                SwapSizing::BelowMinimum { deficit } => {
                    return Err(Halt::Reject(format!(
                        "deficit of {deficit} sats is below the minimum swap of {} sats",
                        self.config.min_swap_sats
                    )));
                }
                SwapSizing::Exact(amount) => (amount, 0),
                SwapSizing::Capped { amount, shortfall } => (amount, shortfall),
            };
        job.direction = Some(plan.direction);
        job.amount_sats = amount;

        if plan.direction == SwapDirection::Submarine {
            let funds = self
                .retry(job, "get on-chain funds", || self.node.get_onchain_funds())
                .await?;
            if funds.confirmed_balance_sats < amount {
                return Err(Halt::Reject(format!(
                    "confirmed on-chain balance of {} sats cannot fund a {amount} sats swap",
                    funds.confirmed_balance_sats
                )));
            }
        }

        self.commit(job, SwapState::LiquidityComputed)?;
        let mut text = format!(
            "node {} needs a {} swap of {amount} sats (current {} of {} sats capacity, target {})",
            info.alias, plan.direction, plan.current_sats, plan.capacity_sats, plan.target_sats
        );
        if shortfall > 0 {
            text.push_str(&format!(
                "; capped at the exchange maximum, target stays {shortfall} sats short"
            ));
        }
        self.emit(job, MessageKind::Info, text);
        Ok(())
    }

    async fn request_swap(&self, job: &mut SwapJob) -> Step {
        let direction = Self::direction(job)?;
        let secret = self.secret(job)?;
        // Fetched before create_swap so a failed call leaves no unrecorded swap.
        let height = self
            .retry(job, "get node info", || self.node.get_info())
            .await?
            .block_height;

        let swap = match direction {
            SwapDirection::Reverse => self.request_reverse(job, &secret, height).await?,
            SwapDirection::Submarine => self.request_submarine(job, &secret, height).await?,
        };
        let swap_id = swap.swap_id.clone();
        job.exchange_swap = Some(swap);

        self.commit(job, SwapState::SwapRequested)?;
        self.emit(
            job,
            MessageKind::Info,
            format!(
                "exchange accepted {direction} swap {swap_id} for {} sats",
                job.amount_sats
            ),
        );
        Ok(())
    }

    async fn request_reverse(
        &self,
        job: &SwapJob,
        secret: &SwapSecret,
        height: u32,
    ) -> Result<ExchangeSwap, Halt> {
        let amount = job.amount_sats;
        let preimage_hash = secret.preimage_hash();
        let req = CreateSwapRequest::Reverse {
            pair_id: self.config.pair_id.clone(),
            invoice_amount_sats: amount,
            preimage_hash,
            claim_public_key: secret.public_key(),
        };
        let created = self
            .retry(job, "create reverse swap", || self.exchange.create_swap(req.clone()))
            .await?;

        let invoice = created
            .invoice
            .clone()
            .ok_or_else(|| Halt::Reject("exchange returned no invoice for a reverse swap".into()))?;
        let decoded = decode_bolt11(&invoice).map_err(reject("exchange invoice"))?;
        if decoded.payment_hash != preimage_hash {
            return Err(Halt::Reject(format!(
                "exchange invoice of swap {} does not commit to our preimage",
                created.id
            )));
        }
        if decoded.amount_sats() != Some(amount) {
            return Err(Halt::Reject(format!(
                "exchange invoice asks {:?} sats, expected {amount}",
                decoded.amount_sats()
            )));
        }
        if created.onchain_amount_sats == 0 || created.onchain_amount_sats > amount {
            return Err(Halt::Reject(format!(
                "exchange would lock {} sats for a {amount} sats invoice",
                created.onchain_amount_sats
            )));
        }

        self.verify_script(&created, ScriptTemplate::Reverse, secret, &preimage_hash)?;
        Ok(self.exchange_swap_record(created, invoice, height))
    }

    async fn request_submarine(
        &self,
        job: &SwapJob,
        secret: &SwapSecret,
        height: u32,
    ) -> Result<ExchangeSwap, Halt> {
        let amount = job.amount_sats;
        let invoice_req = CreateInvoice {
            amount_sats: amount,
            memo: format!("liquidity swap job {}", job.job_id),
            description_hash: None,
            expiry: Duration::from_secs(u64::from(self.config.invoice_expiry_secs)),
        };
        let invoice = self
            .retry(job, "create invoice", || {
                self.node.create_invoice(invoice_req.clone())
            })
            .await?;
        let decoded = decode_bolt11(&invoice.payment_request).map_err(reject("node invoice"))?;

        let req = CreateSwapRequest::Submarine {
            pair_id: self.config.pair_id.clone(),
            invoice: invoice.payment_request.clone(),
            refund_public_key: secret.public_key(),
        };
        let created = self
            .retry(job, "create submarine swap", || {
                self.exchange.create_swap(req.clone())
            })
            .await?;

        if created.onchain_amount_sats < amount {
            return Err(Halt::Reject(format!(
                "exchange expects {} sats on-chain for a {amount} sats invoice",
                created.onchain_amount_sats
            )));
        }
        self.verify_script(
            &created,
            ScriptTemplate::Submarine,
            secret,
            &decoded.payment_hash,
        )?;
        Ok(self.exchange_swap_record(created, invoice.payment_request, height))
    }

    /// Checks the quoted lockup script against the swap we asked for.
    fn verify_script(
        &self,
        created: &CreatedSwap,
        template: ScriptTemplate,
        secret: &SwapSecret,
        payment_hash: &[u8; 32],
    ) -> Result<SwapScript, Halt> {
        let bytes = hex::decode(&created.redeem_script_hex)
            .map_err(|e| Halt::Reject(format!("redeem script of swap {}: {e}", created.id)))?;
        let script =
            SwapScript::parse(&ScriptBuf::from_bytes(bytes)).map_err(reject("redeem script"))?;

        let our_key = match template {
            ScriptTemplate::Reverse => script.claim_pubkey,
            ScriptTemplate::Submarine => script.refund_pubkey,
        };
        let problem = if script.template != template {
            Some(format!("expected {template:?} script, got {:?}", script.template))
        } else if our_key != secret.public_key() {
            Some("script does not pay to our key".to_string())
        } else if script.hash_lock != htlc::hash_lock(payment_hash) {
            Some("script locks on a different payment hash".to_string())
        } else if script.timeout_block_height != created.timeout_block_height {
            Some(format!(
                "script timeout {} differs from quoted {}",
                script.timeout_block_height, created.timeout_block_height
            ))
        } else if script.p2wsh_address(self.config.network).to_string() != created.lockup_address
        {
            Some(format!(
                "lockup address {} does not match the script",
                created.lockup_address
            ))
        } else {
            None
        };

        match problem {
            Some(p) => Err(Halt::Reject(format!("swap {}: {p}", created.id))),
            None => Ok(script),
        }
    }

    /// `expires_at` is an estimate for display; expiry itself is judged on
    /// block height.
    fn exchange_swap_record(
        &self,
        created: CreatedSwap,
        invoice: String,
        height: u32,
    ) -> ExchangeSwap {
        let blocks = created.timeout_block_height.saturating_sub(height);
        let wait = self.config.block_interval.saturating_mul(blocks);
        let expires_at = chrono::TimeDelta::from_std(wait)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        ExchangeSwap {
            swap_id: created.id,
            invoice,
            lockup_address: created.lockup_address,
            redeem_script_hex: created.redeem_script_hex,
            onchain_amount_sats: created.onchain_amount_sats,
            timeout_block_height: created.timeout_block_height,
            expires_at,
        }
    }

    async fn swap_status(&self, job: &SwapJob, swap_id: &str) -> Result<SwapStatusResponse, Halt> {
        self.retry(job, "get swap status", || self.exchange.get_swap_status(swap_id))
            .await
    }

    async fn fund_swap(&self, job: &mut SwapJob) -> Step {
        let direction = Self::direction(job)?;
        let swap = Self::exchange_swap(job)?;

        let status = self.swap_status(job, &swap.swap_id).await?.status;
        if status.is_funded(direction) {
            self.commit(job, SwapState::SwapPending)?;
            self.emit(
                job,
                MessageKind::Info,
                format!("swap {} already funded ({status})", swap.swap_id),
            );
            return Ok(());
        }
        if status.is_expired() || status.is_failed() {
            // Expiry handling lives in the pending phase.
            self.commit(job, SwapState::SwapPending)?;
            return Ok(());
        }

        match direction {
            SwapDirection::Reverse => self.pay_exchange_invoice(job, &swap).await,
            SwapDirection::Submarine => self.send_lockup(job, &swap).await,
        }
    }

    async fn pay_exchange_invoice(&self, job: &mut SwapJob, swap: &ExchangeSwap) -> Step {
        let req = PayInvoice {
            invoice: swap.invoice.clone(),
            fee_limit_sats: self.config.max_routing_fee_sats,
        };

        let payment_id = match self
            .retry(job, "pay swap invoice", || self.node.pay_invoice(req.clone()))
            .await
        {
            Ok(payment) => Some(payment.payment_id),
            // A retried payment may be refused as a duplicate of the first.
            Err(Halt::Reject(reason)) => {
                let status = self.swap_status(job, &swap.swap_id).await?.status;
                if !status.is_funded(SwapDirection::Reverse) {
                    return Err(Halt::Reject(reason));
                }
                None
            }
            Err(other) => return Err(other),
        };

        job.payment_id = payment_id;
        self.commit(job, SwapState::SwapPending)?;
        self.emit(
            job,
            MessageKind::Info,
            format!("paying invoice of swap {}", swap.swap_id),
        );
        Ok(())
    }

    async fn send_lockup(&self, job: &mut SwapJob, swap: &ExchangeSwap) -> Step {
        if job.funding_attempted_at.is_some() {
            self.commit(job, SwapState::SwapPending)?;
            self.emit(
                job,
                MessageKind::Info,
                "on-chain send was attempted before, waiting on the exchange instead",
            );
            return Ok(());
        }

        job.funding_attempted_at = Some(Utc::now());
        self.commit(job, SwapState::SwapRequested)?;

        let amount = swap.onchain_amount_sats;
        match self
            .timed(
                "send lockup",
                self.node.send_to_address(&swap.lockup_address, amount),
            )
            .await
        {
            Ok(txid) => {
                job.lockup_txid = Some(txid.clone());
                self.commit(job, SwapState::SwapPending)?;
                self.emit(
                    job,
                    MessageKind::Info,
                    format!("sent {amount} sats to {} in {txid}", swap.lockup_address),
                );
            }
            Err(RemoteError::Rejected(reason)) => {
                return Err(Halt::Reject(format!("send lockup: {reason}")));
            }
            Err(RemoteError::Transient(reason)) => {
                self.commit(job, SwapState::SwapPending)?;
                self.emit(
                    job,
                    MessageKind::Error,
                    format!("on-chain send outcome unknown ({reason}), not sending again"),
                );
            }
        }
        Ok(())
    }

    async fn await_claimable(&self, job: &mut SwapJob) -> Step {
        let direction = Self::direction(job)?;
        let swap = Self::exchange_swap(job)?;
        let mut last_status: Option<ExchangeSwapStatus> = None;

        loop {
            self.checkpoint(job)?;

            // A claimable status wins over an elapsed timeout.
            match self
                .timed("get swap status", self.exchange.get_swap_status(&swap.swap_id))
                .await
            {
                Ok(resp) => {
                    if last_status.as_ref() != Some(&resp.status) {
                        self.emit(
                            job,
                            MessageKind::Info,
                            format!("swap {} is {}", swap.swap_id, resp.status),
                        );
                        last_status = Some(resp.status.clone());
                    }
                    if resp
                        .status
                        .is_claimable(direction, self.config.accept_zero_conf)
                    {
                        return self.mark_claimable(job, &swap, direction, resp).await;
                    }
                    if resp.status.is_expired() || resp.status.is_failed() {
                        let reason = match resp.failure_reason {
                            Some(r) => format!("exchange reported {}: {r}", resp.status),
                            None => format!("exchange reported {}", resp.status),
                        };
                        return self.refund(job, &swap, direction, reason).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        job_id = %job.job_id,
                        swap_id = %swap.swap_id,
                        error = %err,
                        "swap status poll failed"
                    );
                }
            }

            if let Some(reason) = self.expiry_reason(job, &swap).await {
                return self.refund(job, &swap, direction, reason).await;
            }
            self.sleep(job, self.config.poll_interval).await?;
        }
    }

    async fn expiry_reason(&self, job: &SwapJob, swap: &ExchangeSwap) -> Option<String> {
        match self.timed("get node info", self.node.get_info()).await {
            Ok(info) if info.block_height >= swap.timeout_block_height => Some(format!(
                "block height {} reached the swap timeout {}",
                info.block_height, swap.timeout_block_height
            )),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(job_id = %job.job_id, error = %err, "block height poll failed");
                None
            }
        }
    }

    async fn mark_claimable(
        &self,
        job: &mut SwapJob,
        swap: &ExchangeSwap,
        direction: SwapDirection,
        resp: SwapStatusResponse,
    ) -> Step {
        if direction == SwapDirection::Submarine {
            self.commit(job, SwapState::SwapClaimable)?;
            self.emit(
                job,
                MessageKind::Info,
                format!("exchange paid our invoice ({})", resp.status),
            );
            return Ok(());
        }

        let tx_hex = match resp.transaction.and_then(|t| t.hex) {
            Some(hex) => hex,
            None => {
                self.retry(job, "get lockup transaction", || {
                    self.exchange.get_swap_transaction(&swap.swap_id)
                })
                .await?
                .transaction_hex
            }
        };
        let tx = htlc::tx_from_hex(&tx_hex).map_err(reject("lockup transaction"))?;
        let script = redeem_script(swap)?;
        let output =
            htlc::find_htlc_output(&tx, &script).map_err(reject("lockup transaction"))?;
        if output.value.to_sat() < swap.onchain_amount_sats {
            return Err(Halt::Reject(format!(
                "lockup pays {} sats, {} were agreed",
                output.value.to_sat(),
                swap.onchain_amount_sats
            )));
        }

        let txid = tx.compute_txid().to_string();
        job.lockup_txid = Some(txid.clone());
        job.lockup_tx_hex = Some(tx_hex);
        self.commit(job, SwapState::SwapClaimable)?;
        self.emit(
            job,
            MessageKind::Info,
            format!("exchange locked {} sats in {txid}", output.value.to_sat()),
        );
        Ok(())
    }

    async fn refund(
        &self,
        job: &mut SwapJob,
        swap: &ExchangeSwap,
        direction: SwapDirection,
        reason: String,
    ) -> Step {
        match direction {
            SwapDirection::Reverse => {
                self.commit(job, SwapState::Refunded)?;
                self.emit_terminal(
                    job,
                    Some(&format!(
                        "{reason}; the exchange cancels its hold invoice, nothing to refund on-chain"
                    )),
                );
                Ok(())
            }
            SwapDirection::Submarine => self.refund_lockup(job, swap, reason).await,
        }
    }

    async fn refund_lockup(&self, job: &mut SwapJob, swap: &ExchangeSwap, reason: String) -> Step {
        if job.refund_tx_hex.is_none() {
            let tx_hex = match self
                .retry(job, "get lockup transaction", || {
                    self.exchange.get_swap_transaction(&swap.swap_id)
                })
                .await
            {
                Ok(t) => t.transaction_hex,
                Err(Halt::Reject(detail)) => {
                    self.commit(job, SwapState::Refunded)?;
                    self.emit_terminal(
                        job,
                        Some(&format!("{reason}; no lockup transaction exists ({detail})")),
                    );
                    return Ok(());
                }
                Err(other) => return Err(other),
            };

            self.emit(
                job,
                MessageKind::Info,
                format!(
                    "{reason}; refunding once block {} is reached",
                    swap.timeout_block_height
                ),
            );
            loop {
                if let Some(resp) = self.claimable_status(job, swap).await {
                    return self
                        .mark_claimable(job, swap, SwapDirection::Submarine, resp)
                        .await;
                }
                let info = self
                    .retry(job, "get node info", || self.node.get_info())
                    .await?;
                if info.block_height >= swap.timeout_block_height {
                    break;
                }
                self.checkpoint(job)?;
                self.sleep(job, self.config.poll_interval).await?;
            }

            let lockup = htlc::tx_from_hex(&tx_hex).map_err(reject("lockup transaction"))?;
            let script = redeem_script(swap)?;
            let output =
                htlc::find_htlc_output(&lockup, &script).map_err(reject("lockup transaction"))?;
            let address = self
                .retry(job, "get refund address", || self.node.new_address())
                .await?;
            let destination = self.destination(&address)?;
            let secret = self.secret(job)?;
            let refund = htlc::refund_tx(
                &script,
                swap.timeout_block_height,
                &output,
                &destination,
                secret.secret_key(),
                self.config.sweep_fee_sats,
            )
            .map_err(reject("build refund"))?;

            job.lockup_txid = Some(lockup.compute_txid().to_string());
            job.lockup_tx_hex = Some(tx_hex);
            job.refund_txid = Some(refund.compute_txid().to_string());
            job.refund_tx_hex = Some(htlc::tx_to_hex(&refund));
            self.commit(job, SwapState::SwapPending)?;
        }

        let Some(refund_hex) = job.refund_tx_hex.clone() else {
            return Err(Halt::Reject("refund transaction missing".into()));
        };
        if let Some(resp) = self.claimable_status(job, swap).await {
            return self
                .mark_claimable(job, swap, SwapDirection::Submarine, resp)
                .await;
        }
        let detail = match self
            .retry(job, "broadcast refund", || {
                self.exchange.broadcast_transaction(CURRENCY, &refund_hex)
            })
            .await
        {
            Ok(txid) => format!("{reason}; refund broadcast in {txid}"),
            Err(Halt::Reject(err) | Halt::Exhausted(err)) => {
                self.emit(
                    job,
                    MessageKind::Error,
                    format!(
                        "refund broadcast failed ({err}), the signed refund is {refund_hex} \
                         and key index {} can re-sign it",
                        job.derived_key_index
                    ),
                );
                format!("{reason}; refund not broadcast")
            }
            Err(other) => return Err(other),
        };

        self.commit(job, SwapState::Refunded)?;
        self.emit_terminal(job, Some(&detail));
        Ok(())
    }

    /// One status poll of a submarine swap; `Some` when the exchange has
    /// paid our invoice. A failed poll counts as not claimable.
    async fn claimable_status(
        &self,
        job: &SwapJob,
        swap: &ExchangeSwap,
    ) -> Option<SwapStatusResponse> {
        match self
            .timed("get swap status", self.exchange.get_swap_status(&swap.swap_id))
            .await
        {
            Ok(resp)
                if resp
                    .status
                    .is_claimable(SwapDirection::Submarine, self.config.accept_zero_conf) =>
            {
                self.emit(
                    job,
                    MessageKind::Info,
                    format!("swap {} is {}, refund abandoned", swap.swap_id, resp.status),
                );
                Some(resp)
            }
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(job_id = %job.job_id, error = %err, "swap status poll failed");
                None
            }
        }
    }

    async fn complete(&self, job: &mut SwapJob) -> Step {
        match Self::direction(job)? {
            SwapDirection::Submarine => {
                self.commit(job, SwapState::Success)?;
                self.emit_terminal(job, None);
                Ok(())
            }
            SwapDirection::Reverse => self.claim(job).await,
        }
    }

    async fn claim(&self, job: &mut SwapJob) -> Step {
        let swap = Self::exchange_swap(job)?;

        if job.claim_tx_hex.is_none() {
            let Some(lockup_hex) = job.lockup_tx_hex.clone() else {
                return Err(Halt::Reject("no lockup transaction recorded".into()));
            };
            let lockup = htlc::tx_from_hex(&lockup_hex).map_err(reject("lockup transaction"))?;
            let script = redeem_script(&swap)?;
            let output =
                htlc::find_htlc_output(&lockup, &script).map_err(reject("lockup transaction"))?;
            let address = self
                .retry(job, "get claim address", || self.node.new_address())
                .await?;
            let destination = self.destination(&address)?;
            let secret = self.secret(job)?;
            let claim = htlc::claim_tx(
                &script,
                &output,
                &destination,
                secret.secret_key(),
                secret.preimage(),
                self.config.sweep_fee_sats,
            )
            .map_err(reject("build claim"))?;

            job.claim_txid = Some(claim.compute_txid().to_string());
            job.claim_tx_hex = Some(htlc::tx_to_hex(&claim));
            self.commit(job, SwapState::SwapClaimable)?;
        }

        let Some(claim_hex) = job.claim_tx_hex.clone() else {
            return Err(Halt::Reject("claim transaction missing".into()));
        };
        match self
            .retry(job, "broadcast claim", || {
                self.exchange.broadcast_transaction(CURRENCY, &claim_hex)
            })
            .await
        {
            Ok(txid) => self.emit(job, MessageKind::Info, format!("claim broadcast in {txid}")),
            // Rebroadcast after a restart: the network may already know it.
            Err(Halt::Reject(reason)) => {
                let status = self.swap_status(job, &swap.swap_id).await?.status;
                if !is_settled(&status) {
                    return Err(Halt::Reject(reason));
                }
            }
            Err(other) => return Err(other),
        }

        self.await_settlement(job, &swap).await?;
        self.commit(job, SwapState::Success)?;
        self.emit_terminal(job, None);
        Ok(())
    }

    async fn await_settlement(&self, job: &SwapJob, swap: &ExchangeSwap) -> Step {
        let deadline = Instant::now() + self.config.claim_confirmation_timeout;
        loop {
            match self
                .timed("get swap status", self.exchange.get_swap_status(&swap.swap_id))
                .await
            {
                Ok(resp) if is_settled(&resp.status) => return Ok(()),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(job_id = %job.job_id, error = %err, "swap status poll failed")
                }
            }
            if Instant::now() >= deadline {
                self.emit(
                    job,
                    MessageKind::Info,
                    format!(
                        "exchange did not report settlement within {:?}, the claim is broadcast",
                        self.config.claim_confirmation_timeout
                    ),
                );
                return Ok(());
            }
            self.checkpoint(job)?;
            self.sleep(job, self.config.poll_interval).await?;
        }
    }
}

fn is_settled(status: &ExchangeSwapStatus) -> bool {
    matches!(
        status,
        ExchangeSwapStatus::InvoiceSettled | ExchangeSwapStatus::TransactionClaimed
    )
}

fn redeem_script(swap: &ExchangeSwap) -> Result<ScriptBuf, Halt> {
    hex::decode(&swap.redeem_script_hex)
        .map(ScriptBuf::from_bytes)
        .map_err(|e| Halt::Reject(format!("redeem script of swap {}: {e}", swap.swap_id)))
}

/// The message reporting how a job ended.
pub(crate) fn terminal_message(job: &SwapJob, detail: Option<&str>) -> LogMessage {
    let id = job.job_id;
    let (kind, text) = match job.state {
        SwapState::Success if job.amount_sats == 0 => (
            MessageKind::Success,
            format!("Swap {id} succeeded: liquidity target already met"),
        ),
        SwapState::Success => (
            MessageKind::Success,
            format!(
                "Swap {id} succeeded: {} sats through {} swap {}",
                job.amount_sats,
                job.direction.map(|d| d.to_string()).unwrap_or_default(),
                job.swap_id().unwrap_or_default()
            ),
        ),
        SwapState::Failed => (
            MessageKind::Error,
            match &job.failure {
                Some(f) => format!("Swap {id} failed ({}): {}", f.kind, f.reason),
                None => format!("Swap {id} failed"),
            },
        ),
        SwapState::Refunded => (MessageKind::Error, format!("Swap {id} refunded")),
        other => (MessageKind::Info, format!("Swap {id} is {other}")),
    };
    let text = match detail {
        Some(d) => format!("{text}: {d}"),
        None => text,
    };
    LogMessage::new(id, job.state, kind, text)
}
