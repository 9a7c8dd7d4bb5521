pub mod engine;
pub mod machine;
pub mod sink;
pub mod store;
pub mod target;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exchange::SwapDirection;
pub use target::{LiquidityTarget, SwapSizing, TargetStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for JobId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Created,
    LiquidityComputed,
    SwapRequested,
    SwapPending,
    SwapClaimable,
    Success,
    Failed,
    Refunded,
}

impl SwapState {
    pub const TERMINAL: [SwapState; 3] = [Self::Success, Self::Failed, Self::Refunded];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::LiquidityComputed => "liquidity_computed",
            Self::SwapRequested => "swap_requested",
            Self::SwapPending => "swap_pending",
            Self::SwapClaimable => "swap_claimable",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Staying in a non-terminal state is allowed so that artifacts can be
    /// persisted between external calls. `Failed` is reachable from every
    /// non-terminal state.
    pub fn can_advance_to(self, next: SwapState) -> bool {
        use SwapState::*;

        if self.is_terminal() {
            return false;
        }
        if next == self || next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Created, LiquidityComputed)
                | (Created, Success)
                | (LiquidityComputed, SwapRequested)
                | (SwapRequested, SwapPending)
                | (SwapPending, SwapClaimable)
                | (SwapPending, Refunded)
                | (SwapClaimable, Success)
        )
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "created" => Self::Created,
            "liquidity_computed" => Self::LiquidityComputed,
            "swap_requested" => Self::SwapRequested,
            "swap_pending" => Self::SwapPending,
            "swap_claimable" => Self::SwapClaimable,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "refunded" => Self::Refunded,
            other => anyhow::bail!("unknown swap state: {other}"),
        })
    }
}

/// What the exchange agreed to when the swap was created. Written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSwap {
    pub swap_id: String,
    /// Reverse: the exchange's hold invoice we pay. Submarine: our invoice.
    pub invoice: String,
    pub lockup_address: String,
    pub redeem_script_hex: String,
    pub onchain_amount_sats: u64,
    pub timeout_block_height: u32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ProtocolRejection,
    RetryBudgetExhausted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ProtocolRejection => "protocol rejection",
            Self::RetryBudgetExhausted => "retry budget exhausted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapJob {
    pub job_id: JobId,
    pub target: LiquidityTarget,
    pub state: SwapState,
    pub direction: Option<SwapDirection>,
    pub amount_sats: u64,
    pub derived_key_index: u32,

    pub exchange_swap: Option<ExchangeSwap>,

    /// Set right before the on-chain send of a submarine swap.
    pub funding_attempted_at: Option<DateTime<Utc>>,
    pub payment_id: Option<String>,
    pub lockup_txid: Option<String>,
    pub lockup_tx_hex: Option<String>,
    pub claim_txid: Option<String>,
    pub claim_tx_hex: Option<String>,
    pub refund_txid: Option<String>,
    pub refund_tx_hex: Option<String>,

    pub failure: Option<JobFailure>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SwapJob {
    pub fn new(job_id: JobId, target: LiquidityTarget) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            target,
            state: SwapState::Created,
            direction: None,
            amount_sats: 0,
            derived_key_index: job_id.0,
            exchange_swap: None,
            funding_attempted_at: None,
            payment_id: None,
            lockup_txid: None,
            lockup_tx_hex: None,
            claim_txid: None,
            claim_tx_hex: None,
            refund_txid: None,
            refund_tx_hex: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn swap_id(&self) -> Option<&str> {
        self.exchange_swap.as_ref().map(|s| s.swap_id.as_str())
    }
}

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub state: SwapState,
    pub direction: Option<SwapDirection>,
    pub amount_sats: u64,
    pub swap_id: Option<String>,
    pub failure: Option<JobFailure>,
    /// The job was already finished before this call; nothing was executed.
    pub already_terminal: bool,
}

impl JobOutcome {
    pub fn from_job(job: &SwapJob, already_terminal: bool) -> Self {
        Self {
            job_id: job.job_id,
            state: job.state,
            direction: job.direction,
            amount_sats: job.amount_sats,
            swap_id: job.swap_id().map(str::to_string),
            failure: job.failure.clone(),
            already_terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_advance() {
        for terminal in SwapState::TERMINAL {
            for next in [
                SwapState::Created,
                SwapState::SwapPending,
                SwapState::Success,
                SwapState::Failed,
                terminal,
            ] {
                assert!(!terminal.can_advance_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn forward_edges_only() {
        use SwapState::*;

        assert!(Created.can_advance_to(LiquidityComputed));
        assert!(Created.can_advance_to(Success));
        assert!(SwapPending.can_advance_to(Refunded));
        assert!(SwapRequested.can_advance_to(Failed));
        assert!(SwapClaimable.can_advance_to(SwapClaimable));

        assert!(!SwapPending.can_advance_to(SwapRequested));
        assert!(!LiquidityComputed.can_advance_to(SwapPending));
        assert!(!SwapClaimable.can_advance_to(Refunded));
    }

    #[test]
    fn state_names_parse_back() {
        for state in [
            SwapState::Created,
            SwapState::LiquidityComputed,
            SwapState::SwapRequested,
            SwapState::SwapPending,
            SwapState::SwapClaimable,
            SwapState::Success,
            SwapState::Failed,
            SwapState::Refunded,
        ] {
            assert_eq!(state.as_str().parse::<SwapState>().unwrap(), state);
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                serde_json::Value::String(state.as_str().to_string())
            );
        }
        assert!("done".parse::<SwapState>().is_err());
    }
}
