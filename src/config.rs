use std::time::Duration;

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::retry::{RetryPolicy, duration_millis};

/// Knobs of the swap state machine and the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    pub network: Network,
    pub pair_id: String,

    pub min_swap_sats: u64,
    pub max_swap_sats: u64,

    /// Flat fee deducted from the HTLC output by claim and refund transactions.
    pub sweep_fee_sats: u64,
    pub invoice_expiry_secs: u32,
    pub max_routing_fee_sats: Option<u64>,
    pub accept_zero_conf: bool,

    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    #[serde(with = "duration_millis")]
    pub call_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub claim_confirmation_timeout: Duration,
    /// Used to turn the quoted timeout height into a wall clock deadline.
    #[serde(with = "duration_millis")]
    pub block_interval: Duration,
    #[serde(with = "option_duration_millis")]
    pub orchestration_budget: Option<Duration>,

    pub retry: RetryPolicy,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            pair_id: "BTC/BTC".to_string(),
            min_swap_sats: 50_000,
            max_swap_sats: 10_000_000,
            sweep_fee_sats: 1_000,
            invoice_expiry_secs: 3600,
            max_routing_fee_sats: None,
            accept_zero_conf: false,
            poll_interval: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            claim_confirmation_timeout: Duration::from_secs(600),
            block_interval: Duration::from_secs(600),
            orchestration_budget: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl SwapConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.min_swap_sats <= self.max_swap_sats,
            "min_swap_sats must be <= max_swap_sats"
        );
        anyhow::ensure!(self.max_swap_sats > 0, "max_swap_sats must be > 0");
        anyhow::ensure!(
            self.retry.max_attempts > 0,
            "retry.max_attempts must be > 0"
        );
        anyhow::ensure!(!self.poll_interval.is_zero(), "poll_interval must be > 0");
        Ok(())
    }
}

mod option_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
