pub mod channel_id;
pub mod cln;
pub mod invoice;
pub mod ldk;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteResult;
use channel_id::NodeFeature;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub alias: String,
    pub pubkey: String,
    pub block_height: u32,
    pub features: BTreeMap<u32, NodeFeature>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainFunds {
    pub confirmed_balance_sats: u64,
    pub unconfirmed_balance_sats: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLiquidity {
    pub channel_id: String,
    pub short_channel_id: Option<u64>,
    pub local_sats: u64,
    pub remote_sats: u64,
    pub active: bool,
}

/// Aggregate channel balance of the node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBalance {
    pub local_sats: u64,
    pub remote_sats: u64,
    pub channels: Vec<ChannelLiquidity>,
}

impl ChannelBalance {
    pub fn from_channels(channels: Vec<ChannelLiquidity>) -> Self {
        let (local_sats, remote_sats) = channels
            .iter()
            .filter(|c| c.active)
            .fold((0u64, 0u64), |(l, r), c| {
                (l.saturating_add(c.local_sats), r.saturating_add(c.remote_sats))
            });
        Self {
            local_sats,
            remote_sats,
            channels,
        }
    }

    pub fn capacity_sats(&self) -> u64 {
        self.local_sats.saturating_add(self.remote_sats)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInvoice {
    pub amount_sats: u64,
    pub memo: String,
    pub description_hash: Option<[u8; 32]>,
    pub expiry: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub payment_request: String,
    pub payment_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayInvoice {
    pub invoice: String,
    /// Routing fee cap for the whole payment; the node default when unset.
    pub fee_limit_sats: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentResult {
    pub payment_id: String,
    pub preimage: Option<String>,
}

/// Normalized operations over a Lightning node, whatever software runs it.
#[async_trait]
pub trait NodeAdapter: Send + Sync {
    async fn get_info(&self) -> RemoteResult<NodeInfo>;

    async fn get_onchain_funds(&self) -> RemoteResult<OnChainFunds>;

    async fn channel_balance(&self) -> RemoteResult<ChannelBalance>;

    async fn create_invoice(&self, req: CreateInvoice) -> RemoteResult<Invoice>;

    /// Initiates the payment. Hold invoices stay pending, so this must not
    /// wait for settlement.
    async fn pay_invoice(&self, req: PayInvoice) -> RemoteResult<PaymentResult>;

    async fn new_address(&self) -> RemoteResult<String>;

    async fn send_to_address(&self, address: &str, amount_sats: u64) -> RemoteResult<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum NodeBackend {
    Ldk,
    Cln,
}
