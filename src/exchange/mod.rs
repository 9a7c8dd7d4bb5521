pub mod boltz;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::error::RemoteResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapDirection {
    /// Chain to Lightning: we lock coins on-chain, the exchange pays our
    /// invoice. Moves balance out of the node's wallet into its channels.
    Submarine,
    /// Lightning to chain: we pay the exchange's hold invoice, it locks coins
    /// on-chain for us to claim. Frees inbound capacity.
    Reverse,
}

impl fmt::Display for SwapDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Submarine => "submarine",
            Self::Reverse => "reverse",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateSwapRequest {
    Submarine {
        pair_id: String,
        invoice: String,
        refund_public_key: PublicKey,
    },
    Reverse {
        pair_id: String,
        invoice_amount_sats: u64,
        preimage_hash: [u8; 32],
        claim_public_key: PublicKey,
    },
}

impl CreateSwapRequest {
    pub fn direction(&self) -> SwapDirection {
        match self {
            Self::Submarine { .. } => SwapDirection::Submarine,
            Self::Reverse { .. } => SwapDirection::Reverse,
        }
    }
}

/// Exchange answer to a swap creation, normalized over both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSwap {
    pub id: String,
    /// Hold invoice to pay (reverse swaps only).
    pub invoice: Option<String>,
    /// P2WSH address the lockup transaction pays to.
    pub lockup_address: String,
    pub redeem_script_hex: String,
    /// Submarine: amount we have to send. Reverse: amount the exchange locks.
    pub onchain_amount_sats: u64,
    pub timeout_block_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ExchangeSwapStatus {
    SwapCreated,
    InvoiceSet,
    InvoicePending,
    InvoicePaid,
    InvoiceSettled,
    InvoiceExpired,
    InvoiceFailedToPay,
    TransactionMempool,
    TransactionConfirmed,
    TransactionClaimed,
    TransactionRefunded,
    TransactionFailed,
    TransactionLockupFailed,
    MinerFeePaid,
    SwapExpired,
    Unknown(String),
}

impl ExchangeSwapStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::SwapCreated => "swap.created",
            Self::InvoiceSet => "invoice.set",
            Self::InvoicePending => "invoice.pending",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoiceSettled => "invoice.settled",
            Self::InvoiceExpired => "invoice.expired",
            Self::InvoiceFailedToPay => "invoice.failedToPay",
            Self::TransactionMempool => "transaction.mempool",
            Self::TransactionConfirmed => "transaction.confirmed",
            Self::TransactionClaimed => "transaction.claimed",
            Self::TransactionRefunded => "transaction.refunded",
            Self::TransactionFailed => "transaction.failed",
            Self::TransactionLockupFailed => "transaction.lockupFailed",
            Self::MinerFeePaid => "minerfee.paid",
            Self::SwapExpired => "swap.expired",
            Self::Unknown(s) => s,
        }
    }

    /// The swap timed out or its invoice did. Nothing more will happen
    /// forward, funds locked by us have to be refunded.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::SwapExpired | Self::InvoiceExpired)
    }

    /// The exchange gave up on the swap.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::InvoiceFailedToPay
                | Self::TransactionFailed
                | Self::TransactionLockupFailed
                | Self::TransactionRefunded
        )
    }

    /// Whether our side of the swap has visibly been funded.
    pub fn is_funded(&self, direction: SwapDirection) -> bool {
        match direction {
            SwapDirection::Reverse => matches!(
                self,
                Self::MinerFeePaid
                    | Self::InvoicePending
                    | Self::InvoicePaid
                    | Self::InvoiceSettled
                    | Self::TransactionMempool
                    | Self::TransactionConfirmed
                    | Self::TransactionClaimed
            ),
            SwapDirection::Submarine => matches!(
                self,
                Self::TransactionMempool
                    | Self::TransactionConfirmed
                    | Self::InvoicePending
                    | Self::InvoicePaid
                    | Self::TransactionClaimed
            ),
        }
    }

    /// Whether the swap reached the point where we can complete it.
    pub fn is_claimable(&self, direction: SwapDirection, accept_zero_conf: bool) -> bool {
        match direction {
            SwapDirection::Reverse => {
                matches!(self, Self::TransactionConfirmed)
                    || (accept_zero_conf && matches!(self, Self::TransactionMempool))
            }
            SwapDirection::Submarine => {
                matches!(self, Self::InvoicePaid | Self::TransactionClaimed)
            }
        }
    }
}

impl fmt::Display for ExchangeSwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ExchangeSwapStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "swap.created" => Self::SwapCreated,
            "invoice.set" => Self::InvoiceSet,
            "invoice.pending" => Self::InvoicePending,
            "invoice.paid" => Self::InvoicePaid,
            "invoice.settled" => Self::InvoiceSettled,
            "invoice.expired" => Self::InvoiceExpired,
            "invoice.failedToPay" => Self::InvoiceFailedToPay,
            "transaction.mempool" => Self::TransactionMempool,
            "transaction.confirmed" => Self::TransactionConfirmed,
            "transaction.claimed" => Self::TransactionClaimed,
            "transaction.refunded" => Self::TransactionRefunded,
            "transaction.failed" => Self::TransactionFailed,
            "transaction.lockupFailed" => Self::TransactionLockupFailed,
            "minerfee.paid" => Self::MinerFeePaid,
            "swap.expired" => Self::SwapExpired,
            _ => Self::Unknown(s),
        }
    }
}

impl From<ExchangeSwapStatus> for String {
    fn from(s: ExchangeSwapStatus) -> Self {
        s.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransaction {
    pub id: String,
    pub hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapStatusResponse {
    pub status: ExchangeSwapStatus,
    pub transaction: Option<StatusTransaction>,
    pub failure_reason: Option<String>,
}

impl SwapStatusResponse {
    pub fn new(status: ExchangeSwapStatus) -> Self {
        Self {
            status,
            transaction: None,
            failure_reason: None,
        }
    }
}

/// Lockup transaction of a swap as known to the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapTransaction {
    pub transaction_hex: String,
    pub timeout_block_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeNode {
    pub node_key: String,
    pub uris: Vec<String>,
}

/// Lightning nodes of the exchange, keyed by currency symbol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodesInfo {
    pub nodes: BTreeMap<String, ExchangeNode>,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_nodes(&self) -> RemoteResult<NodesInfo>;

    async fn create_swap(&self, req: CreateSwapRequest) -> RemoteResult<CreatedSwap>;

    async fn get_swap_status(&self, swap_id: &str) -> RemoteResult<SwapStatusResponse>;

    async fn get_swap_transaction(&self, swap_id: &str) -> RemoteResult<SwapTransaction>;

    /// Returns the txid.
    async fn broadcast_transaction(&self, currency: &str, tx_hex: &str) -> RemoteResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip_and_unknown_is_kept() {
        for raw in [
            "swap.created",
            "invoice.failedToPay",
            "transaction.lockupFailed",
            "minerfee.paid",
        ] {
            assert_eq!(ExchangeSwapStatus::from(raw.to_string()).as_str(), raw);
        }
        assert_eq!(
            ExchangeSwapStatus::from("channel.created".to_string()),
            ExchangeSwapStatus::Unknown("channel.created".to_string())
        );

        let parsed: SwapStatusResponse =
            serde_json::from_str(r#"{"status":"invoice.paid","transaction":null,"failure_reason":null}"#)
                .unwrap();
        assert_eq!(parsed.status, ExchangeSwapStatus::InvoicePaid);
    }

    #[test]
    fn claimable_depends_on_direction_and_zero_conf() {
        use ExchangeSwapStatus::*;

        assert!(TransactionConfirmed.is_claimable(SwapDirection::Reverse, false));
        assert!(!TransactionMempool.is_claimable(SwapDirection::Reverse, false));
        assert!(TransactionMempool.is_claimable(SwapDirection::Reverse, true));
        assert!(!InvoicePaid.is_claimable(SwapDirection::Reverse, true));

        assert!(InvoicePaid.is_claimable(SwapDirection::Submarine, false));
        assert!(TransactionClaimed.is_claimable(SwapDirection::Submarine, false));
        assert!(!TransactionConfirmed.is_claimable(SwapDirection::Submarine, true));
    }

    #[test]
    fn funding_is_observed_per_direction() {
        use ExchangeSwapStatus::*;

        assert!(!SwapCreated.is_funded(SwapDirection::Reverse));
        assert!(MinerFeePaid.is_funded(SwapDirection::Reverse));
        assert!(!InvoiceSet.is_funded(SwapDirection::Submarine));
        assert!(TransactionMempool.is_funded(SwapDirection::Submarine));

        assert!(SwapExpired.is_expired());
        assert!(TransactionLockupFailed.is_failed());
        assert!(!InvoicePaid.is_failed());
    }
}
