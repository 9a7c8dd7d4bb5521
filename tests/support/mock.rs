use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, CompressedPublicKey, Network, OutPoint, Transaction, TxIn, TxOut, Txid};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};

use ln_liquidity_swap::chain::htlc::{self, ScriptTemplate, SwapScript};
use ln_liquidity_swap::config::SwapConfig;
use ln_liquidity_swap::error::{RemoteError, RemoteResult};
use ln_liquidity_swap::exchange::{
    CreateSwapRequest, CreatedSwap, ExchangeClient, ExchangeNode, ExchangeSwapStatus, NodesInfo,
    StatusTransaction, SwapDirection, SwapStatusResponse, SwapTransaction,
};
use ln_liquidity_swap::lightning::invoice::decode_bolt11;
use ln_liquidity_swap::lightning::{
    ChannelBalance, ChannelLiquidity, CreateInvoice, Invoice, NodeAdapter, NodeInfo,
    OnChainFunds, PayInvoice, PaymentResult,
};
use ln_liquidity_swap::retry::RetryPolicy;
use ln_liquidity_swap::swap::sink::{LogMessage, LogSink};

pub const NETWORK: Network = Network::Regtest;
pub const START_HEIGHT: u32 = 800;
pub const TIMEOUT_DELTA: u32 = 144;
/// Exchange fee taken from (reverse) or added to (submarine) the swap amount.
pub const FEE_PERCENT: u64 = 1;

/// Config with intervals short enough for tests.
pub fn test_config() -> SwapConfig {
    SwapConfig {
        network: NETWORK,
        min_swap_sats: 50_000,
        max_swap_sats: 5_000_000,
        poll_interval: Duration::from_millis(10),
        call_timeout: Duration::from_secs(2),
        claim_confirmation_timeout: Duration::from_millis(200),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        ..SwapConfig::default()
    }
}

fn key(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).expect("valid key")
}

fn pubkey(sk: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(&Secp256k1::new(), sk)
}

fn bolt11(node_key: &SecretKey, payment_hash: [u8; 32], amount_sats: u64) -> String {
    let secp = Secp256k1::new();
    InvoiceBuilder::new(Currency::Regtest)
        .description("liquidity swap".to_string())
        .payment_hash(sha256::Hash::from_byte_array(payment_hash))
        .payment_secret(PaymentSecret([42u8; 32]))
        .current_timestamp()
        .min_final_cltv_expiry_delta(144)
        .amount_milli_satoshis(amount_sats * 1000)
        .build_signed(|msg| secp.sign_ecdsa_recoverable(msg, node_key))
        .expect("build invoice")
        .to_string()
}

fn lockup_tx(script: &SwapScript, amount_sats: u64, seq: u8) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([seq; 32]),
                vout: 0,
            },
            ..Default::default()
        }],
        output: vec![TxOut {
            value: Amount::from_sat(amount_sats),
            script_pubkey: script.p2wsh_address(NETWORK).script_pubkey(),
        }],
    }
}

#[derive(Debug, Clone)]
pub struct MockSwap {
    pub id: String,
    pub direction: SwapDirection,
    pub script: SwapScript,
    pub payment_hash: [u8; 32],
    pub invoice: String,
    pub onchain_amount_sats: u64,
    pub lockup: Option<Transaction>,
    pub paid: bool,
    pub claimed: bool,
}

#[derive(Debug, Clone)]
pub struct Broadcast {
    pub swap_id: Option<String>,
    pub tx: Transaction,
}

#[derive(Debug)]
pub struct World {
    pub block_height: u32,
    pub local_sats: u64,
    pub remote_sats: u64,
    pub onchain_confirmed_sats: u64,

    pub swaps: BTreeMap<String, MockSwap>,
    pub broadcasts: Vec<Broadcast>,
    pub payments: Vec<String>,
    pub sends: Vec<(String, u64)>,

    /// Status reported for every swap regardless of progress.
    pub forced_status: Option<ExchangeSwapStatus>,
    /// Reverse swaps stop at `invoice.pending`, submarine swaps at
    /// `transaction.mempool`: the swap never becomes claimable.
    pub hold: bool,
    /// Clears `hold` when this method is next called.
    pub release_hold_on: Option<&'static str>,
    pub failures: HashMap<&'static str, VecDeque<RemoteError>>,
    pub calls: HashMap<&'static str, usize>,
    next_seq: u8,
}

/// Lightning node and swap exchange sharing one simulated world, so that
/// paying the exchange invoice or funding the lockup address shows up in the
/// exchange's swap status.
#[derive(Clone)]
pub struct MockWorld {
    pub world: Arc<Mutex<World>>,
    node_key: SecretKey,
    exchange_key: SecretKey,
}

impl MockWorld {
    pub fn new(local_sats: u64, remote_sats: u64) -> Self {
        Self {
            world: Arc::new(Mutex::new(World {
                block_height: START_HEIGHT,
                local_sats,
                remote_sats,
                onchain_confirmed_sats: 10_000_000,
                swaps: BTreeMap::new(),
                broadcasts: Vec::new(),
                payments: Vec::new(),
                sends: Vec::new(),
                forced_status: None,
                hold: false,
                release_hold_on: None,
                failures: HashMap::new(),
                calls: HashMap::new(),
                next_seq: 1,
            })),
            node_key: key(0x11),
            exchange_key: key(0x22),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut World) -> R) -> R {
        f(&mut self.world.lock().expect("world lock"))
    }

    /// Makes the next `times` calls of `method` fail with `err`.
    pub fn fail(&self, method: &'static str, err: RemoteError, times: usize) {
        self.with(|w| {
            let q = w.failures.entry(method).or_default();
            for _ in 0..times {
                q.push_back(err.clone());
            }
        })
    }

    pub fn calls(&self, method: &str) -> usize {
        self.with(|w| w.calls.get(method).copied().unwrap_or(0))
    }

    pub fn set_block_height(&self, height: u32) {
        self.with(|w| w.block_height = height)
    }

    pub fn only_swap(&self) -> MockSwap {
        self.with(|w| {
            assert_eq!(w.swaps.len(), 1, "expected exactly one swap");
            w.swaps.values().next().cloned().expect("one swap")
        })
    }

    fn enter(&self, method: &'static str) -> RemoteResult<()> {
        self.with(|w| {
            *w.calls.entry(method).or_default() += 1;
            if w.release_hold_on == Some(method) {
                w.hold = false;
                w.release_hold_on = None;
            }
            match w.failures.get_mut(method).and_then(|q| q.pop_front()) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn status_of(w: &World, swap: &MockSwap) -> SwapStatusResponse {
        if let Some(forced) = &w.forced_status {
            return SwapStatusResponse::new(forced.clone());
        }
        let status = match swap.direction {
            SwapDirection::Reverse if swap.claimed => ExchangeSwapStatus::InvoiceSettled,
            SwapDirection::Reverse if swap.paid && w.hold => ExchangeSwapStatus::InvoicePending,
            SwapDirection::Reverse if swap.paid => ExchangeSwapStatus::TransactionConfirmed,
            SwapDirection::Reverse => ExchangeSwapStatus::SwapCreated,
            SwapDirection::Submarine if swap.lockup.is_some() && w.hold => {
                ExchangeSwapStatus::TransactionMempool
            }
            SwapDirection::Submarine if swap.lockup.is_some() => ExchangeSwapStatus::InvoicePaid,
            SwapDirection::Submarine => ExchangeSwapStatus::InvoiceSet,
        };
        let transaction = match (&swap.lockup, &status) {
            (Some(tx), ExchangeSwapStatus::TransactionConfirmed) => Some(StatusTransaction {
                id: tx.compute_txid().to_string(),
                hex: Some(htlc::tx_to_hex(tx)),
            }),
            _ => None,
        };
        SwapStatusResponse {
            status,
            transaction,
            failure_reason: None,
        }
    }
}

#[async_trait]
impl NodeAdapter for MockWorld {
    async fn get_info(&self) -> RemoteResult<NodeInfo> {
        self.enter("get_info")?;
        Ok(NodeInfo {
            alias: "mock-node".to_string(),
            pubkey: hex::encode(pubkey(&self.node_key).serialize()),
            block_height: self.with(|w| w.block_height),
            features: BTreeMap::new(),
        })
    }

    async fn get_onchain_funds(&self) -> RemoteResult<OnChainFunds> {
        self.enter("get_onchain_funds")?;
        Ok(OnChainFunds {
            confirmed_balance_sats: self.with(|w| w.onchain_confirmed_sats),
            unconfirmed_balance_sats: 0,
        })
    }

    async fn channel_balance(&self) -> RemoteResult<ChannelBalance> {
        self.enter("channel_balance")?;
        let (local_sats, remote_sats) = self.with(|w| (w.local_sats, w.remote_sats));
        Ok(ChannelBalance::from_channels(vec![ChannelLiquidity {
            channel_id: "chan-1".to_string(),
            short_channel_id: Some(128_642_860_515_328),
            local_sats,
            remote_sats,
            active: true,
        }]))
    }

    async fn create_invoice(&self, req: CreateInvoice) -> RemoteResult<Invoice> {
        self.enter("create_invoice")?;
        let seq = self.with(|w| {
            w.next_seq += 1;
            w.next_seq
        });
        let payment_hash = sha256::Hash::hash(&[seq; 32]).to_byte_array();
        Ok(Invoice {
            payment_request: bolt11(&self.node_key, payment_hash, req.amount_sats),
            payment_hash: hex::encode(payment_hash),
        })
    }

    async fn pay_invoice(&self, req: PayInvoice) -> RemoteResult<PaymentResult> {
        self.enter("pay_invoice")?;
        let decoded = decode_bolt11(&req.invoice).map_err(RemoteError::rejected)?;
        self.with(|w| -> RemoteResult<PaymentResult> {
            let seq = w.next_seq;
            w.next_seq += 1;
            let swap = w
                .swaps
                .values_mut()
                .find(|s| s.payment_hash == decoded.payment_hash)
                .ok_or_else(|| RemoteError::rejected("no route to invoice"))?;
            swap.paid = true;
            swap.lockup = Some(lockup_tx(&swap.script, swap.onchain_amount_sats, seq));
            w.payments.push(req.invoice.clone());
            Ok(PaymentResult {
                payment_id: hex::encode(decoded.payment_hash),
                preimage: None,
            })
        })
    }

    async fn new_address(&self) -> RemoteResult<String> {
        self.enter("new_address")?;
        let pk = CompressedPublicKey(pubkey(&self.node_key));
        Ok(Address::p2wpkh(&pk, NETWORK).to_string())
    }

    async fn send_to_address(&self, address: &str, amount_sats: u64) -> RemoteResult<String> {
        self.enter("send_to_address")?;
        self.with(|w| -> RemoteResult<String> {
            let seq = w.next_seq;
            w.next_seq += 1;
            w.sends.push((address.to_string(), amount_sats));
            let swap = w
                .swaps
                .values_mut()
                .find(|s| s.script.p2wsh_address(NETWORK).to_string() == address)
                .ok_or_else(|| RemoteError::rejected("unknown address"))?;
            let tx = lockup_tx(&swap.script, amount_sats, seq);
            let txid = tx.compute_txid().to_string();
            swap.lockup = Some(tx);
            Ok(txid)
        })
    }
}

#[async_trait]
impl ExchangeClient for MockWorld {
    async fn get_nodes(&self) -> RemoteResult<NodesInfo> {
        self.enter("get_nodes")?;
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "BTC".to_string(),
            ExchangeNode {
                node_key: hex::encode(pubkey(&self.exchange_key).serialize()),
                uris: vec!["127.0.0.1:9735".to_string()],
            },
        );
        Ok(NodesInfo { nodes })
    }

    async fn create_swap(&self, req: CreateSwapRequest) -> RemoteResult<CreatedSwap> {
        self.enter("create_swap")?;
        let exchange_pk = pubkey(&self.exchange_key);

        self.with(|w| -> RemoteResult<CreatedSwap> {
            let id = format!("swap-{}", w.swaps.len() + 1);
            let timeout_block_height = w.block_height + TIMEOUT_DELTA;

            let swap = match req {
                CreateSwapRequest::Reverse {
                    invoice_amount_sats,
                    preimage_hash,
                    claim_public_key,
                    ..
                } => {
                    if w.swaps.values().any(|s| s.payment_hash == preimage_hash) {
                        return Err(RemoteError::rejected("duplicate preimage hash"));
                    }
                    MockSwap {
                        id: id.clone(),
                        direction: SwapDirection::Reverse,
                        script: SwapScript {
                            template: ScriptTemplate::Reverse,
                            hash_lock: htlc::hash_lock(&preimage_hash),
                            claim_pubkey: claim_public_key,
                            refund_pubkey: exchange_pk,
                            timeout_block_height,
                        },
                        payment_hash: preimage_hash,
                        invoice: bolt11(&self.exchange_key, preimage_hash, invoice_amount_sats),
                        onchain_amount_sats: invoice_amount_sats * (100 - FEE_PERCENT) / 100,
                        lockup: None,
                        paid: false,
                        claimed: false,
                    }
                }
                CreateSwapRequest::Submarine {
                    invoice,
                    refund_public_key,
                    ..
                } => {
                    let decoded = decode_bolt11(&invoice).map_err(RemoteError::rejected)?;
                    let amount = decoded.amount_sats().unwrap_or_default();
                    MockSwap {
                        id: id.clone(),
                        direction: SwapDirection::Submarine,
                        script: SwapScript {
                            template: ScriptTemplate::Submarine,
                            hash_lock: htlc::hash_lock(&decoded.payment_hash),
                            claim_pubkey: exchange_pk,
                            refund_pubkey: refund_public_key,
                            timeout_block_height,
                        },
                        payment_hash: decoded.payment_hash,
                        invoice,
                        onchain_amount_sats: amount * (100 + FEE_PERCENT) / 100,
                        lockup: None,
                        paid: false,
                        claimed: false,
                    }
                }
            };

            let created = CreatedSwap {
                id: id.clone(),
                invoice: (swap.direction == SwapDirection::Reverse).then(|| swap.invoice.clone()),
                lockup_address: swap.script.p2wsh_address(NETWORK).to_string(),
                redeem_script_hex: hex::encode(swap.script.witness_script().as_bytes()),
                onchain_amount_sats: swap.onchain_amount_sats,
                timeout_block_height,
            };
            w.swaps.insert(id, swap);
            Ok(created)
        })
    }

    async fn get_swap_status(&self, swap_id: &str) -> RemoteResult<SwapStatusResponse> {
        self.enter("get_swap_status")?;
        self.with(|w| -> RemoteResult<SwapStatusResponse> {
            let w: &World = w;
            let swap = w
                .swaps
                .get(swap_id)
                .ok_or_else(|| RemoteError::rejected("could not find swap"))?;
            Ok(Self::status_of(w, swap))
        })
    }

    async fn get_swap_transaction(&self, swap_id: &str) -> RemoteResult<SwapTransaction> {
        self.enter("get_swap_transaction")?;
        self.with(|w| -> RemoteResult<SwapTransaction> {
            let swap = w
                .swaps
                .get(swap_id)
                .ok_or_else(|| RemoteError::rejected("could not find swap"))?;
            let tx = swap
                .lockup
                .as_ref()
                .ok_or_else(|| RemoteError::rejected("no lockup transaction"))?;
            Ok(SwapTransaction {
                transaction_hex: htlc::tx_to_hex(tx),
                timeout_block_height: Some(swap.script.timeout_block_height),
            })
        })
    }

    async fn broadcast_transaction(&self, currency: &str, tx_hex: &str) -> RemoteResult<String> {
        self.enter("broadcast_transaction")?;
        assert_eq!(currency, "BTC");
        let tx = htlc::tx_from_hex(tx_hex).map_err(RemoteError::rejected)?;

        self.with(|w| -> RemoteResult<String> {
            let spent = tx.input[0].previous_output;
            let swap = w.swaps.values_mut().find(|s| {
                s.lockup
                    .as_ref()
                    .is_some_and(|l| l.compute_txid() == spent.txid)
            });

            let swap_id = match swap {
                Some(swap) => {
                    let witness = &tx.input[0].witness;
                    let preimage = witness.nth(1).unwrap_or_default();
                    if preimage.len() == 32 {
                        assert_eq!(
                            sha256::Hash::hash(preimage).to_byte_array(),
                            swap.payment_hash,
                            "claim reveals the wrong preimage"
                        );
                        swap.claimed = true;
                    } else if w.block_height < swap.script.timeout_block_height {
                        return Err(RemoteError::rejected("non-final transaction"));
                    }
                    Some(swap.id.clone())
                }
                None => None,
            };

            w.broadcasts.push(Broadcast {
                swap_id,
                tx: tx.clone(),
            });
            Ok(tx.compute_txid().to_string())
        })
    }
}

/// Collects every sink message.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub messages: Arc<Mutex<Vec<LogMessage>>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<LogMessage> {
        self.messages.lock().expect("sink lock").clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.message).collect()
    }
}

impl LogSink for RecordingSink {
    fn log(&self, msg: LogMessage) -> anyhow::Result<()> {
        self.messages.lock().expect("sink lock").push(msg);
        Ok(())
    }
}
