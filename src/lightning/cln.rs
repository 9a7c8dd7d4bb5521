use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::UnixStream;

use super::channel_id::{decode_features, parse_msat, to_short_channel_id};
use super::invoice::payment_hash_from_bolt11;
use super::{
    ChannelBalance, ChannelLiquidity, CreateInvoice, Invoice, NodeAdapter, NodeInfo,
    OnChainFunds, PayInvoice, PaymentResult,
};
use crate::error::{RemoteError, RemoteResult};

/// `pay` only returns once the payment resolves, which for a hold invoice is
/// after the swap completes. Failures that show up within this window are
/// reported, anything slower keeps running in the background.
const PAY_GRACE: Duration = Duration::from_secs(3);

/// Core Lightning over its JSON-RPC unix socket (`lightning-rpc`).
#[derive(Clone)]
pub struct ClnSocketClient {
    socket_path: PathBuf,
    next_id: Arc<AtomicU64>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl ClnSocketClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn call(&self, method: &str, params: Value) -> RemoteResult<Value> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            RemoteError::transient(format!("connect {}: {e}", self.socket_path.display()))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let bytes = serde_json::to_vec(&request)
            .map_err(|e| RemoteError::rejected(format!("{method}: encode request: {e}")))?;
        stream
            .write_all(&bytes)
            .await
            .map_err(|e| RemoteError::transient(format!("{method}: write: {e}")))?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        let response: RpcResponse = loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| RemoteError::transient(format!("{method}: read: {e}")))?;
            if n == 0 {
                return Err(RemoteError::transient(format!(
                    "{method}: connection closed before response"
                )));
            }
            buf.extend_from_slice(&chunk[..n]);
            match serde_json::from_slice(&buf) {
                Ok(resp) => break resp,
                Err(e) if e.is_eof() => continue,
                Err(e) => {
                    return Err(RemoteError::transient(format!(
                        "{method}: decode response: {e}"
                    )));
                }
            }
        };

        if let Some(err) = response.error {
            return Err(RemoteError::Rejected(format!(
                "{method}: {} (code {})",
                err.message, err.code
            )));
        }
        response
            .result
            .ok_or_else(|| RemoteError::transient(format!("{method}: empty result")))
    }
}

fn parse_info(v: &Value) -> Result<NodeInfo> {
    let pubkey = v["id"].as_str().context("getinfo: missing id")?.to_string();
    let block_height = v["blockheight"]
        .as_u64()
        .and_then(|h| u32::try_from(h).ok())
        .context("getinfo: missing blockheight")?;
    let features = match v["our_features"]["node"].as_str() {
        Some(bits) => decode_features(bits).context("getinfo: decode node features")?,
        None => Default::default(),
    };

    Ok(NodeInfo {
        alias: v["alias"].as_str().unwrap_or(&pubkey).to_string(),
        pubkey,
        block_height,
        features,
    })
}

fn parse_funds(v: &Value) -> Result<(OnChainFunds, ChannelBalance)> {
    let mut funds = OnChainFunds::default();
    for output in v["outputs"].as_array().context("listfunds: missing outputs")? {
        let sats = parse_msat(&output["amount_msat"]).context("listfunds: output amount")? / 1000;
        match output["status"].as_str() {
            Some("confirmed") => funds.confirmed_balance_sats += sats,
            Some("unconfirmed") => funds.unconfirmed_balance_sats += sats,
            _ => {}
        }
    }

    let mut channels = Vec::new();
    for c in v["channels"].as_array().context("listfunds: missing channels")? {
        let total_msat = parse_msat(&c["amount_msat"]).context("listfunds: channel amount")?;
        let ours_msat = parse_msat(&c["our_amount_msat"]).context("listfunds: our amount")?;
        let short_channel_id = match c["short_channel_id"].as_str() {
            Some(id) => Some(to_short_channel_id(id)?),
            None => None,
        };
        channels.push(ChannelLiquidity {
            channel_id: c["channel_id"]
                .as_str()
                .or(c["short_channel_id"].as_str())
                .unwrap_or_default()
                .to_string(),
            short_channel_id,
            local_sats: ours_msat / 1000,
            remote_sats: total_msat.saturating_sub(ours_msat) / 1000,
            active: c["state"].as_str() == Some("CHANNELD_NORMAL"),
        });
    }

    Ok((funds, ChannelBalance::from_channels(channels)))
}

fn rejected_parse(method: &str) -> impl FnOnce(anyhow::Error) -> RemoteError + '_ {
    move |e| RemoteError::Rejected(format!("{method}: {e:#}"))
}

#[async_trait]
impl NodeAdapter for ClnSocketClient {
    async fn get_info(&self) -> RemoteResult<NodeInfo> {
        let v = self.call("getinfo", json!({})).await?;
        parse_info(&v).map_err(rejected_parse("getinfo"))
    }

    async fn get_onchain_funds(&self) -> RemoteResult<OnChainFunds> {
        let v = self.call("listfunds", json!({})).await?;
        Ok(parse_funds(&v).map_err(rejected_parse("listfunds"))?.0)
    }

    async fn channel_balance(&self) -> RemoteResult<ChannelBalance> {
        let v = self.call("listfunds", json!({})).await?;
        Ok(parse_funds(&v).map_err(rejected_parse("listfunds"))?.1)
    }

    async fn create_invoice(&self, req: CreateInvoice) -> RemoteResult<Invoice> {
        if req.description_hash.is_some() {
            return Err(RemoteError::rejected(
                "invoice: core lightning cannot commit to a caller supplied description hash",
            ));
        }
        let label = format!(
            "swap-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let v = self
            .call(
                "invoice",
                json!({
                    "amount_msat": req.amount_sats.saturating_mul(1000),
                    "label": label,
                    "description": req.memo,
                    "expiry": req.expiry.as_secs(),
                }),
            )
            .await?;

        let payment_request = v["bolt11"]
            .as_str()
            .ok_or_else(|| RemoteError::rejected("invoice: missing bolt11"))?
            .to_string();
        let payment_hash = v["payment_hash"]
            .as_str()
            .ok_or_else(|| RemoteError::rejected("invoice: missing payment_hash"))?
            .to_string();
        Ok(Invoice {
            payment_request,
            payment_hash,
        })
    }

    async fn pay_invoice(&self, req: PayInvoice) -> RemoteResult<PaymentResult> {
        let payment_hash = payment_hash_from_bolt11(&req.invoice)
            .map_err(|e| RemoteError::rejected(format!("pay: {e:#}")))?;
        let payment_id = hex::encode(payment_hash);

        let mut params = json!({ "bolt11": req.invoice });
        if let Some(fee) = req.fee_limit_sats {
            params["maxfee"] = json!(fee.saturating_mul(1000));
        }

        let client = self.clone();
        let task_payment_id = payment_id.clone();
        let mut handle = tokio::spawn(async move {
            let result = client.call("pay", params).await;
            match &result {
                Ok(_) => tracing::info!(payment_id = %task_payment_id, "cln payment settled"),
                Err(err) => {
                    tracing::warn!(payment_id = %task_payment_id, error = %err, "cln payment failed")
                }
            }
            result
        });

        match tokio::time::timeout(PAY_GRACE, &mut handle).await {
            Ok(Ok(Ok(v))) => Ok(PaymentResult {
                payment_id,
                preimage: v["payment_preimage"].as_str().map(str::to_string),
            }),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(join)) => Err(RemoteError::transient(format!("pay: join: {join}"))),
            Err(_) => Ok(PaymentResult {
                payment_id,
                preimage: None,
            }),
        }
    }

    async fn new_address(&self) -> RemoteResult<String> {
        let v = self
            .call("newaddr", json!({ "addresstype": "bech32" }))
            .await?;
        v["bech32"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::rejected("newaddr: missing bech32"))
    }

    async fn send_to_address(&self, address: &str, amount_sats: u64) -> RemoteResult<String> {
        let v = self
            .call(
                "withdraw",
                json!({ "destination": address, "satoshi": amount_sats }),
            )
            .await?;
        v["txid"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::rejected("withdraw: missing txid"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getinfo_maps_alias_height_and_features() {
        let info = parse_info(&json!({
            "id": "02abc",
            "alias": "B",
            "blockheight": 812,
            "our_features": { "node": "0100" },
        }))
        .unwrap();

        assert_eq!(info.alias, "B");
        assert_eq!(info.block_height, 812);
        assert!(info.features[&8].is_required);
    }

    #[test]
    fn listfunds_splits_onchain_and_channel_balances() {
        let (funds, balance) = parse_funds(&json!({
            "outputs": [
                { "amount_msat": 2_000_000_000u64, "status": "confirmed" },
                { "amount_msat": "5000000msat", "status": "unconfirmed" },
                { "amount_msat": 1_000, "status": "spent" },
            ],
            "channels": [
                {
                    "channel_id": "aa",
                    "short_channel_id": "103x1x0",
                    "amount_msat": 1_000_000_000u64,
                    "our_amount_msat": 900_000_000u64,
                    "state": "CHANNELD_NORMAL",
                },
                {
                    "short_channel_id": "104x2x1",
                    "amount_msat": 500_000_000u64,
                    "our_amount_msat": 500_000_000u64,
                    "state": "ONCHAIN",
                },
            ],
        }))
        .unwrap();

        assert_eq!(funds.confirmed_balance_sats, 2_000_000);
        assert_eq!(funds.unconfirmed_balance_sats, 5_000);
        assert_eq!(balance.local_sats, 900_000);
        assert_eq!(balance.remote_sats, 100_000);
        assert_eq!(balance.channels.len(), 2);
        assert_eq!(balance.channels[1].channel_id, "104x2x1");
        assert!(!balance.channels[1].active);
    }
}
