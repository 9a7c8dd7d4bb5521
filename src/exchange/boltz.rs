use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    CreateSwapRequest, CreatedSwap, ExchangeClient, ExchangeNode, NodesInfo, StatusTransaction,
    SwapStatusResponse, SwapTransaction,
};
use crate::error::{RemoteError, RemoteResult};

/// Client for the Boltz v1 REST API.
#[derive(Clone)]
pub struct BoltzClient {
    base_url: String,
    http: reqwest::Client,
}

impl BoltzClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("build http client: {e}"))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> RemoteResult<T> {
        let resp = self
            .http
            .get(format!("{}/{path}", self.base_url))
            .send()
            .await
            .map_err(|e| RemoteError::transient(format!("GET /{path}: {e}")))?;
        decode(path, resp).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> RemoteResult<T> {
        let resp = self
            .http
            .post(format!("{}/{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::transient(format!("POST /{path}: {e}")))?;
        decode(path, resp).await
    }
}

async fn decode<T: DeserializeOwned>(path: &str, resp: reqwest::Response) -> RemoteResult<T> {
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| RemoteError::transient(format!("/{path}: read body: {e}")))?;

    if !status.is_success() {
        return Err(classify_http(path, status, &body));
    }
    serde_json::from_str(&body)
        .map_err(|e| RemoteError::rejected(format!("/{path}: unexpected response {body:?}: {e}")))
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// 4xx answers mean the exchange refused the request. Server errors,
/// throttling and request timeouts are worth another attempt.
pub fn classify_http(path: &str, status: StatusCode, body: &str) -> RemoteError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string());
    let msg = format!("/{path}: HTTP {}: {detail}", status.as_u16());

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RemoteError::Transient(msg)
    } else {
        RemoteError::Rejected(msg)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmarineRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    pair_id: &'a str,
    order_side: &'static str,
    invoice: &'a str,
    refund_public_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReverseRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    pair_id: &'a str,
    order_side: &'static str,
    invoice_amount: u64,
    preimage_hash: String,
    claim_public_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmarineResponse {
    id: String,
    address: String,
    redeem_script: String,
    expected_amount: u64,
    timeout_block_height: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReverseResponse {
    id: String,
    invoice: String,
    lockup_address: String,
    redeem_script: String,
    onchain_amount: u64,
    timeout_block_height: u32,
}

#[derive(Serialize)]
struct IdRequest<'a> {
    id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    status: String,
    transaction: Option<StatusTxBody>,
    failure_reason: Option<String>,
}

#[derive(Deserialize)]
struct StatusTxBody {
    id: String,
    hex: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapTransactionBody {
    transaction_hex: String,
    timeout_block_height: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastRequest<'a> {
    currency: &'a str,
    transaction_hex: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastBody {
    transaction_id: String,
}

#[derive(Deserialize)]
struct NodesBody {
    nodes: std::collections::BTreeMap<String, NodeBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeBody {
    node_key: String,
    #[serde(default)]
    uris: Vec<String>,
}

#[async_trait]
impl ExchangeClient for BoltzClient {
    async fn get_nodes(&self) -> RemoteResult<NodesInfo> {
        let body: NodesBody = self.get("getnodes").await?;
        Ok(NodesInfo {
            nodes: body
                .nodes
                .into_iter()
                .map(|(currency, n)| {
                    (
                        currency,
                        ExchangeNode {
                            node_key: n.node_key,
                            uris: n.uris,
                        },
                    )
                })
                .collect(),
        })
    }

    async fn create_swap(&self, req: CreateSwapRequest) -> RemoteResult<CreatedSwap> {
        match req {
            CreateSwapRequest::Submarine {
                pair_id,
                invoice,
                refund_public_key,
            } => {
                let resp: SubmarineResponse = self
                    .post(
                        "createswap",
                        &SubmarineRequest {
                            kind: "submarine",
                            pair_id: &pair_id,
                            order_side: "sell",
                            invoice: &invoice,
                            refund_public_key: hex::encode(refund_public_key.serialize()),
                        },
                    )
                    .await?;
                tracing::debug!(swap_id = %resp.id, "submarine swap created");
                Ok(CreatedSwap {
                    id: resp.id,
                    invoice: None,
                    lockup_address: resp.address,
                    redeem_script_hex: resp.redeem_script,
                    onchain_amount_sats: resp.expected_amount,
                    timeout_block_height: resp.timeout_block_height,
                })
            }
            CreateSwapRequest::Reverse {
                pair_id,
                invoice_amount_sats,
                preimage_hash,
                claim_public_key,
            } => {
                let resp: ReverseResponse = self
                    .post(
                        "createswap",
                        &ReverseRequest {
                            kind: "reversesubmarine",
                            pair_id: &pair_id,
                            order_side: "buy",
                            invoice_amount: invoice_amount_sats,
                            preimage_hash: hex::encode(preimage_hash),
                            claim_public_key: hex::encode(claim_public_key.serialize()),
                        },
                    )
                    .await?;
                tracing::debug!(swap_id = %resp.id, "reverse swap created");
                Ok(CreatedSwap {
                    id: resp.id,
                    invoice: Some(resp.invoice),
                    lockup_address: resp.lockup_address,
                    redeem_script_hex: resp.redeem_script,
                    onchain_amount_sats: resp.onchain_amount,
                    timeout_block_height: resp.timeout_block_height,
                })
            }
        }
    }

    async fn get_swap_status(&self, swap_id: &str) -> RemoteResult<SwapStatusResponse> {
        let body: StatusBody = self.post("swapstatus", &IdRequest { id: swap_id }).await?;
        Ok(SwapStatusResponse {
            status: body.status.into(),
            transaction: body
                .transaction
                .map(|t| StatusTransaction { id: t.id, hex: t.hex }),
            failure_reason: body.failure_reason,
        })
    }

    async fn get_swap_transaction(&self, swap_id: &str) -> RemoteResult<SwapTransaction> {
        let body: SwapTransactionBody = self
            .post("getswaptransaction", &IdRequest { id: swap_id })
            .await?;
        Ok(SwapTransaction {
            transaction_hex: body.transaction_hex,
            timeout_block_height: body.timeout_block_height,
        })
    }

    async fn broadcast_transaction(&self, currency: &str, tx_hex: &str) -> RemoteResult<String> {
        let body: BroadcastBody = self
            .post(
                "broadcasttransaction",
                &BroadcastRequest {
                    currency,
                    transaction_hex: tx_hex,
                },
            )
            .await?;
        Ok(body.transaction_id)
    }
}
