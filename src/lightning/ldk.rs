use async_trait::async_trait;
use ldk_server_client::client::LdkServerClient;
use ldk_server_client::error::{LdkServerError, LdkServerErrorCode};
use ldk_server_protos::api::{
    Bolt11ReceiveRequest, Bolt11SendRequest, GetBalancesRequest, GetNodeInfoRequest,
    ListChannelsRequest, OnchainReceiveRequest, OnchainSendRequest,
};
use ldk_server_protos::types::{
    Bolt11InvoiceDescription, RouteParametersConfig, bolt11_invoice_description,
};

use super::invoice::payment_hash_from_bolt11;
use super::{
    ChannelBalance, ChannelLiquidity, CreateInvoice, Invoice, NodeAdapter, NodeInfo,
    OnChainFunds, PayInvoice, PaymentResult,
};
use crate::error::{RemoteError, RemoteResult};

#[derive(Clone)]
pub struct LdkLightningClient {
    client: LdkServerClient,
}

impl LdkLightningClient {
    pub fn new(rest_service_address: String) -> Self {
        Self {
            client: LdkServerClient::new(rest_service_address),
        }
    }
}

// LDK's own routing defaults, kept when only the fee cap is set.
const DEFAULT_MAX_TOTAL_CLTV_EXPIRY_DELTA: u32 = 1008;
const DEFAULT_MAX_PATH_COUNT: u32 = 10;
const DEFAULT_MAX_CHANNEL_SATURATION_POWER_OF_HALF: u32 = 2;

fn classify(call: &str, err: LdkServerError) -> RemoteError {
    classify_code(call, &err.error_code, &err.message)
}

/// Request validation and payment failures are final; everything else
/// (connectivity, auth, 5xx) is retried.
fn classify_code(call: &str, code: &LdkServerErrorCode, message: &str) -> RemoteError {
    let detail = format!("{call}: {code:?}: {message}");
    match code {
        LdkServerErrorCode::InvalidRequestError | LdkServerErrorCode::LightningError => {
            RemoteError::Rejected(detail)
        }
        _ => RemoteError::Transient(detail),
    }
}

fn route_parameters(fee_limit_sats: Option<u64>) -> Option<RouteParametersConfig> {
    fee_limit_sats.map(|sats| RouteParametersConfig {
        max_total_routing_fee_msat: Some(sats.saturating_mul(1000)),
        max_total_cltv_expiry_delta: DEFAULT_MAX_TOTAL_CLTV_EXPIRY_DELTA,
        max_path_count: DEFAULT_MAX_PATH_COUNT,
        max_channel_saturation_power_of_half: DEFAULT_MAX_CHANNEL_SATURATION_POWER_OF_HALF,
    })
}

#[async_trait]
impl NodeAdapter for LdkLightningClient {
    async fn get_info(&self) -> RemoteResult<NodeInfo> {
        let info = self
            .client
            .get_node_info(GetNodeInfoRequest {})
            .await
            .map_err(|e| classify("GetNodeInfo", e))?;

        let block_height = info
            .current_best_block
            .as_ref()
            .map(|b| b.height)
            .ok_or_else(|| RemoteError::transient("GetNodeInfo: best block not known yet"))?;

        Ok(NodeInfo {
            alias: info.node_id.clone(),
            pubkey: info.node_id,
            block_height,
            features: Default::default(),
        })
    }

    async fn get_onchain_funds(&self) -> RemoteResult<OnChainFunds> {
        let balances = self
            .client
            .get_balances(GetBalancesRequest {})
            .await
            .map_err(|e| classify("GetBalances", e))?;

        Ok(OnChainFunds {
            confirmed_balance_sats: balances.spendable_onchain_balance_sats,
            unconfirmed_balance_sats: balances
                .total_onchain_balance_sats
                .saturating_sub(balances.spendable_onchain_balance_sats),
        })
    }

    async fn channel_balance(&self) -> RemoteResult<ChannelBalance> {
        let channels = self
            .client
            .list_channels(ListChannelsRequest {})
            .await
            .map_err(|e| classify("ListChannels", e))?
            .channels;

        Ok(ChannelBalance::from_channels(
            channels
                .into_iter()
                .map(|c| ChannelLiquidity {
                    channel_id: c.channel_id,
                    short_channel_id: None,
                    local_sats: c.outbound_capacity_msat / 1000,
                    remote_sats: c.inbound_capacity_msat / 1000,
                    active: c.is_usable,
                })
                .collect(),
        ))
    }

    async fn create_invoice(&self, req: CreateInvoice) -> RemoteResult<Invoice> {
        let kind = match req.description_hash {
            Some(hash) => bolt11_invoice_description::Kind::Hash(hex::encode(hash)),
            None => bolt11_invoice_description::Kind::Direct(req.memo),
        };
        let expiry_secs = u32::try_from(req.expiry.as_secs()).unwrap_or(u32::MAX);

        let resp = self
            .client
            .bolt11_receive(Bolt11ReceiveRequest {
                amount_msat: Some(req.amount_sats.saturating_mul(1000)),
                description: Some(Bolt11InvoiceDescription { kind: Some(kind) }),
                expiry_secs,
            })
            .await
            .map_err(|e| classify("Bolt11Receive", e))?;

        let payment_hash = payment_hash_from_bolt11(&resp.invoice)
            .map_err(|e| RemoteError::rejected(format!("node returned bad invoice: {e:#}")))?;

        Ok(Invoice {
            payment_request: resp.invoice,
            payment_hash: hex::encode(payment_hash),
        })
    }

    async fn pay_invoice(&self, req: PayInvoice) -> RemoteResult<PaymentResult> {
        let resp = self
            .client
            .bolt11_send(Bolt11SendRequest {
                invoice: req.invoice,
                amount_msat: None,
                route_parameters: route_parameters(req.fee_limit_sats),
            })
            .await
            .map_err(|e| classify("Bolt11Send", e))?;

        Ok(PaymentResult {
            payment_id: resp.payment_id,
            preimage: None,
        })
    }

    async fn new_address(&self) -> RemoteResult<String> {
        Ok(self
            .client
            .onchain_receive(OnchainReceiveRequest {})
            .await
            .map_err(|e| classify("OnchainReceive", e))?
            .address)
    }

    async fn send_to_address(&self, address: &str, amount_sats: u64) -> RemoteResult<String> {
        Ok(self
            .client
            .onchain_send(OnchainSendRequest {
                address: address.to_string(),
                amount_sats: Some(amount_sats),
                ..Default::default()
            })
            .await
            .map_err(|e| classify("OnchainSend", e))?
            .txid)
    }
}
