//! HTTP clients for the Peanut backend and the Squid route API.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ApiConfig, SquidConfig};
use crate::error::{BackendError, RouteError};
use crate::payments::clients::{ChargeApi, PaymentRecorder, RecipientResolver, RouteProvider};
use crate::payments::types::{
    ChainId, Charge, ChargeRequest, EvmAddress, FulfillmentStatus, Payment, PaymentRecord,
    PreparedTransaction, RecipientKind, RequestSummary, RouteKind, RouteQuote, RouteRequest,
    TransactionType, TxHash, from_base_units, to_base_units,
};

const BPS_SCALE: u128 = 10_000;
/// Upper bound on Squid calls spent searching for a source amount.
const MAX_SEARCH_QUOTES: u32 = 3;

/// Mask bearer tokens and key-like values before an upstream body lands in
/// an error or a log line.
pub(crate) fn redact_sensitive_detail(raw: &str) -> String {
    let mut value = raw.to_string();
    let patterns = [
        (r"(?i)\b(bearer)\s+[a-z0-9._\-~+/]+=*", "$1 [REDACTED]"),
        (
            r"(?i)\b(token|api[_\-]?key|secret|password|signature)\b(\s*[:=]\s*)([^,\s]+)",
            "$1$2[REDACTED]",
        ),
    ];

    for (pattern, replacement) in patterns {
        if let Ok(re) = Regex::new(pattern) {
            value = re.replace_all(&value, replacement).to_string();
        }
    }

    value
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// ── Peanut backend wire types ──────────────────────────────────────

#[derive(Debug, Serialize)]
struct LocalPrice {
    amount: String,
    currency: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestProps {
    chain_id: String,
    token_amount: String,
    token_address: String,
    token_type: &'static str,
    token_symbol: String,
    token_decimals: u32,
    recipient_address: String,
}

#[derive(Debug, Serialize)]
struct CreateChargeBody {
    pricing_type: &'static str,
    local_price: LocalPrice,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<Uuid>,
    #[serde(rename = "requestProps")]
    request_props: RequestProps,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
    #[serde(rename = "transactionType")]
    transaction_type: TransactionType,
}

impl From<&ChargeRequest> for CreateChargeBody {
    fn from(request: &ChargeRequest) -> Self {
        Self {
            pricing_type: "fixed_price",
            local_price: LocalPrice {
                amount: request.currency_amount.to_string(),
                currency: request.currency_code.clone(),
            },
            request_id: request.request_id,
            request_props: RequestProps {
                chain_id: request.chain_id.to_string(),
                token_amount: request.token_amount.to_string(),
                token_address: request.token_address.to_string(),
                token_type: "erc20",
                token_symbol: request.token_symbol.clone(),
                token_decimals: request.token_decimals,
                recipient_address: request.recipient_address.to_string(),
            },
            reference: request.reference.clone(),
            transaction_type: request.transaction_type,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedCharge {
    data: CreatedChargeData,
}

#[derive(Debug, Deserialize)]
struct CreatedChargeData {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestLink {
    recipient_address: EvmAddress,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    attachment_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentEntry {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    paid_amount_in_requested_token: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChargeResponse {
    uuid: Uuid,
    created_at: DateTime<Utc>,
    chain_id: ChainId,
    token_amount: Decimal,
    token_address: EvmAddress,
    token_decimals: u32,
    token_symbol: String,
    #[serde(default)]
    payments: Vec<PaymentEntry>,
    #[serde(default)]
    fulfillment_payment: Option<serde_json::Value>,
    request_link: RequestLink,
}

impl ChargeResponse {
    fn fulfillment_status(&self) -> Option<FulfillmentStatus> {
        let paid = self.fulfillment_payment.is_some()
            || self
                .payments
                .iter()
                .any(|p| p.status.as_deref() == Some("SUCCESSFUL"));
        if paid {
            return Some(FulfillmentStatus::Successful);
        }
        self.payments.last().and_then(|p| match p.status.as_deref() {
            Some("FAILED") => Some(FulfillmentStatus::Failed),
            Some(_) => Some(FulfillmentStatus::Pending),
            None => None,
        })
    }

    fn into_charge(self, currency_amount: Option<Decimal>) -> Charge {
        let fulfillment_status = self.fulfillment_status();
        Charge {
            uuid: self.uuid,
            chain_id: self.chain_id,
            token_amount: self.token_amount,
            token_address: self.token_address,
            token_decimals: self.token_decimals,
            token_symbol: self.token_symbol,
            recipient_address: self.request_link.recipient_address,
            reference: self.request_link.reference,
            attachment_url: self.request_link.attachment_url,
            currency_amount,
            fulfillment_status,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChargeEntry {
    #[serde(default)]
    payments: Vec<PaymentEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestResponse {
    uuid: Uuid,
    recipient_address: EvmAddress,
    #[serde(default)]
    token_amount: Option<Decimal>,
    #[serde(default)]
    charges: Vec<ChargeEntry>,
}

impl From<RequestResponse> for RequestSummary {
    fn from(response: RequestResponse) -> Self {
        let contributions = response
            .charges
            .iter()
            .flat_map(|charge| &charge.payments)
            .filter(|p| p.status.as_deref() != Some("FAILED"))
            .filter_map(|p| p.paid_amount_in_requested_token)
            .collect();
        Self {
            uuid: response.uuid,
            recipient_address: response.recipient_address,
            total_amount: response.token_amount,
            contributions,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentCharge {
    uuid: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentResponse {
    uuid: Uuid,
    paid_token_address: EvmAddress,
    payer_chain_id: ChainId,
    payer_transaction_hash: TxHash,
    request_charge: PaymentCharge,
}

impl From<PaymentResponse> for Payment {
    fn from(response: PaymentResponse) -> Self {
        Self {
            uuid: response.uuid,
            charge_uuid: response.request_charge.uuid,
            tx_hash: response.payer_transaction_hash,
            payer_chain_id: response.payer_chain_id,
            paid_token_address: response.paid_token_address,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResolvedAddress {
    address: EvmAddress,
}

// ── Peanut backend client ──────────────────────────────────────────

/// REST client for charges, requests, payments and recipient lookups.
pub struct HttpBackend {
    client: Client,
    config: ApiConfig,
}

impl HttpBackend {
    pub fn new(config: ApiConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::RequestFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Send with bearer auth, retrying transport errors, 5xx and 429 with
    /// linear backoff. Other statuses are returned to the caller untouched.
    async fn send<F>(&self, endpoint: &str, build: F) -> Result<Response, BackendError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut request = build();
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key.expose_secret());
            }

            match request.send().await {
                Ok(response) if !is_retryable(response.status()) => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if attempt > self.config.max_retries {
                        if status == StatusCode::TOO_MANY_REQUESTS {
                            return Err(BackendError::RateLimited {
                                endpoint: endpoint.to_string(),
                                retry_after: retry_after(&response),
                            });
                        }
                        return Ok(response);
                    }
                    tracing::warn!(endpoint, %status, attempt, "retryable backend status");
                }
                Err(e) => {
                    let reason = redact_sensitive_detail(&e.to_string());
                    if attempt > self.config.max_retries {
                        return Err(BackendError::RequestFailed {
                            endpoint: endpoint.to_string(),
                            reason,
                        });
                    }
                    tracing::warn!(endpoint, attempt, error = %reason, "backend request failed");
                }
            }

            tokio::time::sleep(self.config.retry_backoff * attempt).await;
        }
    }

    async fn decode<T: DeserializeOwned>(
        endpoint: &str,
        response: Response,
    ) -> Result<T, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: redact_sensitive_detail(&body),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::InvalidResponse {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, BackendError> {
        let url = self.url(endpoint);
        let response = self.send(endpoint, || self.client.get(&url)).await?;
        Self::decode(endpoint, response).await
    }
}

fn not_found(err: &BackendError) -> bool {
    matches!(err, BackendError::Status { status: 404, .. })
}

#[async_trait]
impl ChargeApi for HttpBackend {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge, BackendError> {
        let endpoint = "/charges";
        let url = self.url(endpoint);
        let body = CreateChargeBody::from(request);
        let idempotency_key = request.digest();

        let response = self
            .send(endpoint, || {
                self.client
                    .post(&url)
                    .header("Idempotency-Key", &idempotency_key)
                    .json(&body)
            })
            .await?;
        let created: CreatedCharge = Self::decode(endpoint, response).await?;

        let id = created
            .data
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(BackendError::MissingChargeId)?;
        let id = Uuid::parse_str(id).map_err(|e| BackendError::InvalidResponse {
            endpoint: endpoint.to_string(),
            reason: format!("charge id '{id}': {e}"),
        })?;
        tracing::debug!(charge_id = %id, "charge created, fetching details");

        let mut charge = self.fetch_charge(id).await?;
        charge.currency_amount = Some(request.currency_amount);
        Ok(charge)
    }

    async fn fetch_charge(&self, id: Uuid) -> Result<Charge, BackendError> {
        match self
            .get_json::<ChargeResponse>(&format!("/charges/{id}"))
            .await
        {
            Ok(response) => Ok(response.into_charge(None)),
            Err(e) if not_found(&e) => Err(BackendError::ChargeNotFound { id }),
            Err(e) => Err(e),
        }
    }

    async fn fetch_request(&self, id: Uuid) -> Result<RequestSummary, BackendError> {
        match self
            .get_json::<RequestResponse>(&format!("/requests/{id}"))
            .await
        {
            Ok(response) => Ok(response.into()),
            Err(e) if not_found(&e) => Err(BackendError::InvalidRequestId { id }),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PaymentRecorder for HttpBackend {
    async fn record_payment(&self, record: &PaymentRecord) -> Result<Payment, BackendError> {
        let endpoint = "/payments";
        let url = self.url(endpoint);
        let response = self
            .send(endpoint, || self.client.post(&url).json(record))
            .await?;
        let payment: PaymentResponse = Self::decode(endpoint, response).await?;
        Ok(payment.into())
    }
}

#[async_trait]
impl RecipientResolver for HttpBackend {
    async fn resolve(
        &self,
        identifier: &str,
        kind: RecipientKind,
    ) -> Result<EvmAddress, BackendError> {
        let encoded = urlencoding::encode(identifier);
        let not_resolved = || BackendError::RecipientNotFound {
            identifier: identifier.to_string(),
        };
        let endpoint = match kind {
            RecipientKind::Address => {
                return EvmAddress::parse(identifier).map_err(|_| not_resolved());
            }
            RecipientKind::Username => format!("/users/username/{encoded}"),
            RecipientKind::Ens => format!("/ens/{encoded}"),
        };

        match self.get_json::<ResolvedAddress>(&endpoint).await {
            Ok(resolved) => Ok(resolved.address),
            Err(e) if not_found(&e) => Err(not_resolved()),
            Err(e) => Err(e),
        }
    }
}

// ── Squid route API ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SquidRouteParams {
    from_chain: String,
    from_token: String,
    from_amount: String,
    from_address: String,
    to_address: String,
    to_chain: String,
    to_token: String,
}

impl SquidRouteParams {
    fn new(request: &RouteRequest, from_amount: u128) -> Self {
        Self {
            from_chain: request.source.chain_id.to_string(),
            from_token: request.source.token_address.to_string(),
            from_amount: from_amount.to_string(),
            from_address: request.source.address.to_string(),
            to_address: request.destination.recipient_address.to_string(),
            to_chain: request.destination.chain_id.to_string(),
            to_token: request.destination.token_address.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SquidRouteResponse {
    route: SquidRoute,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SquidRoute {
    estimate: SquidEstimate,
    transaction_request: SquidTransactionRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SquidEstimate {
    #[serde(default)]
    actions: Vec<SquidAction>,
    from_amount: String,
    to_amount: String,
    #[serde(default)]
    to_amount_min: Option<String>,
    #[serde(default)]
    fee_costs: Vec<SquidCost>,
    #[serde(default)]
    gas_costs: Vec<SquidCost>,
}

#[derive(Debug, Deserialize)]
struct SquidAction {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SquidCost {
    #[serde(default)]
    amount_usd: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SquidTransactionRequest {
    target: EvmAddress,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    value: Option<String>,
    expiry: String,
}

fn invalid_quote(reason: impl Into<String>) -> RouteError {
    RouteError::InvalidQuote {
        reason: reason.into(),
    }
}

fn parse_units(field: &str, raw: &str) -> Result<u128, RouteError> {
    raw.trim()
        .parse::<u128>()
        .map_err(|e| invalid_quote(format!("{field} '{raw}': {e}")))
}

impl SquidRouteResponse {
    fn received_units(&self) -> Result<u128, RouteError> {
        parse_units("toAmount", &self.route.estimate.to_amount)
    }

    fn into_quote(self, from_decimals: u32, to_decimals: u32) -> Result<RouteQuote, RouteError> {
        let estimate = self.route.estimate;
        let tx = self.route.transaction_request;

        let units = |field: &str, raw: &str, decimals: u32| -> Result<Decimal, RouteError> {
            from_base_units(parse_units(field, raw)?, decimals)
                .map_err(|e| invalid_quote(format!("{field}: {e}")))
        };
        let from_amount = units("fromAmount", &estimate.from_amount, from_decimals)?;
        let to_amount = units("toAmount", &estimate.to_amount, to_decimals)?;
        let to_amount_min = estimate
            .to_amount_min
            .as_deref()
            .map(|raw| units("toAmountMin", raw, to_decimals))
            .transpose()?;

        let fee_costs_usd: Decimal = estimate
            .fee_costs
            .iter()
            .chain(&estimate.gas_costs)
            .filter_map(|cost| cost.amount_usd.as_deref()?.trim().parse::<Decimal>().ok())
            .sum();

        let kind = match estimate.actions.first().map(|a| a.kind.as_str()) {
            Some("rfq") => RouteKind::Rfq,
            _ => RouteKind::Swap,
        };

        let expiry_secs = tx
            .expiry
            .trim()
            .parse::<i64>()
            .map_err(|e| invalid_quote(format!("expiry '{}': {e}", tx.expiry)))?;
        let expiry = Utc
            .timestamp_opt(expiry_secs, 0)
            .single()
            .ok_or_else(|| invalid_quote(format!("expiry {expiry_secs} out of range")))?;

        let value = match tx.value.as_deref().map(str::trim) {
            None | Some("") => 0,
            Some(raw) => parse_units("value", raw)?,
        };

        Ok(RouteQuote {
            kind,
            from_amount,
            to_amount,
            to_amount_min,
            fee_costs_usd,
            transactions: vec![PreparedTransaction {
                to: tx.target,
                data: tx.data,
                value,
            }],
            expiry,
        })
    }
}

/// Search window and accepted overage, tiered by the USD size of the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SearchTier {
    max_overage_bps: u128,
    low_bps: u128,
    high_bps: u128,
}

fn search_tier(target_usd: Decimal) -> SearchTier {
    if target_usd < Decimal::from(10) {
        SearchTier {
            max_overage_bps: 50,
            low_bps: 9_925,
            high_bps: 10_150,
        }
    } else if target_usd < Decimal::from(1_000) {
        SearchTier {
            max_overage_bps: 30,
            low_bps: 9_950,
            high_bps: 10_090,
        }
    } else {
        SearchTier {
            max_overage_bps: 10,
            low_bps: 9_950,
            high_bps: 10_100,
        }
    }
}

/// Find a source amount whose quote delivers at least `target` units.
///
/// `quote(from_amount)` returns the received units alongside the response.
/// At most [`MAX_SEARCH_QUOTES`] quotes are spent searching; the first one
/// within tolerance wins, then the last over-target one, then a final quote
/// at the top of the window.
async fn find_optimal_from_amount<T, F, Fut>(
    target: u128,
    target_usd: Decimal,
    mut quote: F,
) -> Result<T, RouteError>
where
    F: FnMut(u128) -> Fut,
    Fut: Future<Output = Result<(u128, T), RouteError>>,
{
    let tier = search_tier(target_usd);
    let mut low = target.saturating_mul(tier.low_bps) / BPS_SCALE;
    let mut high = target.saturating_mul(tier.high_bps) / BPS_SCALE;
    let mut best = None;
    let mut iterations = 0;

    while iterations < MAX_SEARCH_QUOTES && high > low {
        let mid = low + (high - low) / 2;
        iterations += 1;

        match quote(mid).await {
            Ok((received, response)) if received >= target => {
                let overage = received - target;
                if overage.saturating_mul(BPS_SCALE) <= tier.max_overage_bps.saturating_mul(target)
                {
                    tracing::debug!(from_amount = mid, received, iterations, "quote within tolerance");
                    return Ok(response);
                }
                best = Some(response);
                high = mid.saturating_sub(1);
            }
            Ok((received, _)) => {
                tracing::debug!(from_amount = mid, received, target, "quote under target");
                low = mid + 1;
            }
            Err(e) => {
                tracing::debug!(from_amount = mid, error = %e, "search quote failed");
                low = mid + 1;
            }
        }
    }

    if let Some(best) = best {
        return Ok(best);
    }
    quote(high).await.map(|(_, response)| response)
}

/// Route quotes from the Squid v2 API.
pub struct SquidRouteProvider {
    client: Client,
    config: SquidConfig,
}

impl SquidRouteProvider {
    pub fn new(config: SquidConfig, timeout: Duration) -> Result<Self, RouteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RouteError::ProviderFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    async fn route_raw(&self, params: &SquidRouteParams) -> Result<SquidRouteResponse, RouteError> {
        let mut request = self
            .client
            .post(format!("{}/v2/route", self.config.base_url))
            .json(params);
        if let Some(integrator) = &self.config.integrator_id {
            request = request.header("x-integrator-id", integrator);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RouteError::ProviderFailed {
                reason: redact_sensitive_detail(&e.to_string()),
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RouteError::ProviderFailed {
                reason: format!(
                    "Failed to get route: {status}: {}",
                    redact_sensitive_detail(&body)
                ),
            });
        }
        response
            .json::<SquidRouteResponse>()
            .await
            .map_err(|e| invalid_quote(format!("undecodable route response: {e}")))
    }
}

#[async_trait]
impl RouteProvider for SquidRouteProvider {
    async fn quote(&self, request: &RouteRequest) -> Result<RouteQuote, RouteError> {
        let from_decimals = request.source.token_decimals;
        let to_decimals = request.destination.token_decimals;
        let to_units = |amount: Decimal, decimals: u32| {
            to_base_units(amount, decimals).map_err(|e| invalid_quote(e.to_string()))
        };

        // The wallet token is a USD stablecoin, so USD maps 1:1 onto it.
        let response = match request.usd_amount {
            Some(usd) => {
                let from_amount = to_units(usd, from_decimals)?;
                self.route_raw(&SquidRouteParams::new(request, from_amount))
                    .await?
            }
            None => {
                let target = to_units(request.destination.token_amount, to_decimals)?;
                find_optimal_from_amount(target, request.destination.token_amount, move |from| {
                    let params = SquidRouteParams::new(request, from);
                    async move {
                        let response = self.route_raw(&params).await?;
                        let received = response.received_units()?;
                        Ok((received, response))
                    }
                })
                .await?
            }
        };

        response.into_quote(from_decimals, to_decimals)
    }
}
