//! Typed data model shared by every payment flow.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowError;

fn is_prefixed_hex(value: &str, hex_len: usize) -> bool {
    value.len() == hex_len + 2
        && (value.starts_with("0x") || value.starts_with("0X"))
        && value.bytes().skip(2).all(|b| b.is_ascii_hexdigit())
}

/// EVM address. Comparison ignores checksum casing.
#[derive(Debug, Clone, Serialize, Deserialize, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct EvmAddress(String);

impl EvmAddress {
    pub fn parse(raw: &str) -> Result<Self, FlowError> {
        let trimmed = raw.trim();
        if !is_prefixed_hex(trimmed, 40) {
            return Err(FlowError::InvalidInput {
                field: "address",
                reason: format!("'{trimmed}' is not a 0x-prefixed 20-byte hex address"),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for EvmAddress {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl std::hash::Hash for EvmAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EvmAddress {
    type Error = FlowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EvmAddress> for String {
    fn from(value: EvmAddress) -> Self {
        value.0
    }
}

impl FromStr for EvmAddress {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Transaction hash (or user-operation hash) returned by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxHash(String);

impl TxHash {
    pub fn parse(raw: &str) -> Result<Self, FlowError> {
        let trimmed = raw.trim();
        if !is_prefixed_hex(trimmed, 64) {
            return Err(FlowError::InvalidInput {
                field: "tx_hash",
                reason: format!("'{trimmed}' is not a 0x-prefixed 32-byte hex hash"),
            });
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TxHash {
    type Error = FlowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TxHash> for String {
    fn from(value: TxHash) -> Self {
        value.0
    }
}

/// EVM chain id, kept as the decimal string the backend speaks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: u64) -> Self {
        Self(id.to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, FlowError> {
        let trimmed = raw.trim();
        trimmed
            .parse::<u64>()
            .map(Self::new)
            .map_err(|e| FlowError::InvalidInput {
                field: "chain_id",
                reason: format!("'{trimmed}': {e}"),
            })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a user-entered decimal amount. Empty input is treated as zero.
pub fn parse_amount(raw: &str) -> Result<Decimal, FlowError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(trimmed).map_err(|e| FlowError::InvalidAmount {
        reason: format!("'{trimmed}': {e}"),
    })
}

/// Largest token precision with an exact `u64` scale factor.
pub const MAX_TOKEN_DECIMALS: u32 = 18;

/// Scale a token amount into integer base units (`amount * 10^decimals`).
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<u128, FlowError> {
    if amount.is_sign_negative() {
        return Err(FlowError::InvalidAmount {
            reason: "negative amounts have no base-unit representation".to_string(),
        });
    }
    if decimals > MAX_TOKEN_DECIMALS {
        return Err(FlowError::InvalidAmount {
            reason: format!("{decimals} decimals exceeds the supported {MAX_TOKEN_DECIMALS}"),
        });
    }
    let factor = Decimal::from(10u64.pow(decimals));
    let scaled = amount
        .checked_mul(factor)
        .ok_or_else(|| FlowError::InvalidAmount {
            reason: format!("{amount} overflows at {decimals} decimals"),
        })?
        .trunc();
    scaled
        .to_string()
        .parse::<u128>()
        .map_err(|e| FlowError::InvalidAmount {
            reason: e.to_string(),
        })
}

/// Inverse of [`to_base_units`].
pub fn from_base_units(units: u128, decimals: u32) -> Result<Decimal, FlowError> {
    let mut value = Decimal::from_str(&units.to_string()).map_err(|e| FlowError::InvalidAmount {
        reason: e.to_string(),
    })?;
    value
        .set_scale(decimals)
        .map_err(|e| FlowError::InvalidAmount {
            reason: e.to_string(),
        })?;
    Ok(value.normalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientKind {
    Address,
    Username,
    Ens,
}

/// Who receives the payment. Resolved once `resolved_address` is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub identifier: String,
    pub resolved_address: Option<EvmAddress>,
    pub kind: RecipientKind,
}

impl Recipient {
    /// A raw address recipient is resolved by construction.
    pub fn address(address: EvmAddress) -> Self {
        Self {
            identifier: address.to_string(),
            resolved_address: Some(address),
            kind: RecipientKind::Address,
        }
    }

    pub fn username(username: impl Into<String>, address: Option<EvmAddress>) -> Self {
        Self {
            identifier: username.into(),
            resolved_address: address,
            kind: RecipientKind::Username,
        }
    }

    pub fn ens(name: impl Into<String>) -> Self {
        Self {
            identifier: name.into(),
            resolved_address: None,
            kind: RecipientKind::Ens,
        }
    }

    /// Classify a free-form identifier the way the recipient input does.
    pub fn from_identifier(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(address) = EvmAddress::parse(trimmed) {
            return Self::address(address);
        }
        if trimmed.contains('.') {
            return Self::ens(trimmed.to_ascii_lowercase());
        }
        Self::username(trimmed.trim_start_matches('@'), None)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_address.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub address: EvmAddress,
    pub symbol: String,
    pub decimals: u32,
}

/// Token + chain picked in the selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSelection {
    pub chain_id: ChainId,
    pub token: TokenInfo,
}

impl TokenSelection {
    pub fn same_asset(&self, chain_id: &ChainId, token: &EvmAddress) -> bool {
        &self.chain_id == chain_id && &self.token.address == token
    }
}

/// Optional message and file attached to a payment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip)]
    pub bytes: Option<Vec<u8>>,
}

impl Attachment {
    pub fn is_empty(&self) -> bool {
        self.message.is_none() && self.file_name.is_none() && self.bytes.is_none()
    }
}

/// Mutable form state owned by one flow instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FormData {
    pub amount: String,
    pub usd_amount: String,
    pub recipient: Option<Recipient>,
    pub selection: Option<TokenSelection>,
    pub attachment: Attachment,
    pub request_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    DirectSend,
    Request,
    Withdraw,
}

/// Payload for creating a charge on the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeRequest {
    pub token_amount: Decimal,
    pub token_address: EvmAddress,
    pub chain_id: ChainId,
    pub token_symbol: String,
    pub token_decimals: u32,
    pub recipient_address: EvmAddress,
    pub transaction_type: TransactionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip)]
    pub attachment: Option<Attachment>,
    pub currency_amount: Decimal,
    pub currency_code: String,
}

impl ChargeRequest {
    /// Stable digest used as the idempotency key for charge creation.
    pub fn digest(&self) -> String {
        let payload = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&payload).to_hex().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FulfillmentStatus {
    Pending,
    Successful,
    Failed,
}

/// Backend-issued payment intent. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub uuid: Uuid,
    pub chain_id: ChainId,
    pub token_amount: Decimal,
    pub token_address: EvmAddress,
    pub token_decimals: u32,
    pub token_symbol: String,
    pub recipient_address: EvmAddress,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default)]
    pub currency_amount: Option<Decimal>,
    #[serde(default)]
    pub fulfillment_status: Option<FulfillmentStatus>,
    pub created_at: DateTime<Utc>,
}

impl Charge {
    pub fn is_paid(&self) -> bool {
        self.fulfillment_status == Some(FulfillmentStatus::Successful)
    }

    pub fn is_same_asset(&self, chain_id: &ChainId, token: &EvmAddress) -> bool {
        &self.chain_id == chain_id && &self.token_address == token
    }
}

/// Summary of a request (pot) that contributions are charged against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub uuid: Uuid,
    pub recipient_address: EvmAddress,
    #[serde(default)]
    pub total_amount: Option<Decimal>,
    #[serde(default)]
    pub contributions: Vec<Decimal>,
}

/// Payment recording payload sent after the wallet returns a hash.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub charge_id: Uuid,
    pub chain_id: ChainId,
    #[serde(rename = "hash")]
    pub tx_hash: TxHash,
    pub token_address: EvmAddress,
    pub payer_address: EvmAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_chain_id: Option<ChainId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_token_address: Option<EvmAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_token_symbol: Option<String>,
}

/// Backend record of a settled payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub uuid: Uuid,
    pub charge_uuid: Uuid,
    pub tx_hash: TxHash,
    pub payer_chain_id: ChainId,
    pub paid_token_address: EvmAddress,
}

/// Unsigned transaction produced by a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedTransaction {
    pub to: EvmAddress,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub value: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    Swap,
    Rfq,
}

/// Source leg of a route request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSource {
    pub address: EvmAddress,
    pub token_address: EvmAddress,
    pub token_decimals: u32,
    pub chain_id: ChainId,
}

/// Destination leg of a route request, taken from the charge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDestination {
    pub recipient_address: EvmAddress,
    pub token_address: EvmAddress,
    pub token_amount: Decimal,
    pub token_decimals: u32,
    pub chain_id: ChainId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteRequest {
    pub source: RouteSource,
    pub destination: RouteDestination,
    /// When set, the quote is denominated in USD on the source side.
    pub usd_amount: Option<Decimal>,
}

impl RouteRequest {
    pub fn is_cross_chain(&self) -> bool {
        self.source.chain_id != self.destination.chain_id
    }

    pub fn is_different_token(&self) -> bool {
        self.source.token_address != self.destination.token_address
    }

    pub fn needs_route(&self) -> bool {
        self.is_cross_chain() || self.is_different_token()
    }
}

/// Raw quote returned by a route provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteQuote {
    pub kind: RouteKind,
    pub from_amount: Decimal,
    pub to_amount: Decimal,
    pub to_amount_min: Option<Decimal>,
    pub fee_costs_usd: Decimal,
    pub transactions: Vec<PreparedTransaction>,
    pub expiry: DateTime<Utc>,
}

/// Validated route held by the flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub kind: RouteKind,
    pub from_amount: Decimal,
    pub to_amount: Decimal,
    pub min_received: Decimal,
    pub slippage_bps: u32,
    pub fee_costs_usd: Decimal,
    pub transactions: Vec<PreparedTransaction>,
    pub expiry: DateTime<Utc>,
    pub generation: u64,
}

impl Route {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const USDC_ARB: &str = "0xaf88d065e77c8cC2239327C5EDb3A432268e5831";

    #[test]
    fn address_equality_ignores_checksum_case() {
        let mixed = EvmAddress::parse(USDC_ARB).unwrap();
        let lower = EvmAddress::parse(&USDC_ARB.to_ascii_lowercase()).unwrap();
        assert_eq!(mixed, lower);
        assert!(EvmAddress::parse("0x1234").is_err());
        assert!(EvmAddress::parse("af88d065e77c8cC2239327C5EDb3A432268e5831").is_err());
    }

    #[test]
    fn amount_parsing_treats_empty_as_zero() {
        assert_eq!(parse_amount("").unwrap(), Decimal::ZERO);
        assert_eq!(parse_amount(" 10.50 ").unwrap(), dec!(10.50));
        assert!(parse_amount("ten").is_err());
    }

    #[test]
    fn base_unit_conversion() {
        assert_eq!(to_base_units(dec!(10), 6).unwrap(), 10_000_000);
        assert_eq!(to_base_units(dec!(0.1234567), 6).unwrap(), 123_456);
        assert_eq!(from_base_units(9_950_000, 6).unwrap(), dec!(9.95));
        assert!(to_base_units(dec!(-1), 6).is_err());
    }

    #[test]
    fn base_units_reject_unsupported_precision() {
        assert_eq!(
            to_base_units(dec!(1), 18).unwrap(),
            1_000_000_000_000_000_000
        );
        assert!(matches!(
            to_base_units(dec!(1), 24),
            Err(FlowError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn recipient_classification() {
        let address = Recipient::from_identifier(USDC_ARB);
        assert_eq!(address.kind, RecipientKind::Address);
        assert!(address.is_resolved());

        let ens = Recipient::from_identifier("Vitalik.eth");
        assert_eq!(ens.kind, RecipientKind::Ens);
        assert_eq!(ens.identifier, "vitalik.eth");
        assert!(!ens.is_resolved());

        let username = Recipient::from_identifier("@hugo");
        assert_eq!(username.kind, RecipientKind::Username);
        assert_eq!(username.identifier, "hugo");
    }

    #[test]
    fn charge_request_digest_is_stable() {
        let request = ChargeRequest {
            token_amount: dec!(10),
            token_address: EvmAddress::parse(USDC_ARB).unwrap(),
            chain_id: ChainId::new(42161),
            token_symbol: "USDC".to_string(),
            token_decimals: 6,
            recipient_address: EvmAddress::parse(USDC_ARB).unwrap(),
            transaction_type: TransactionType::DirectSend,
            request_id: None,
            reference: Some("dinner".to_string()),
            attachment: None,
            currency_amount: dec!(10),
            currency_code: "USD".to_string(),
        };
        assert_eq!(request.digest(), request.clone().digest());
        assert_eq!(request.digest().len(), 64);

        let mut other = request.clone();
        other.reference = Some("lunch".to_string());
        assert_ne!(request.digest(), other.digest());
    }
}
