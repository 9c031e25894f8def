//! Collaborator traits injected into every flow.
//!
//! The controller never reaches for global state: the backend, the route
//! quoter, the connected wallet, the auth session and the token catalog are
//! all passed in through [`FlowDeps`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::WalletConfig;
use crate::error::{BackendError, RouteError, WalletError};
use crate::payments::types::{
    ChainId, Charge, ChargeRequest, EvmAddress, Payment, PaymentRecord, PreparedTransaction,
    RecipientKind, RequestSummary, RouteQuote, RouteRequest, TokenInfo, TxHash,
};

/// Charge lifecycle on the backend.
#[async_trait]
pub trait ChargeApi: Send + Sync {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge, BackendError>;

    async fn fetch_charge(&self, id: Uuid) -> Result<Charge, BackendError>;

    async fn fetch_request(&self, id: Uuid) -> Result<RequestSummary, BackendError>;
}

/// Records settled payments against their charge.
#[async_trait]
pub trait PaymentRecorder: Send + Sync {
    async fn record_payment(&self, record: &PaymentRecord) -> Result<Payment, BackendError>;
}

/// Cross-chain / cross-token quoting.
#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn quote(&self, request: &RouteRequest) -> Result<RouteQuote, RouteError>;
}

/// The connected smart wallet.
#[async_trait]
pub trait WalletClient: Send + Sync {
    fn address(&self) -> Option<EvmAddress>;

    /// Spendable balance of the wallet token, in token units.
    async fn balance(&self) -> Result<Decimal, WalletError>;

    /// Transfer `amount` of the wallet token on the wallet chain.
    async fn send_money(&self, to: &EvmAddress, amount: Decimal) -> Result<TxHash, WalletError>;

    /// Submit route transactions as one batch.
    async fn send_transactions(
        &self,
        transactions: &[PreparedTransaction],
    ) -> Result<TxHash, WalletError>;
}

/// Authenticated user, if any.
pub trait AuthSession: Send + Sync {
    fn user_id(&self) -> Option<String>;

    fn is_logged_in(&self) -> bool {
        self.user_id().is_some()
    }
}

/// Token metadata lookup.
pub trait TokenCatalog: Send + Sync {
    fn token(&self, chain_id: &ChainId, address: &EvmAddress) -> Option<TokenInfo>;

    /// The token the wallet holds, on the chain it lives on.
    fn wallet_token(&self) -> (ChainId, TokenInfo);
}

/// Username / ENS resolution.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn resolve(
        &self,
        identifier: &str,
        kind: RecipientKind,
    ) -> Result<EvmAddress, BackendError>;
}

/// Everything a flow needs from the outside world.
#[derive(Clone)]
pub struct FlowDeps {
    pub charges: Arc<dyn ChargeApi>,
    pub recorder: Arc<dyn PaymentRecorder>,
    pub routes: Arc<dyn RouteProvider>,
    pub wallet: Arc<dyn WalletClient>,
    pub auth: Arc<dyn AuthSession>,
    pub tokens: Arc<dyn TokenCatalog>,
    pub resolver: Arc<dyn RecipientResolver>,
}

/// Fixed session, used by the CLI and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    user_id: Option<String>,
}

impl StaticSession {
    pub fn logged_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl AuthSession for StaticSession {
    fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

/// Config-driven token catalog.
#[derive(Debug, Clone)]
pub struct StaticTokenCatalog {
    wallet_chain: ChainId,
    wallet_token: TokenInfo,
    tokens: HashMap<(ChainId, EvmAddress), TokenInfo>,
}

impl StaticTokenCatalog {
    pub fn new(wallet_chain: ChainId, wallet_token: TokenInfo) -> Self {
        let mut tokens = HashMap::new();
        tokens.insert(
            (wallet_chain.clone(), wallet_token.address.clone()),
            wallet_token.clone(),
        );
        Self {
            wallet_chain,
            wallet_token,
            tokens,
        }
    }

    pub fn from_config(config: &WalletConfig) -> Self {
        Self::new(
            config.chain_id.clone(),
            TokenInfo {
                address: config.token_address.clone(),
                symbol: config.token_symbol.clone(),
                decimals: config.token_decimals,
            },
        )
    }

    pub fn with_token(mut self, chain_id: ChainId, token: TokenInfo) -> Self {
        self.tokens.insert((chain_id, token.address.clone()), token);
        self
    }
}

impl TokenCatalog for StaticTokenCatalog {
    fn token(&self, chain_id: &ChainId, address: &EvmAddress) -> Option<TokenInfo> {
        self.tokens
            .get(&(chain_id.clone(), address.clone()))
            .cloned()
    }

    fn wallet_token(&self) -> (ChainId, TokenInfo) {
        (self.wallet_chain.clone(), self.wallet_token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup_ignores_address_case() {
        let usdc = TokenInfo {
            address: EvmAddress::parse("0xaf88d065e77c8cC2239327C5EDb3A432268e5831").unwrap(),
            symbol: "USDC".to_string(),
            decimals: 6,
        };
        let catalog = StaticTokenCatalog::new(ChainId::new(42161), usdc.clone());
        let lower =
            EvmAddress::parse("0xaf88d065e77c8cc2239327c5edb3a432268e5831").unwrap();

        assert_eq!(catalog.token(&ChainId::new(42161), &lower), Some(usdc));
        assert_eq!(catalog.token(&ChainId::new(137), &lower), None);
    }

    #[test]
    fn static_session_login_state() {
        assert!(StaticSession::logged_in("user-1").is_logged_in());
        assert!(!StaticSession::anonymous().is_logged_in());
    }
}
