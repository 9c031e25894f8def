//! Error types for peanut-flows.

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::payments::machine::FlowView;

/// Top-level error type for the payment flows.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),
}

/// Flow stage reported in status payloads.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowStage {
    Charge,
    Route,
    Submission,
    Recording,
}

/// Stage state reported in status payloads.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowStageState {
    Started,
    Completed,
    Failed,
    Blocked,
}

/// Failure domains for inline error surfaces.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowErrorDomain {
    Auth,
    Backend,
    Route,
    Wallet,
    Validation,
    Unknown,
}

/// Structured error payload attached to status events.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FlowErrorPayload {
    pub domain: FlowErrorDomain,
    pub code: &'static str,
    pub retryable: bool,
    pub message: String,
}

impl FlowErrorPayload {
    fn new(
        domain: FlowErrorDomain,
        code: &'static str,
        retryable: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            domain,
            code,
            retryable,
            message: message.into(),
        }
    }
}

/// Status envelope for flow progress, parseable by any consumer that only
/// understands string status lines.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FlowStatusPayload {
    pub kind: &'static str,
    pub version: u8,
    pub stage: FlowStage,
    pub state: FlowStageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FlowErrorPayload>,
}

impl FlowStatusPayload {
    const KIND: &'static str = "payment_flow_status";
    const VERSION: u8 = 1;

    pub fn new(stage: FlowStage, state: FlowStageState) -> Self {
        Self {
            kind: Self::KIND,
            version: Self::VERSION,
            stage,
            state,
            flow: None,
            detail: None,
            error: None,
        }
    }

    pub fn with_flow(mut self, flow: impl Into<String>) -> Self {
        self.flow = Some(flow.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_error(mut self, error: FlowErrorPayload) -> Self {
        self.error = Some(error);
        self
    }

    /// Serialize for transport over string-only status channels.
    pub fn to_status_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"kind\":\"{}\",\"version\":{},\"stage\":\"{:?}\",\"state\":\"{:?}\"}}",
                Self::KIND,
                Self::VERSION,
                self.stage,
                self.state
            )
        })
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backend REST errors (charges, requests, payments, recipients).
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Backend returned HTTP {status} for {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Charge {id} not found")]
    ChargeNotFound { id: Uuid },

    #[error("invalid request id")]
    InvalidRequestId { id: Uuid },

    #[error("charge created but missing uuid")]
    MissingChargeId,

    #[error("Recipient {identifier} could not be resolved")]
    RecipientNotFound { identifier: String },

    #[error("Rate limited by {endpoint}, retry after {retry_after:?}")]
    RateLimited {
        endpoint: String,
        retry_after: Option<Duration>,
    },
}

/// Route quoting errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouteError {
    #[error("Route provider request failed: {reason}")]
    ProviderFailed { reason: String },

    #[error("Invalid route quote: {reason}")]
    InvalidQuote { reason: String },

    #[error("Route slippage {slippage_bps} bps exceeds maximum {max_bps} bps")]
    SlippageExceeded { slippage_bps: u32, max_bps: u32 },

    #[error("Route expired at {expired_at}")]
    Expired {
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("Route was discarded by a flow reset")]
    Discarded,
}

/// Wallet submission errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WalletError {
    #[error("Wallet is not connected")]
    NotConnected,

    #[error("Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: String, available: String },

    #[error("User rejected the request")]
    Rejected,

    #[error("Transaction submission failed: {reason}")]
    SubmissionFailed { reason: String },

    #[error("Balance lookup failed: {reason}")]
    BalanceUnavailable { reason: String },
}

/// Controller-level errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    #[error("missing required data: {field}")]
    MissingData { field: &'static str },

    #[error("Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("please log in to continue")]
    NotLoggedIn,

    #[error("Payments to Peanut usernames can only be made on Arbitrum")]
    UsernameChainRestricted,

    #[error("This flow only supports the wallet token on the wallet chain")]
    CrossChainUnsupported,

    #[error("Cannot transition from {from:?} via {transition}")]
    InvalidTransition {
        from: FlowView,
        transition: &'static str,
    },

    #[error("Another submission is already in progress")]
    Busy,

    #[error("route not ready for cross-chain payment")]
    RouteNotReady,

    #[error("Route expired, refreshing quote")]
    RouteExpired,

    #[error("Cannot proceed: {reason}")]
    CannotProceed { reason: &'static str },
}

impl Error {
    /// Map errors into a structured surface for status/event consumers.
    pub fn to_flow_error_payload(&self) -> FlowErrorPayload {
        match self {
            Self::Config(err) => FlowErrorPayload::new(
                FlowErrorDomain::Unknown,
                "config.invalid",
                false,
                err.to_string(),
            ),
            Self::Backend(err) => match err {
                BackendError::RequestFailed { .. } => FlowErrorPayload::new(
                    FlowErrorDomain::Backend,
                    "backend.request_failed",
                    true,
                    err.to_string(),
                ),
                BackendError::Status { status, .. } => FlowErrorPayload::new(
                    FlowErrorDomain::Backend,
                    "backend.http_status",
                    *status >= 500,
                    err.to_string(),
                ),
                BackendError::RateLimited { .. } => FlowErrorPayload::new(
                    FlowErrorDomain::Backend,
                    "backend.rate_limited",
                    true,
                    err.to_string(),
                ),
                BackendError::InvalidResponse { .. } | BackendError::MissingChargeId => {
                    FlowErrorPayload::new(
                        FlowErrorDomain::Backend,
                        "backend.invalid_response",
                        false,
                        err.to_string(),
                    )
                }
                BackendError::ChargeNotFound { .. }
                | BackendError::InvalidRequestId { .. }
                | BackendError::RecipientNotFound { .. } => FlowErrorPayload::new(
                    FlowErrorDomain::Validation,
                    "validation.not_found",
                    false,
                    err.to_string(),
                ),
            },
            Self::Route(err) => match err {
                RouteError::Expired { .. } => FlowErrorPayload::new(
                    FlowErrorDomain::Route,
                    "route.expired",
                    true,
                    err.to_string(),
                ),
                RouteError::SlippageExceeded { .. } => FlowErrorPayload::new(
                    FlowErrorDomain::Route,
                    "route.slippage_exceeded",
                    true,
                    err.to_string(),
                ),
                RouteError::ProviderFailed { .. } => FlowErrorPayload::new(
                    FlowErrorDomain::Route,
                    "route.provider_failed",
                    true,
                    err.to_string(),
                ),
                RouteError::InvalidQuote { .. } | RouteError::Discarded => FlowErrorPayload::new(
                    FlowErrorDomain::Route,
                    "route.invalid_quote",
                    true,
                    err.to_string(),
                ),
            },
            Self::Wallet(err) => match err {
                WalletError::Rejected => FlowErrorPayload::new(
                    FlowErrorDomain::Wallet,
                    "wallet.rejected",
                    true,
                    err.to_string(),
                ),
                WalletError::NotConnected => FlowErrorPayload::new(
                    FlowErrorDomain::Auth,
                    "auth.wallet_not_connected",
                    false,
                    err.to_string(),
                ),
                WalletError::InsufficientBalance { .. } => FlowErrorPayload::new(
                    FlowErrorDomain::Validation,
                    "validation.insufficient_balance",
                    false,
                    err.to_string(),
                ),
                WalletError::SubmissionFailed { .. } | WalletError::BalanceUnavailable { .. } => {
                    FlowErrorPayload::new(
                        FlowErrorDomain::Wallet,
                        "wallet.submission_failed",
                        true,
                        err.to_string(),
                    )
                }
            },
            Self::Flow(err) => match err {
                FlowError::NotLoggedIn => FlowErrorPayload::new(
                    FlowErrorDomain::Auth,
                    "auth.login_required",
                    false,
                    err.to_string(),
                ),
                FlowError::RouteExpired | FlowError::RouteNotReady => FlowErrorPayload::new(
                    FlowErrorDomain::Route,
                    "route.not_ready",
                    true,
                    err.to_string(),
                ),
                FlowError::Busy => FlowErrorPayload::new(
                    FlowErrorDomain::Unknown,
                    "flow.busy",
                    true,
                    err.to_string(),
                ),
                _ => FlowErrorPayload::new(
                    FlowErrorDomain::Validation,
                    "validation.failed",
                    false,
                    err.to_string(),
                ),
            },
        }
    }

    /// Build a failed status payload from this error.
    pub fn to_flow_status_payload(&self, stage: FlowStage) -> FlowStatusPayload {
        FlowStatusPayload::new(stage, FlowStageState::Failed)
            .with_detail(self.to_string())
            .with_error(self.to_flow_error_payload())
    }
}

/// Known wallet/provider failure fragments and the message shown for them.
const WALLET_MESSAGE_TABLE: &[(&str, &str)] = &[
    ("insufficient funds", "You don't have enough funds."),
    (
        "user rejected",
        "Please confirm the transaction in your wallet.",
    ),
    (
        "network_error",
        "A network error occured. Please refresh and try again.",
    ),
    ("nonce_expired", "Nonce expired, please try again."),
    (
        "failed to get wallet client",
        "Please make sure your wallet is connected.",
    ),
    (
        "gas required exceeds allowance",
        "Gas required exceeds balance. Please confirm you have enough funds.",
    ),
];

fn classify_wallet_reason(reason: &str) -> Option<&'static str> {
    let lowered = reason.to_ascii_lowercase();
    WALLET_MESSAGE_TABLE
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, message)| *message)
}

/// Convert an error into the string shown inline next to the failing action.
pub fn user_message(err: &Error) -> String {
    match err {
        Error::Wallet(WalletError::Rejected) => {
            "Please confirm the transaction in your wallet.".to_string()
        }
        Error::Wallet(WalletError::NotConnected) => {
            "Please make sure your wallet is connected.".to_string()
        }
        Error::Wallet(WalletError::InsufficientBalance { .. }) => {
            "You don't have enough funds.".to_string()
        }
        Error::Wallet(WalletError::SubmissionFailed { reason })
        | Error::Wallet(WalletError::BalanceUnavailable { reason }) => {
            classify_wallet_reason(reason)
                .unwrap_or("Something failed. Please try again.")
                .to_string()
        }
        Error::Route(RouteError::Expired { .. }) | Error::Flow(FlowError::RouteExpired) => {
            "Quote expired. Fetching a new rate...".to_string()
        }
        Error::Route(RouteError::ProviderFailed { reason }) => classify_wallet_reason(reason)
            .map(str::to_string)
            .unwrap_or_else(|| "failed to calculate route".to_string()),
        Error::Route(err) => err.to_string(),
        Error::Backend(BackendError::RequestFailed { .. }) => {
            "A network error occured. Please refresh and try again.".to_string()
        }
        Error::Backend(err @ BackendError::InvalidRequestId { .. })
        | Error::Backend(err @ BackendError::MissingChargeId) => err.to_string(),
        Error::Backend(_) => "Something went wrong. Please try again later.".to_string(),
        Error::Flow(err) => err.to_string(),
        Error::Config(err) => err.to_string(),
    }
}

/// Result type alias for the payment flows.
pub type Result<T> = std::result::Result<T, Error>;
