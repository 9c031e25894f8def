//! Per-kind policy consumed by the shared controller.

use std::fmt;

use serde::Serialize;

use crate::payments::types::TransactionType;

/// When a kind routes through the CONFIRM view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmPolicy {
    Never,
    /// Only when the charge needs a route (different token or chain).
    WhenRouted,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    DirectSend,
    Send,
    ContributePot,
    RequestPay,
    SemanticRequest,
    CryptoWithdraw,
}

impl FlowKind {
    pub const ALL: [FlowKind; 6] = [
        Self::DirectSend,
        Self::Send,
        Self::ContributePot,
        Self::RequestPay,
        Self::SemanticRequest,
        Self::CryptoWithdraw,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectSend => "direct_send",
            Self::Send => "send",
            Self::ContributePot => "contribute_pot",
            Self::RequestPay => "request_pay",
            Self::SemanticRequest => "semantic_request",
            Self::CryptoWithdraw => "crypto_withdraw",
        }
    }

    pub fn transaction_type(self) -> TransactionType {
        match self {
            Self::DirectSend | Self::Send => TransactionType::DirectSend,
            Self::ContributePot | Self::RequestPay | Self::SemanticRequest => {
                TransactionType::Request
            }
            Self::CryptoWithdraw => TransactionType::Withdraw,
        }
    }

    pub fn confirm_policy(self) -> ConfirmPolicy {
        match self {
            Self::DirectSend | Self::Send | Self::ContributePot => ConfirmPolicy::Never,
            Self::RequestPay | Self::SemanticRequest => ConfirmPolicy::WhenRouted,
            Self::CryptoWithdraw => ConfirmPolicy::Always,
        }
    }

    /// Whether the user may pick a token or chain other than the wallet's.
    pub fn supports_cross_chain(self) -> bool {
        matches!(
            self,
            Self::RequestPay | Self::SemanticRequest | Self::CryptoWithdraw
        )
    }

    /// Pot contributions are charged against an existing request.
    pub fn needs_request(self) -> bool {
        matches!(self, Self::ContributePot)
    }

    pub fn requires_login(self) -> bool {
        true
    }

    /// Username recipients can only be paid on the wallet chain.
    pub fn restricts_username_chain(self) -> bool {
        matches!(self, Self::RequestPay | Self::SemanticRequest)
    }

    /// Reset also clears the recipient and token selection.
    pub fn full_form_reset(self) -> bool {
        matches!(self, Self::CryptoWithdraw)
    }

    /// Whether submit goes through CONFIRM for a charge with this routing need.
    pub fn wants_confirm(self, needs_route: bool) -> bool {
        match self.confirm_policy() {
            ConfirmPolicy::Never => false,
            ConfirmPolicy::WhenRouted => needs_route,
            ConfirmPolicy::Always => true,
        }
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_decisions() {
        assert!(!FlowKind::DirectSend.wants_confirm(true));
        assert!(!FlowKind::ContributePot.wants_confirm(true));
        assert!(FlowKind::RequestPay.wants_confirm(true));
        assert!(!FlowKind::SemanticRequest.wants_confirm(false));
        assert!(FlowKind::CryptoWithdraw.wants_confirm(false));
    }

    #[test]
    fn only_cross_chain_kinds_may_need_confirm_on_routes() {
        for kind in FlowKind::ALL {
            if kind.confirm_policy() != ConfirmPolicy::Never {
                assert!(kind.supports_cross_chain(), "{kind} confirms without routing");
            }
            assert!(kind.requires_login());
        }
    }

    #[test]
    fn transaction_types() {
        assert_eq!(
            FlowKind::Send.transaction_type(),
            TransactionType::DirectSend
        );
        assert_eq!(
            FlowKind::ContributePot.transaction_type(),
            TransactionType::Request
        );
        assert_eq!(
            FlowKind::CryptoWithdraw.transaction_type(),
            TransactionType::Withdraw
        );
    }
}
