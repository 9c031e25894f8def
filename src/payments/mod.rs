//! Payment flow orchestration.
//!
//! A flow sequences charge creation, optional cross-chain route quoting and
//! wallet submission. [`flow::PaymentFlow`] is the entry point; everything
//! it talks to is injected through [`clients::FlowDeps`].

pub mod clients;
pub mod expiry;
pub mod flow;
pub mod http;
pub mod kinds;
pub mod machine;
pub mod pot;
pub mod route;
pub mod types;

pub use clients::{
    AuthSession, ChargeApi, FlowDeps, PaymentRecorder, RecipientResolver, RouteProvider,
    StaticSession, StaticTokenCatalog, TokenCatalog, WalletClient,
};
pub use expiry::{ExpiryEvent, ExpiryTracker, ExpiryZone, TimeRemaining, spawn_expiry_watch};
pub use flow::{FlowEvent, FlowSnapshot, PaymentFlow};
pub use http::{HttpBackend, SquidRouteProvider};
pub use kinds::{ConfirmPolicy, FlowKind};
pub use machine::{FlowTransition, FlowView, next_view};
pub use pot::{ContributionSuggestion, suggest_contribution};
pub use route::RouteManager;
