//! peanut-flows: payment flow orchestration for the Peanut wallet.
//!
//! Each payment kind (direct send, request pay, pot contribution, crypto
//! withdrawal and friends) runs through one controller that creates a
//! backend charge, quotes a cross-chain route when the charge is not on the
//! wallet's own token and chain, submits through the wallet and records the
//! resulting hash.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod payments;
pub mod settings;

pub use config::Config;
pub use error::{Error, Result};
pub use payments::{FlowDeps, FlowKind, FlowView, PaymentFlow};
