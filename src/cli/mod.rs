//! `peanut-flows` operator commands.
//!
//! Read-only helpers for poking at a deployment: print the resolved
//! configuration, look up a charge, or quote a route the same way a
//! cross-chain flow would.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config::Config;
use crate::logging;
use crate::payments::clients::ChargeApi;
use crate::payments::expiry::ExpiryTracker;
use crate::payments::http::{HttpBackend, SquidRouteProvider};
use crate::payments::route::RouteManager;
use crate::payments::types::{
    ChainId, EvmAddress, RouteDestination, RouteRequest, RouteSource, parse_amount,
};

#[derive(Parser, Debug)]
#[command(name = "peanut-flows", version, about = "Peanut payment flow tooling")]
pub struct Cli {
    /// TOML config file (defaults to ~/.peanut/config.toml when present).
    #[arg(long, global = true, env = "PEANUT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the resolved configuration with secrets redacted.
    Config,

    /// Fetch a charge and print it as JSON.
    Charge {
        /// Charge UUID.
        id: Uuid,
    },

    /// Quote a route from the wallet token to another token/chain.
    Quote {
        /// Destination chain id.
        #[arg(long)]
        to_chain: u64,
        /// Destination token address.
        #[arg(long)]
        to_token: String,
        /// Destination token decimals.
        #[arg(long, default_value_t = 6)]
        to_decimals: u32,
        /// Address receiving the destination token.
        #[arg(long)]
        recipient: String,
        /// Amount of the destination token to deliver.
        #[arg(long)]
        amount: String,
        /// Payer address on the wallet chain.
        #[arg(long)]
        from: String,
        /// Treat `amount` as a USD amount spent from the wallet instead.
        #[arg(long)]
        usd: bool,
    },
}

/// Load config, install logging, dispatch.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env_with_toml(cli.config.as_deref())
        .context("failed to load configuration")?;
    logging::init(config.log_format);

    match cli.command {
        Command::Config => {
            print_config(&config);
            Ok(())
        }
        Command::Charge { id } => print_charge(&config, id).await,
        Command::Quote {
            to_chain,
            to_token,
            to_decimals,
            recipient,
            amount,
            from,
            usd,
        } => {
            let amount = parse_amount(&amount)?;
            let request = RouteRequest {
                source: RouteSource {
                    address: EvmAddress::parse(&from)?,
                    token_address: config.wallet.token_address.clone(),
                    token_decimals: config.wallet.token_decimals,
                    chain_id: config.wallet.chain_id.clone(),
                },
                destination: RouteDestination {
                    recipient_address: EvmAddress::parse(&recipient)?,
                    token_address: EvmAddress::parse(&to_token)?,
                    token_amount: amount,
                    token_decimals: to_decimals,
                    chain_id: ChainId::new(to_chain),
                },
                usd_amount: usd.then_some(amount),
            };
            print_quote(&config, &request).await
        }
    }
}

fn print_config(config: &Config) {
    let summary = config.redacted_summary();
    let width = summary.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    for (key, value) in summary {
        println!("{key:<width$}  {value}");
    }
}

async fn print_charge(config: &Config, id: Uuid) -> anyhow::Result<()> {
    let backend = HttpBackend::new(config.api.clone())?;
    let charge = backend
        .fetch_charge(id)
        .await
        .with_context(|| format!("failed to fetch charge {id}"))?;
    println!("{}", serde_json::to_string_pretty(&charge)?);
    Ok(())
}

async fn print_quote(config: &Config, request: &RouteRequest) -> anyhow::Result<()> {
    if !request.needs_route() {
        println!("Source and destination are the same token on the same chain; no route needed.");
        return Ok(());
    }

    let provider = SquidRouteProvider::new(config.squid.clone(), config.api.timeout)?;
    let routes = RouteManager::new(Arc::new(provider), config.route.clone());
    let route = routes
        .prepare(request)
        .await
        .context("failed to quote route")?;

    let tracker = ExpiryTracker::new(route.expiry, config.route.near_expiry_threshold);
    println!("kind          {:?}", route.kind);
    println!("send          {}", route.from_amount);
    println!("receive       {}", route.to_amount);
    println!("min received  {}", route.min_received);
    println!("slippage      {} bps", route.slippage_bps);
    println!("fees (USD)    {}", route.fee_costs_usd);
    println!("{}", tracker.label(Utc::now()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quote_arguments() {
        let cli = Cli::try_parse_from([
            "peanut-flows",
            "quote",
            "--to-chain",
            "137",
            "--to-token",
            "0xc2132D05D31c914a87C6611C10748AEb04B58e8F",
            "--recipient",
            "0x2222222222222222222222222222222222222222",
            "--amount",
            "10",
            "--from",
            "0x1111111111111111111111111111111111111111",
        ])
        .expect("valid arguments");

        match cli.command {
            Command::Quote {
                to_chain,
                to_decimals,
                usd,
                ..
            } => {
                assert_eq!(to_chain, 137);
                assert_eq!(to_decimals, 6);
                assert!(!usd);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_charge_with_global_config() {
        let cli = Cli::try_parse_from([
            "peanut-flows",
            "charge",
            "5f8a3c1e-2b7d-4e9f-8a1c-3d5e7f9a1b2c",
            "--config",
            "/tmp/peanut.toml",
        ])
        .expect("valid arguments");

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/peanut.toml")));
        assert!(matches!(cli.command, Command::Charge { .. }));
    }

    #[test]
    fn rejects_malformed_charge_id() {
        assert!(Cli::try_parse_from(["peanut-flows", "charge", "not-a-uuid"]).is_err());
    }
}
