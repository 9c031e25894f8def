//! Route ownership, validation and refresh coalescing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::{Mutex, RwLock};

use crate::config::RouteConfig;
use crate::error::RouteError;
use crate::payments::clients::RouteProvider;
use crate::payments::types::{Route, RouteQuote, RouteRequest};

const BPS_SCALE: u32 = 10_000;

#[derive(Debug, Default)]
struct RouteSlot {
    route: Option<Route>,
    /// Bumped every time a route is stored.
    generation: u64,
    /// Bumped on reset; quotes started under an older epoch are dropped.
    epoch: u64,
}

/// Holds the current route for one flow.
pub struct RouteManager {
    provider: Arc<dyn RouteProvider>,
    config: RouteConfig,
    slot: RwLock<RouteSlot>,
    /// Serializes refreshes so concurrent triggers share one quote.
    refresh_lock: Mutex<()>,
}

impl RouteManager {
    pub fn new(provider: Arc<dyn RouteProvider>, config: RouteConfig) -> Self {
        Self {
            provider,
            config,
            slot: RwLock::new(RouteSlot::default()),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    /// Quote and store a route for `request`.
    ///
    /// If another refresh stored a fresh route while this call waited for
    /// the refresh lock, that route is returned without quoting again.
    pub async fn prepare(&self, request: &RouteRequest) -> Result<Route, RouteError> {
        let (epoch, seen_generation) = {
            let slot = self.slot.read().await;
            (slot.epoch, slot.generation)
        };

        let _guard = self.refresh_lock.lock().await;

        {
            let slot = self.slot.read().await;
            if slot.epoch != epoch {
                return Err(RouteError::Discarded);
            }
            if slot.generation > seen_generation
                && let Some(route) = slot.route.as_ref()
                && !route.is_expired_at(Utc::now())
            {
                tracing::debug!(
                    generation = route.generation,
                    "reusing route stored by a concurrent refresh"
                );
                return Ok(route.clone());
            }
        }

        tracing::info!(
            from_chain = %request.source.chain_id,
            to_chain = %request.destination.chain_id,
            amount = %request.destination.token_amount,
            "quoting route"
        );
        let quote = self.provider.quote(request).await?;
        let mut route = self.validate(quote, Utc::now())?;

        let mut slot = self.slot.write().await;
        if slot.epoch != epoch {
            tracing::debug!("dropping route quoted before reset");
            return Err(RouteError::Discarded);
        }
        slot.generation += 1;
        route.generation = slot.generation;
        slot.route = Some(route.clone());

        tracing::info!(
            generation = route.generation,
            min_received = %route.min_received,
            expiry = %route.expiry,
            "route stored"
        );
        Ok(route)
    }

    /// Turn a provider quote into a route, enforcing the slippage policy.
    pub fn validate(&self, quote: RouteQuote, now: DateTime<Utc>) -> Result<Route, RouteError> {
        if quote.transactions.is_empty() {
            return Err(RouteError::InvalidQuote {
                reason: "quote carries no transactions".to_string(),
            });
        }
        if quote.from_amount <= Decimal::ZERO || quote.to_amount <= Decimal::ZERO {
            return Err(RouteError::InvalidQuote {
                reason: format!(
                    "non-positive amounts (from {}, to {})",
                    quote.from_amount, quote.to_amount
                ),
            });
        }
        if quote.expiry <= now {
            return Err(RouteError::Expired {
                expired_at: quote.expiry,
            });
        }

        let min_received = match quote.to_amount_min {
            Some(min) if min > Decimal::ZERO && min <= quote.to_amount => min,
            Some(min) => {
                return Err(RouteError::InvalidQuote {
                    reason: format!("minimum received {min} outside (0, {}]", quote.to_amount),
                });
            }
            None => {
                let keep_bps = BPS_SCALE.saturating_sub(self.config.default_slippage_bps);
                quote.to_amount * Decimal::from(keep_bps) / Decimal::from(BPS_SCALE)
            }
        };

        let slippage_bps = slippage_bps(quote.to_amount, min_received);
        if slippage_bps > self.config.max_slippage_bps {
            return Err(RouteError::SlippageExceeded {
                slippage_bps,
                max_bps: self.config.max_slippage_bps,
            });
        }

        Ok(Route {
            kind: quote.kind,
            from_amount: quote.from_amount,
            to_amount: quote.to_amount,
            min_received,
            slippage_bps,
            fee_costs_usd: quote.fee_costs_usd,
            transactions: quote.transactions,
            expiry: quote.expiry,
            generation: 0,
        })
    }

    pub async fn current(&self) -> Option<Route> {
        self.slot.read().await.route.clone()
    }

    /// The stored route, only while it is still valid at `now`.
    pub async fn usable_route(&self, now: DateTime<Utc>) -> Option<Route> {
        self.slot
            .read()
            .await
            .route
            .as_ref()
            .filter(|route| !route.is_expired_at(now))
            .cloned()
    }

    pub async fn generation(&self) -> u64 {
        self.slot.read().await.generation
    }

    /// Drop the route and invalidate quotes still in flight.
    pub async fn reset(&self) {
        let mut slot = self.slot.write().await;
        slot.route = None;
        slot.epoch += 1;
    }
}

/// `(to - min) / to` in basis points, rounded up.
fn slippage_bps(to_amount: Decimal, min_received: Decimal) -> u32 {
    let bps = ((to_amount - min_received) / to_amount * Decimal::from(BPS_SCALE)).ceil();
    bps.to_u32().unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use crate::payments::types::{
        ChainId, EvmAddress, PreparedTransaction, RouteDestination, RouteKind, RouteSource,
    };

    const USDC_ARB: &str = "0xaf88d065e77c8cC2239327C5EDb3A432268e5831";
    const USDT_POL: &str = "0xc2132D05D31c914a87C6611C10748AEb04B58e8F";

    struct CountingProvider {
        calls: AtomicUsize,
        delay: Duration,
        to_amount_min: Option<Decimal>,
    }

    impl CountingProvider {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                to_amount_min: Some(dec!(9.95)),
            }
        }
    }

    #[async_trait]
    impl RouteProvider for CountingProvider {
        async fn quote(&self, _request: &RouteRequest) -> Result<RouteQuote, RouteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(quote(self.to_amount_min, Utc::now() + chrono::Duration::seconds(60)))
        }
    }

    fn quote(to_amount_min: Option<Decimal>, expiry: DateTime<Utc>) -> RouteQuote {
        RouteQuote {
            kind: RouteKind::Rfq,
            from_amount: dec!(10.04),
            to_amount: dec!(10),
            to_amount_min,
            fee_costs_usd: dec!(0.03),
            transactions: vec![PreparedTransaction {
                to: EvmAddress::parse(USDC_ARB).unwrap(),
                data: Some("0xdeadbeef".to_string()),
                value: 0,
            }],
            expiry,
        }
    }

    fn request() -> RouteRequest {
        let payer = EvmAddress::parse("0x1111111111111111111111111111111111111111").unwrap();
        RouteRequest {
            source: RouteSource {
                address: payer.clone(),
                token_address: EvmAddress::parse(USDC_ARB).unwrap(),
                token_decimals: 6,
                chain_id: ChainId::new(42161),
            },
            destination: RouteDestination {
                recipient_address: payer,
                token_address: EvmAddress::parse(USDT_POL).unwrap(),
                token_amount: dec!(10),
                token_decimals: 6,
                chain_id: ChainId::new(137),
            },
            usd_amount: None,
        }
    }

    fn manager(provider: Arc<CountingProvider>) -> RouteManager {
        RouteManager::new(provider, RouteConfig::default())
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_quote() {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(50)));
        let routes = manager(provider.clone());
        let req = request();

        let (timer, user) = tokio::join!(routes.prepare(&req), routes.prepare(&req));

        let timer = timer.expect("timer refresh");
        let user = user.expect("user refresh");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(timer.generation, 1);
        assert_eq!(user.generation, 1);
    }

    #[tokio::test]
    async fn sequential_refreshes_quote_again() {
        let provider = Arc::new(CountingProvider::new(Duration::ZERO));
        let routes = manager(provider.clone());

        routes.prepare(&request()).await.unwrap();
        let second = routes.prepare(&request()).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.generation, 2);
        assert_eq!(routes.current().await.unwrap().generation, 2);
    }

    #[tokio::test]
    async fn reset_discards_in_flight_quote() {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(50)));
        let routes = Arc::new(manager(provider));

        let pending = {
            let routes = routes.clone();
            tokio::spawn(async move { routes.prepare(&request()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        routes.reset().await;

        let result = pending.await.expect("join");
        assert!(matches!(result, Err(RouteError::Discarded)));
        assert!(routes.current().await.is_none());
    }

    #[tokio::test]
    async fn expired_route_is_never_usable() {
        let provider = Arc::new(CountingProvider::new(Duration::ZERO));
        let routes = manager(provider);
        let route = routes.prepare(&request()).await.unwrap();

        assert!(routes.usable_route(Utc::now()).await.is_some());
        let later = route.expiry + chrono::Duration::seconds(1);
        assert!(routes.usable_route(later).await.is_none());
        assert!(routes.current().await.is_some());
    }

    #[test]
    fn derives_min_received_from_default_slippage() {
        let routes = manager(Arc::new(CountingProvider::new(Duration::ZERO)));
        let now = Utc::now();
        let route = routes
            .validate(quote(None, now + chrono::Duration::seconds(30)), now)
            .unwrap();

        assert_eq!(route.min_received, dec!(9.9));
        assert_eq!(route.slippage_bps, 100);
        assert!(route.min_received < route.to_amount);
    }

    #[test]
    fn rejects_bad_quotes() {
        let routes = manager(Arc::new(CountingProvider::new(Duration::ZERO)));
        let now = Utc::now();
        let future = now + chrono::Duration::seconds(30);

        let slippy = routes.validate(quote(Some(dec!(9)), future), now);
        assert!(matches!(
            slippy,
            Err(RouteError::SlippageExceeded {
                slippage_bps: 1000,
                max_bps: 300
            })
        ));

        let stale = routes.validate(quote(Some(dec!(9.95)), now), now);
        assert!(matches!(stale, Err(RouteError::Expired { .. })));

        let mut empty = quote(Some(dec!(9.95)), future);
        empty.transactions.clear();
        assert!(matches!(
            routes.validate(empty, now),
            Err(RouteError::InvalidQuote { .. })
        ));

        let mut zero = quote(Some(dec!(9.95)), future);
        zero.from_amount = Decimal::ZERO;
        assert!(matches!(
            routes.validate(zero, now),
            Err(RouteError::InvalidQuote { .. })
        ));
    }
}
