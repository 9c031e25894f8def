//! The payment flow controller.
//!
//! One [`PaymentFlow`] drives one payment from the amount form to the
//! status screen. Every flow kind shares this controller; the differences
//! live in [`FlowKind`]'s policy methods.
//!
//! Flow state sits behind a tokio `RwLock` that is never held across a
//! remote call: commands copy what they need, release the lock, call the
//! backend or wallet, then re-acquire it to store the outcome. The one lock
//! that does span a remote call is [`RouteManager`]'s refresh lock, held
//! over the provider quote so concurrent refreshes share a single quote.
//!
//! Form commands only apply on INITIAL; from CONFIRM, callers go `back()`
//! first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::RouteConfig;
use crate::error::{
    BackendError, Error, FlowError, FlowStage, FlowStageState, FlowStatusPayload, RouteError,
    WalletError, user_message,
};
use crate::payments::clients::FlowDeps;
use crate::payments::expiry::{ExpiryEvent, ExpiryTracker, spawn_expiry_watch};
use crate::payments::kinds::FlowKind;
use crate::payments::machine::{FlowTransition, FlowView, next_view};
use crate::payments::pot::{ContributionSuggestion, suggest_contribution};
use crate::payments::route::RouteManager;
use crate::payments::types::{
    Attachment, ChainId, Charge, ChargeRequest, EvmAddress, FormData, Payment, PaymentRecord,
    Recipient, RecipientKind, RequestSummary, Route, RouteDestination, RouteKind, RouteRequest,
    RouteSource, TokenInfo, TokenSelection, TxHash, parse_amount,
};

const EVENT_CAPACITY: usize = 64;
const CURRENCY_CODE: &str = "USD";

/// Notifications for whoever renders the flow.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    ViewChanged { from: FlowView, to: FlowView },
    ChargeReady { charge_id: Uuid },
    RouteUpdated { generation: u64 },
    RouteExpired { generation: u64 },
    PaymentRecorded { payment_id: Uuid, tx_hash: TxHash },
    Error { message: String },
    Status(FlowStatusPayload),
}

/// Read-only view of a flow, cheap to serialize for a front end.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    pub kind: FlowKind,
    pub view: FlowView,
    pub form: FormData,
    pub charge: Option<Charge>,
    pub request: Option<RequestSummary>,
    pub suggestion: Option<ContributionSuggestion>,
    pub route: Option<Route>,
    pub route_expired: bool,
    pub expiry_label: Option<String>,
    pub payment: Option<Payment>,
    pub tx_hash: Option<TxHash>,
    pub error: Option<String>,
    pub is_success: bool,
    pub balance: Option<Decimal>,
    pub processing: bool,
    pub can_proceed: bool,
}

#[derive(Debug, Default)]
struct FlowState {
    view: FlowView,
    form: FormData,
    charge: Option<Charge>,
    request: Option<RequestSummary>,
    suggestion: Option<ContributionSuggestion>,
    route_expired: bool,
    payment: Option<Payment>,
    tx_hash: Option<TxHash>,
    error: Option<String>,
    is_success: bool,
    balance: Option<Decimal>,
}

/// The wallet's own asset: what direct sends move and routes start from.
#[derive(Debug, Clone)]
struct WalletAsset {
    chain_id: ChainId,
    token: TokenInfo,
}

impl WalletAsset {
    fn selection(&self) -> TokenSelection {
        TokenSelection {
            chain_id: self.chain_id.clone(),
            token: self.token.clone(),
        }
    }
}

struct Inner {
    kind: FlowKind,
    deps: FlowDeps,
    wallet: WalletAsset,
    routes: RouteManager,
    state: RwLock<FlowState>,
    /// Set while a submit or confirm is outstanding.
    processing: AtomicBool,
    events: broadcast::Sender<FlowEvent>,
    watch: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the processing flag when the command finishes, however it ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handle to one flow instance. Clones share the same flow.
#[derive(Clone)]
pub struct PaymentFlow {
    inner: Arc<Inner>,
}

impl PaymentFlow {
    pub fn new(kind: FlowKind, deps: FlowDeps, route_config: RouteConfig) -> Self {
        let (chain_id, token) = deps.tokens.wallet_token();
        let wallet = WalletAsset { chain_id, token };
        let routes = RouteManager::new(deps.routes.clone(), route_config);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let state = FlowState {
            form: FormData {
                selection: Some(wallet.selection()),
                ..FormData::default()
            },
            ..FlowState::default()
        };

        Self {
            inner: Arc::new(Inner {
                kind,
                deps,
                wallet,
                routes,
                state: RwLock::new(state),
                processing: AtomicBool::new(false),
                events,
                watch: Mutex::new(None),
            }),
        }
    }

    pub fn kind(&self) -> FlowKind {
        self.inner.kind
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.inner.events.subscribe()
    }

    pub async fn snapshot(&self) -> FlowSnapshot {
        let route = self.inner.routes.current().await;
        let now = Utc::now();
        let expiry_label = route.as_ref().map(|route| {
            ExpiryTracker::new(route.expiry, self.inner.routes.config().near_expiry_threshold)
                .label(now)
        });

        let state = self.inner.state.read().await;
        FlowSnapshot {
            kind: self.inner.kind,
            view: state.view,
            form: state.form.clone(),
            charge: state.charge.clone(),
            request: state.request.clone(),
            suggestion: state.suggestion,
            route,
            route_expired: state.route_expired,
            expiry_label,
            payment: state.payment.clone(),
            tx_hash: state.tx_hash.clone(),
            error: state.error.clone(),
            is_success: state.is_success,
            balance: state.balance,
            processing: self.is_processing(),
            can_proceed: self.can_proceed_with(&state),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    // ── Form commands ──────────────────────────────────────────────

    pub async fn set_amount(&self, raw: &str) -> Result<(), FlowError> {
        let amount = parse_amount(raw)?;
        if amount.is_sign_negative() {
            return Err(FlowError::InvalidAmount {
                reason: "amount cannot be negative".to_string(),
            });
        }
        let mut state = self.inner.state.write().await;
        ensure_editable(&state, "set_amount")?;
        if state.form.amount != raw.trim() {
            state.form.amount = raw.trim().to_string();
            state.charge = None;
        }
        Ok(())
    }

    pub async fn set_usd_amount(&self, raw: &str) -> Result<(), FlowError> {
        let usd = parse_amount(raw)?;
        if usd.is_sign_negative() {
            return Err(FlowError::InvalidAmount {
                reason: "USD amount cannot be negative".to_string(),
            });
        }
        let mut state = self.inner.state.write().await;
        ensure_editable(&state, "set_usd_amount")?;
        if state.form.usd_amount != raw.trim() {
            state.form.usd_amount = raw.trim().to_string();
            state.charge = None;
        }
        Ok(())
    }

    pub async fn set_recipient(&self, recipient: Recipient) -> Result<(), FlowError> {
        let mut state = self.inner.state.write().await;
        ensure_editable(&state, "set_recipient")?;
        if state.form.recipient.as_ref() != Some(&recipient) {
            state.form.recipient = Some(recipient);
            state.charge = None;
        }
        Ok(())
    }

    /// Classify `identifier` and resolve usernames or ENS names to an
    /// address before storing it as the recipient.
    pub async fn resolve_recipient(&self, identifier: &str) -> Result<Recipient, Error> {
        ensure_editable(&*self.inner.state.read().await, "resolve_recipient")?;
        let mut recipient = Recipient::from_identifier(identifier);
        if !recipient.is_resolved() {
            let address = self
                .inner
                .deps
                .resolver
                .resolve(&recipient.identifier, recipient.kind)
                .await;
            match address {
                Ok(address) => recipient.resolved_address = Some(address),
                Err(e) => return Err(self.store_error(e.into()).await),
            }
        }
        tracing::debug!(
            identifier = %recipient.identifier,
            kind = ?recipient.kind,
            "recipient resolved"
        );
        self.set_recipient(recipient.clone()).await?;
        Ok(recipient)
    }

    /// Pick the token and chain to pay with. Kinds without cross-chain
    /// support only accept the wallet asset.
    pub async fn select_token(&self, selection: TokenSelection) -> Result<(), FlowError> {
        if !self.inner.kind.supports_cross_chain()
            && !selection.same_asset(&self.inner.wallet.chain_id, &self.inner.wallet.token.address)
        {
            return Err(FlowError::CrossChainUnsupported);
        }
        let mut state = self.inner.state.write().await;
        ensure_editable(&state, "select_token")?;
        if state.form.selection.as_ref() != Some(&selection) {
            state.form.selection = Some(selection);
            state.charge = None;
        }
        Ok(())
    }

    pub async fn set_attachment(&self, attachment: Attachment) -> Result<(), FlowError> {
        let mut state = self.inner.state.write().await;
        ensure_editable(&state, "set_attachment")?;
        state.form.attachment = attachment;
        state.charge = None;
        Ok(())
    }

    /// Attach the request (pot) this payment contributes to. Pot
    /// contributions get a suggested amount seeded into an empty form.
    pub async fn set_request(&self, id: Uuid) -> Result<RequestSummary, Error> {
        ensure_editable(&*self.inner.state.read().await, "set_request")?;
        let summary = match self.inner.deps.charges.fetch_request(id).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "request lookup failed");
                let err = BackendError::InvalidRequestId { id };
                return Err(self.store_error(err.into()).await);
            }
        };

        let suggestion = summary.total_amount.map(|total| {
            let collected: Decimal = summary.contributions.iter().copied().sum();
            suggest_contribution(total, collected, &summary.contributions)
        });

        let mut state = self.inner.state.write().await;
        ensure_editable(&state, "set_request")?;
        state.form.request_id = Some(id);
        state.form.recipient = Some(Recipient::address(summary.recipient_address.clone()));
        state.request = Some(summary.clone());
        state.suggestion = suggestion;
        state.charge = None;
        if self.inner.kind.needs_request()
            && state.form.amount.is_empty()
            && let Some(suggestion) = suggestion.filter(|s| s.amount > Decimal::ZERO)
        {
            state.form.amount = suggestion.amount.to_string();
        }
        Ok(summary)
    }

    pub async fn clear_error(&self) {
        self.inner.state.write().await.error = None;
    }

    pub async fn refresh_balance(&self) -> Result<Decimal, Error> {
        match self.inner.deps.wallet.balance().await {
            Ok(balance) => {
                self.inner.state.write().await.balance = Some(balance);
                Ok(balance)
            }
            Err(e) => Err(self.store_error(e.into()).await),
        }
    }

    pub async fn can_proceed(&self) -> bool {
        let state = self.inner.state.read().await;
        self.can_proceed_with(&state)
    }

    fn can_proceed_with(&self, state: &FlowState) -> bool {
        let amount = parse_amount(&state.form.amount).unwrap_or(Decimal::ZERO);
        if amount <= Decimal::ZERO {
            return false;
        }
        if !state.form.recipient.as_ref().is_some_and(Recipient::is_resolved) {
            return false;
        }
        if state.form.selection.is_none() {
            return false;
        }
        if self.inner.kind.needs_request() && state.form.request_id.is_none() {
            return false;
        }
        let spend = spend_amount(&state.form).unwrap_or(amount);
        state.balance.is_some_and(|balance| balance >= spend)
    }

    // ── Submission ─────────────────────────────────────────────────

    /// Leave INITIAL: create (or reuse) the charge, then either pay it
    /// directly or move to CONFIRM and quote a route.
    pub async fn submit(&self) -> Result<FlowView, Error> {
        let _guard = self.begin_processing()?;
        match self.submit_inner().await {
            Ok(view) => Ok(view),
            Err(e) => Err(self.store_error(e).await),
        }
    }

    async fn submit_inner(&self) -> Result<FlowView, Error> {
        let (view, form, existing) = {
            let state = self.inner.state.read().await;
            (state.view, state.form.clone(), state.charge.clone())
        };
        next_view(view, FlowTransition::Proceed { confirm: false })?;

        if self.inner.kind.requires_login() && !self.inner.deps.auth.is_logged_in() {
            return Err(FlowError::NotLoggedIn.into());
        }

        let amount = parse_amount(&form.amount)?;
        if amount <= Decimal::ZERO {
            return Err(FlowError::InvalidAmount {
                reason: "amount must be greater than zero".to_string(),
            }
            .into());
        }
        let recipient = form
            .recipient
            .clone()
            .ok_or(FlowError::MissingData { field: "recipient" })?;
        let recipient_address = recipient
            .resolved_address
            .clone()
            .ok_or(FlowError::MissingData {
                field: "recipient address",
            })?;
        let selection = form
            .selection
            .clone()
            .ok_or(FlowError::MissingData { field: "token" })?;

        if self.inner.kind.restricts_username_chain()
            && recipient.kind == RecipientKind::Username
            && selection.chain_id != self.inner.wallet.chain_id
        {
            return Err(FlowError::UsernameChainRestricted.into());
        }
        if self.inner.kind.needs_request() && form.request_id.is_none() {
            return Err(FlowError::MissingData {
                field: "request id",
            }
            .into());
        }

        let balance = self.inner.deps.wallet.balance().await?;
        self.inner.state.write().await.balance = Some(balance);
        let spend = spend_amount(&form).unwrap_or(amount);
        if balance < spend {
            return Err(WalletError::InsufficientBalance {
                needed: spend.to_string(),
                available: balance.to_string(),
            }
            .into());
        }

        let charge = match existing {
            Some(charge) => {
                tracing::debug!(charge_id = %charge.uuid, "reusing existing charge");
                charge
            }
            None => {
                let request = self.charge_request(&form, amount, recipient_address, selection);
                self.create_charge(&request).await?
            }
        };

        let same_asset =
            charge.is_same_asset(&self.inner.wallet.chain_id, &self.inner.wallet.token.address);
        if !same_asset && !self.inner.kind.supports_cross_chain() {
            return Err(FlowError::CrossChainUnsupported.into());
        }

        if !self.inner.kind.wants_confirm(!same_asset) {
            self.pay_direct(&charge).await?;
            self.transition(FlowTransition::Proceed { confirm: false })
                .await?;
            return Ok(FlowView::Status);
        }

        self.transition(FlowTransition::Proceed { confirm: true })
            .await?;
        if !same_asset {
            self.refresh_route().await?;
        }
        Ok(FlowView::Confirm)
    }

    fn charge_request(
        &self,
        form: &FormData,
        amount: Decimal,
        recipient_address: EvmAddress,
        selection: TokenSelection,
    ) -> ChargeRequest {
        let attachment = (!form.attachment.is_empty()).then(|| form.attachment.clone());
        ChargeRequest {
            token_amount: amount,
            token_address: selection.token.address,
            chain_id: selection.chain_id,
            token_symbol: selection.token.symbol,
            token_decimals: selection.token.decimals,
            recipient_address,
            transaction_type: self.inner.kind.transaction_type(),
            request_id: form.request_id,
            reference: form.attachment.message.clone(),
            attachment,
            currency_amount: spend_amount(form).unwrap_or(amount),
            currency_code: CURRENCY_CODE.to_string(),
        }
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge, Error> {
        self.report(FlowStatusPayload::new(FlowStage::Charge, FlowStageState::Started));

        if let Some(id) = request.request_id
            && let Err(e) = self.inner.deps.charges.fetch_request(id).await
        {
            tracing::warn!(request_id = %id, error = %e, "request validation failed");
            return Err(BackendError::InvalidRequestId { id }.into());
        }

        let charge = self.inner.deps.charges.create_charge(request).await?;
        tracing::info!(
            flow = %self.inner.kind,
            charge_id = %charge.uuid,
            amount = %charge.token_amount,
            chain = %charge.chain_id,
            "charge created"
        );

        self.inner.state.write().await.charge = Some(charge.clone());
        self.emit(FlowEvent::ChargeReady {
            charge_id: charge.uuid,
        });
        self.report(
            FlowStatusPayload::new(FlowStage::Charge, FlowStageState::Completed)
                .with_detail(charge.uuid.to_string()),
        );
        Ok(charge)
    }

    /// Send the wallet token straight to the charge recipient.
    async fn pay_direct(&self, charge: &Charge) -> Result<Payment, Error> {
        let payer = self.wallet_address()?;
        self.report(
            FlowStatusPayload::new(FlowStage::Submission, FlowStageState::Started)
                .with_detail("direct transfer"),
        );
        let tx_hash = self
            .inner
            .deps
            .wallet
            .send_money(&charge.recipient_address, charge.token_amount)
            .await?;

        let record = PaymentRecord {
            charge_id: charge.uuid,
            chain_id: self.inner.wallet.chain_id.clone(),
            tx_hash: tx_hash.clone(),
            token_address: self.inner.wallet.token.address.clone(),
            payer_address: payer,
            source_chain_id: None,
            source_token_address: None,
            source_token_symbol: None,
        };
        self.record(record).await
    }

    /// Submit the current route's transactions.
    async fn pay_routed(&self, charge: &Charge, route: &Route) -> Result<Payment, Error> {
        let payer = self.wallet_address()?;
        self.report(
            FlowStatusPayload::new(FlowStage::Submission, FlowStageState::Started)
                .with_detail(format!("route generation {}", route.generation)),
        );
        let tx_hash = self
            .inner
            .deps
            .wallet
            .send_transactions(&route.transactions)
            .await?;

        let record = PaymentRecord {
            charge_id: charge.uuid,
            chain_id: self.inner.wallet.chain_id.clone(),
            tx_hash: tx_hash.clone(),
            token_address: self.inner.wallet.token.address.clone(),
            payer_address: payer,
            source_chain_id: Some(self.inner.wallet.chain_id.clone()),
            source_token_address: Some(self.inner.wallet.token.address.clone()),
            source_token_symbol: Some(self.inner.wallet.token.symbol.clone()),
        };
        self.record(record).await
    }

    async fn record(&self, record: PaymentRecord) -> Result<Payment, Error> {
        self.inner.state.write().await.tx_hash = Some(record.tx_hash.clone());
        self.report(
            FlowStatusPayload::new(FlowStage::Submission, FlowStageState::Completed)
                .with_detail(record.tx_hash.to_string()),
        );

        self.report(FlowStatusPayload::new(
            FlowStage::Recording,
            FlowStageState::Started,
        ));
        let payment = self.inner.deps.recorder.record_payment(&record).await?;
        tracing::info!(
            flow = %self.inner.kind,
            charge_id = %record.charge_id,
            payment_id = %payment.uuid,
            tx_hash = %record.tx_hash,
            "payment recorded"
        );

        {
            let mut state = self.inner.state.write().await;
            state.payment = Some(payment.clone());
            state.is_success = true;
            state.error = None;
        }
        self.emit(FlowEvent::PaymentRecorded {
            payment_id: payment.uuid,
            tx_hash: record.tx_hash,
        });
        self.report(FlowStatusPayload::new(
            FlowStage::Recording,
            FlowStageState::Completed,
        ));
        Ok(payment)
    }

    fn wallet_address(&self) -> Result<EvmAddress, WalletError> {
        self.inner
            .deps
            .wallet
            .address()
            .ok_or(WalletError::NotConnected)
    }

    // ── Routes ─────────────────────────────────────────────────────

    /// Quote a route for the current charge. Charges on the wallet asset
    /// need none and return `Ok(None)`.
    pub async fn prepare_route(&self) -> Result<Option<Route>, Error> {
        match self.refresh_route().await {
            Ok(route) => Ok(route),
            Err(Error::Route(RouteError::Discarded)) => Ok(None),
            Err(e) => Err(self.store_error(e).await),
        }
    }

    async fn refresh_route(&self) -> Result<Option<Route>, Error> {
        let (view, charge, form) = {
            let state = self.inner.state.read().await;
            (state.view, state.charge.clone(), state.form.clone())
        };
        if view != FlowView::Confirm {
            return Err(FlowError::InvalidTransition {
                from: view,
                transition: "prepare_route",
            }
            .into());
        }
        let charge = charge.ok_or(FlowError::MissingData { field: "charge" })?;
        if charge.is_same_asset(&self.inner.wallet.chain_id, &self.inner.wallet.token.address) {
            return Ok(None);
        }

        let request = self.route_request(&charge, &form)?;
        self.report(
            FlowStatusPayload::new(FlowStage::Route, FlowStageState::Started)
                .with_detail(format!("{} -> {}", request.source.chain_id, request.destination.chain_id)),
        );

        let route = match self.inner.routes.prepare(&request).await {
            Ok(route) => route,
            Err(e) => {
                let err = Error::from(e);
                self.report(err.to_flow_status_payload(FlowStage::Route));
                return Err(err);
            }
        };

        if self.inner.kind == FlowKind::CryptoWithdraw && route.kind == RouteKind::Swap {
            self.inner.routes.reset().await;
            return Err(RouteError::InvalidQuote {
                reason: "No route found to send from Peanut to this token pair".to_string(),
            }
            .into());
        }

        self.inner.state.write().await.route_expired = false;
        self.emit(FlowEvent::RouteUpdated {
            generation: route.generation,
        });
        self.report(
            FlowStatusPayload::new(FlowStage::Route, FlowStageState::Completed)
                .with_detail(format!("min received {}", route.min_received)),
        );
        self.start_expiry_watch(&route).await;
        Ok(Some(route))
    }

    fn route_request(&self, charge: &Charge, form: &FormData) -> Result<RouteRequest, Error> {
        let payer = self.wallet_address()?;
        // Withdrawals spend a fixed amount of the wallet token.
        let usd_amount = if self.inner.kind == FlowKind::CryptoWithdraw {
            Some(charge.token_amount)
        } else {
            spend_amount(form)
        };
        Ok(RouteRequest {
            source: RouteSource {
                address: payer,
                token_address: self.inner.wallet.token.address.clone(),
                token_decimals: self.inner.wallet.token.decimals,
                chain_id: self.inner.wallet.chain_id.clone(),
            },
            destination: RouteDestination {
                recipient_address: charge.recipient_address.clone(),
                token_address: charge.token_address.clone(),
                token_amount: charge.token_amount,
                token_decimals: charge.token_decimals,
                chain_id: charge.chain_id.clone(),
            },
            usd_amount,
        })
    }

    async fn start_expiry_watch(&self, route: &Route) {
        let (sink, mut events) = mpsc::channel(4);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let refetch_enabled = {
            let weak = weak.clone();
            move || {
                weak.upgrade()
                    .is_some_and(|inner| !inner.processing.load(Ordering::SeqCst))
            }
        };
        let watch = spawn_expiry_watch(
            route.expiry,
            self.inner.routes.config(),
            refetch_enabled,
            sink,
        );

        // Ends on its own once the watch above is aborted or finishes.
        let generation = route.generation;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                PaymentFlow { inner }.on_expiry_event(generation, event).await;
            }
        });

        if let Some(previous) = self.inner.watch.lock().await.replace(watch) {
            previous.abort();
        }
    }

    async fn stop_expiry_watch(&self) {
        if let Some(watch) = self.inner.watch.lock().await.take() {
            watch.abort();
        }
    }

    fn on_expiry_event(self, generation: u64, event: ExpiryEvent) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let current = self.inner.routes.generation().await;
            if current != generation {
                tracing::debug!(generation, current, ?event, "ignoring stale expiry event");
                return;
            }
            match event {
                ExpiryEvent::NearExpiry => self.handle_route_near_expiry().await,
                ExpiryEvent::Expired => self.handle_route_expired().await,
            }
        })
    }

    /// Refresh ahead of expiry, unless a submission is in flight.
    pub async fn handle_route_near_expiry(&self) {
        if self.is_processing() {
            tracing::debug!("skipping near-expiry refresh while processing");
            return;
        }
        if self.inner.state.read().await.view != FlowView::Confirm {
            return;
        }
        if let Err(e) = self.prepare_route().await {
            tracing::warn!(error = %e, "near-expiry route refresh failed");
        }
    }

    pub async fn handle_route_expired(&self) {
        let generation = self.inner.routes.generation().await;
        let view = {
            let mut state = self.inner.state.write().await;
            state.route_expired = true;
            state.view
        };
        self.emit(FlowEvent::RouteExpired { generation });
        tracing::info!(flow = %self.inner.kind, generation, "route expired");

        if view == FlowView::Confirm && !self.is_processing() {
            if let Err(e) = self.prepare_route().await {
                tracing::warn!(error = %e, "expired route refresh failed");
            }
        }
    }

    /// Pay the charge from CONFIRM. An expired or missing route is never
    /// submitted: a refresh is started and the call fails instead.
    pub async fn confirm(&self) -> Result<Payment, Error> {
        let _guard = self.begin_processing()?;
        match self.confirm_inner().await {
            Ok(payment) => Ok(payment),
            Err(e) => Err(self.store_error(e).await),
        }
    }

    async fn confirm_inner(&self) -> Result<Payment, Error> {
        let (view, charge) = {
            let state = self.inner.state.read().await;
            (state.view, state.charge.clone())
        };
        next_view(view, FlowTransition::Settled)?;
        let charge = charge.ok_or(FlowError::MissingData { field: "charge" })?;

        let payment = if charge
            .is_same_asset(&self.inner.wallet.chain_id, &self.inner.wallet.token.address)
        {
            self.pay_direct(&charge).await?
        } else {
            let Some(route) = self.inner.routes.usable_route(Utc::now()).await else {
                let had_route = self.inner.routes.current().await.is_some();
                if had_route {
                    self.inner.state.write().await.route_expired = true;
                }
                tracing::info!(had_route, "no usable route at confirm, refreshing");
                if let Err(e) = self.refresh_route().await {
                    tracing::warn!(error = %e, "route refresh after confirm failed");
                }
                return Err(if had_route {
                    FlowError::RouteExpired
                } else {
                    FlowError::RouteNotReady
                }
                .into());
            };
            self.pay_routed(&charge, &route).await?
        };

        self.stop_expiry_watch().await;
        self.transition(FlowTransition::Settled).await?;
        Ok(payment)
    }

    // ── Navigation ─────────────────────────────────────────────────

    /// Open an existing charge. Paid charges go straight to RECEIPT; an
    /// unpaid one seeds the form and is only accepted on INITIAL.
    pub async fn load_charge(&self, id: Uuid) -> Result<FlowView, Error> {
        let charge = match self.inner.deps.charges.fetch_charge(id).await {
            Ok(charge) => charge,
            Err(e) => return Err(self.store_error(e.into()).await),
        };

        if charge.is_paid() {
            tracing::info!(charge_id = %id, "charge already paid");
            next_view(self.inner.state.read().await.view, FlowTransition::AlreadyPaid)?;
            self.stop_expiry_watch().await;
            self.inner.routes.reset().await;
            {
                let mut state = self.inner.state.write().await;
                state.charge = Some(charge);
                state.route_expired = false;
            }
            self.transition(FlowTransition::AlreadyPaid).await?;
            return Ok(FlowView::Receipt);
        }

        let view = self.inner.state.read().await.view;
        if let Err(e) = ensure_view(view, "load_charge") {
            return Err(self.store_error(e.into()).await);
        }

        if !self.inner.kind.supports_cross_chain()
            && !charge.is_same_asset(&self.inner.wallet.chain_id, &self.inner.wallet.token.address)
        {
            return Err(self
                .store_error(FlowError::CrossChainUnsupported.into())
                .await);
        }

        let token = self
            .inner
            .deps
            .tokens
            .token(&charge.chain_id, &charge.token_address)
            .unwrap_or_else(|| TokenInfo {
                address: charge.token_address.clone(),
                symbol: charge.token_symbol.clone(),
                decimals: charge.token_decimals,
            });

        let mut state = self.inner.state.write().await;
        ensure_editable(&state, "load_charge")?;
        state.form.amount = charge.token_amount.to_string();
        state.form.usd_amount = charge
            .currency_amount
            .map(|usd| usd.to_string())
            .unwrap_or_default();
        state.form.recipient = Some(Recipient::address(charge.recipient_address.clone()));
        state.form.selection = Some(TokenSelection {
            chain_id: charge.chain_id.clone(),
            token,
        });
        state.charge = Some(charge);
        Ok(state.view)
    }

    /// CONFIRM goes back to the form; STATUS starts over.
    pub async fn back(&self) -> Result<FlowView, Error> {
        let view = self.inner.state.read().await.view;
        next_view(view, FlowTransition::Back)?;

        if view == FlowView::Status {
            self.reset().await;
            return Ok(FlowView::Initial);
        }

        self.stop_expiry_watch().await;
        self.inner.routes.reset().await;
        {
            let mut state = self.inner.state.write().await;
            state.charge = None;
            state.route_expired = false;
            state.error = None;
        }
        self.transition(FlowTransition::Back).await?;
        Ok(FlowView::Initial)
    }

    pub async fn reset(&self) {
        self.stop_expiry_watch().await;
        self.inner.routes.reset().await;

        let from = {
            let mut state = self.inner.state.write().await;
            let from = state.view;
            state.view = FlowView::Initial;
            state.form.amount.clear();
            state.form.usd_amount.clear();
            state.form.attachment = Attachment::default();
            state.charge = None;
            state.route_expired = false;
            state.payment = None;
            state.tx_hash = None;
            state.error = None;
            state.is_success = false;
            if self.inner.kind.full_form_reset() {
                state.form.recipient = None;
                state.form.selection = None;
            }
            from
        };
        tracing::debug!(flow = %self.inner.kind, %from, "flow reset");
        if from != FlowView::Initial {
            self.emit(FlowEvent::ViewChanged {
                from,
                to: FlowView::Initial,
            });
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn begin_processing(&self) -> Result<ProcessingGuard<'_>, FlowError> {
        self.inner
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| FlowError::Busy)?;
        Ok(ProcessingGuard(&self.inner.processing))
    }

    async fn transition(&self, transition: FlowTransition) -> Result<FlowView, FlowError> {
        let (from, to) = {
            let mut state = self.inner.state.write().await;
            let from = state.view;
            let to = next_view(from, transition)?;
            state.view = to;
            (from, to)
        };
        tracing::info!(flow = %self.inner.kind, %from, %to, transition = transition.name(), "view changed");
        self.emit(FlowEvent::ViewChanged { from, to });
        Ok(to)
    }

    /// Store the display string for `err` and hand the error back.
    async fn store_error(&self, err: Error) -> Error {
        let message = user_message(&err);
        tracing::warn!(flow = %self.inner.kind, error = %err, "flow command failed");
        self.inner.state.write().await.error = Some(message.clone());
        self.emit(FlowEvent::Error { message });
        err
    }

    fn report(&self, payload: FlowStatusPayload) {
        let payload = payload.with_flow(self.inner.kind.as_str());
        tracing::debug!(status = %payload.to_status_line(), "flow status");
        self.emit(FlowEvent::Status(payload));
    }

    fn emit(&self, event: FlowEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// The form is only editable on INITIAL.
fn ensure_view(view: FlowView, command: &'static str) -> Result<(), FlowError> {
    if view == FlowView::Initial {
        Ok(())
    } else {
        Err(FlowError::InvalidTransition {
            from: view,
            transition: command,
        })
    }
}

fn ensure_editable(state: &FlowState, command: &'static str) -> Result<(), FlowError> {
    ensure_view(state.view, command)
}

/// The USD value the user typed, when positive.
fn spend_amount(form: &FormData) -> Option<Decimal> {
    parse_amount(&form.usd_amount)
        .ok()
        .filter(|usd| *usd > Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use crate::payments::clients::{
        ChargeApi, PaymentRecorder, RecipientResolver, RouteProvider, StaticSession,
        StaticTokenCatalog, WalletClient,
    };
    use crate::payments::types::{PreparedTransaction, RouteQuote};

    const USDC_ARB: &str = "0xaf88d065e77c8cC2239327C5EDb3A432268e5831";
    const PAYER: &str = "0x1111111111111111111111111111111111111111";
    const FRIEND: &str = "0x2222222222222222222222222222222222222222";
    const HASH: &str = "0xabababababababababababababababababababababababababababababababab";

    #[derive(Default)]
    struct Backend {
        charges: StdMutex<Vec<ChargeRequest>>,
        requests: StdMutex<Vec<RequestSummary>>,
    }

    #[async_trait]
    impl ChargeApi for Backend {
        async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge, BackendError> {
            self.charges.lock().unwrap().push(request.clone());
            Ok(Charge {
                uuid: Uuid::new_v4(),
                chain_id: request.chain_id.clone(),
                token_amount: request.token_amount,
                token_address: request.token_address.clone(),
                token_decimals: request.token_decimals,
                token_symbol: request.token_symbol.clone(),
                recipient_address: request.recipient_address.clone(),
                reference: request.reference.clone(),
                attachment_url: None,
                currency_amount: Some(request.currency_amount),
                fulfillment_status: None,
                created_at: Utc::now(),
            })
        }

        async fn fetch_charge(&self, id: Uuid) -> Result<Charge, BackendError> {
            Err(BackendError::ChargeNotFound { id })
        }

        async fn fetch_request(&self, id: Uuid) -> Result<RequestSummary, BackendError> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.uuid == id)
                .cloned()
                .ok_or(BackendError::ChargeNotFound { id })
        }
    }

    #[async_trait]
    impl PaymentRecorder for Backend {
        async fn record_payment(&self, record: &PaymentRecord) -> Result<Payment, BackendError> {
            Ok(Payment {
                uuid: Uuid::new_v4(),
                charge_uuid: record.charge_id,
                tx_hash: record.tx_hash.clone(),
                payer_chain_id: record.chain_id.clone(),
                paid_token_address: record.token_address.clone(),
            })
        }
    }

    #[async_trait]
    impl RecipientResolver for Backend {
        async fn resolve(
            &self,
            identifier: &str,
            _kind: RecipientKind,
        ) -> Result<EvmAddress, BackendError> {
            if identifier == "kkonrad" {
                Ok(EvmAddress::parse(FRIEND).unwrap())
            } else {
                Err(BackendError::RecipientNotFound {
                    identifier: identifier.to_string(),
                })
            }
        }
    }

    struct NoRoutes;

    #[async_trait]
    impl RouteProvider for NoRoutes {
        async fn quote(&self, _request: &RouteRequest) -> Result<RouteQuote, RouteError> {
            Ok(RouteQuote {
                kind: RouteKind::Rfq,
                from_amount: dec!(1),
                to_amount: dec!(1),
                to_amount_min: None,
                fee_costs_usd: Decimal::ZERO,
                transactions: vec![PreparedTransaction {
                    to: EvmAddress::parse(PAYER).unwrap(),
                    data: None,
                    value: 0,
                }],
                expiry: Utc::now() + chrono::Duration::seconds(60),
            })
        }
    }

    struct Wallet {
        balance: Decimal,
        sends: StdMutex<u32>,
    }

    #[async_trait]
    impl WalletClient for Wallet {
        fn address(&self) -> Option<EvmAddress> {
            EvmAddress::parse(PAYER).ok()
        }

        async fn balance(&self) -> Result<Decimal, WalletError> {
            Ok(self.balance)
        }

        async fn send_money(
            &self,
            _to: &EvmAddress,
            _amount: Decimal,
        ) -> Result<TxHash, WalletError> {
            *self.sends.lock().unwrap() += 1;
            Ok(TxHash::parse(HASH).unwrap())
        }

        async fn send_transactions(
            &self,
            _transactions: &[PreparedTransaction],
        ) -> Result<TxHash, WalletError> {
            Ok(TxHash::parse(HASH).unwrap())
        }
    }

    fn usdc() -> TokenInfo {
        TokenInfo {
            address: EvmAddress::parse(USDC_ARB).unwrap(),
            symbol: "USDC".to_string(),
            decimals: 6,
        }
    }

    fn flow_with(kind: FlowKind, backend: Arc<Backend>, balance: Decimal) -> PaymentFlow {
        let deps = FlowDeps {
            charges: backend.clone(),
            recorder: backend.clone(),
            routes: Arc::new(NoRoutes),
            wallet: Arc::new(Wallet {
                balance,
                sends: StdMutex::new(0),
            }),
            auth: Arc::new(StaticSession::logged_in("user-1")),
            tokens: Arc::new(StaticTokenCatalog::new(ChainId::new(42161), usdc())),
            resolver: backend,
        };
        PaymentFlow::new(kind, deps, RouteConfig::default())
    }

    #[tokio::test]
    async fn direct_send_goes_straight_to_status() {
        let backend = Arc::new(Backend::default());
        let flow = flow_with(FlowKind::DirectSend, backend.clone(), dec!(50));
        let mut events = flow.subscribe();

        flow.set_amount("10").await.unwrap();
        flow.resolve_recipient("kkonrad").await.unwrap();
        flow.refresh_balance().await.unwrap();
        assert!(flow.can_proceed().await);

        assert_eq!(flow.submit().await.unwrap(), FlowView::Status);

        let snapshot = flow.snapshot().await;
        assert!(snapshot.is_success);
        assert!(snapshot.payment.is_some());
        assert_eq!(backend.charges.lock().unwrap().len(), 1);

        let mut saw_status = false;
        while let Ok(event) = events.try_recv() {
            if event
                == (FlowEvent::ViewChanged {
                    from: FlowView::Initial,
                    to: FlowView::Status,
                })
            {
                saw_status = true;
            }
        }
        assert!(saw_status);
    }

    #[tokio::test]
    async fn unresolvable_username_surfaces_error() {
        let flow = flow_with(FlowKind::Send, Arc::new(Backend::default()), dec!(50));
        let err = flow.resolve_recipient("@nobody").await.unwrap_err();

        assert!(matches!(
            err,
            Error::Backend(BackendError::RecipientNotFound { .. })
        ));
        assert!(flow.snapshot().await.error.is_some());
    }

    #[tokio::test]
    async fn send_rejects_foreign_token_selection() {
        let flow = flow_with(FlowKind::Send, Arc::new(Backend::default()), dec!(50));
        let err = flow
            .select_token(TokenSelection {
                chain_id: ChainId::new(137),
                token: usdc(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::CrossChainUnsupported));
    }

    #[tokio::test]
    async fn insufficient_balance_blocks_submit() {
        let flow = flow_with(FlowKind::DirectSend, Arc::new(Backend::default()), dec!(5));
        flow.set_amount("10").await.unwrap();
        flow.resolve_recipient(FRIEND).await.unwrap();

        let err = flow.submit().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Wallet(WalletError::InsufficientBalance { .. })
        ));

        let snapshot = flow.snapshot().await;
        assert_eq!(snapshot.view, FlowView::Initial);
        assert_eq!(snapshot.error.as_deref(), Some("You don't have enough funds."));
        assert!(!snapshot.processing);
    }

    #[tokio::test]
    async fn pot_contribution_seeds_suggested_amount() {
        let backend = Arc::new(Backend::default());
        let request_id = Uuid::new_v4();
        backend.requests.lock().unwrap().push(RequestSummary {
            uuid: request_id,
            recipient_address: EvmAddress::parse(FRIEND).unwrap(),
            total_amount: Some(dec!(100)),
            contributions: vec![dec!(5), dec!(10), dec!(2)],
        });
        let flow = flow_with(FlowKind::ContributePot, backend.clone(), dec!(50));

        assert!(!flow.can_proceed().await);
        flow.set_request(request_id).await.unwrap();
        flow.refresh_balance().await.unwrap();

        let snapshot = flow.snapshot().await;
        assert_eq!(snapshot.form.amount, "5");
        assert!(snapshot.can_proceed);

        assert_eq!(flow.submit().await.unwrap(), FlowView::Status);
        let charges = backend.charges.lock().unwrap();
        assert_eq!(charges[0].request_id, Some(request_id));
    }

    #[tokio::test]
    async fn unknown_request_id_is_rejected() {
        let flow = flow_with(FlowKind::ContributePot, Arc::new(Backend::default()), dec!(50));
        let err = flow.set_request(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Backend(BackendError::InvalidRequestId { .. })
        ));
        assert_eq!(flow.snapshot().await.error.as_deref(), Some("invalid request id"));
    }

    #[tokio::test]
    async fn withdraw_confirms_even_on_wallet_asset() {
        let flow = flow_with(FlowKind::CryptoWithdraw, Arc::new(Backend::default()), dec!(50));
        flow.set_amount("3").await.unwrap();
        flow.resolve_recipient(FRIEND).await.unwrap();

        assert_eq!(flow.submit().await.unwrap(), FlowView::Confirm);
        assert!(flow.snapshot().await.route.is_none());

        flow.confirm().await.unwrap();
        assert_eq!(flow.snapshot().await.view, FlowView::Status);

        flow.reset().await;
        let snapshot = flow.snapshot().await;
        assert!(snapshot.form.recipient.is_none());
        assert!(snapshot.form.selection.is_none());
    }

    #[tokio::test]
    async fn back_from_confirm_drops_charge() {
        let flow = flow_with(FlowKind::CryptoWithdraw, Arc::new(Backend::default()), dec!(50));
        flow.set_amount("3").await.unwrap();
        flow.resolve_recipient(FRIEND).await.unwrap();
        flow.submit().await.unwrap();

        assert_eq!(flow.back().await.unwrap(), FlowView::Initial);
        let snapshot = flow.snapshot().await;
        assert!(snapshot.charge.is_none());
        assert_eq!(snapshot.form.amount, "3");
    }

    #[tokio::test]
    async fn logged_out_user_cannot_submit() {
        let backend = Arc::new(Backend::default());
        let deps = FlowDeps {
            charges: backend.clone(),
            recorder: backend.clone(),
            routes: Arc::new(NoRoutes),
            wallet: Arc::new(Wallet {
                balance: dec!(50),
                sends: StdMutex::new(0),
            }),
            auth: Arc::new(StaticSession::anonymous()),
            tokens: Arc::new(StaticTokenCatalog::new(ChainId::new(42161), usdc())),
            resolver: backend,
        };
        let flow = PaymentFlow::new(FlowKind::Send, deps, RouteConfig::default());
        flow.set_amount("1").await.unwrap();
        flow.resolve_recipient(FRIEND).await.unwrap();

        let err = flow.submit().await.unwrap_err();
        assert!(matches!(err, Error::Flow(FlowError::NotLoggedIn)));
    }
}
