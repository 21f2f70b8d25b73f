//! Composes the ledger components behind one state surface.
//!
//! Calls only go down: components return values or report through
//! [`ComponentEvent`]s, and the controller decides what the user sees.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::config::ControllerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    parse_units, Account, AccountSelection, AccountSourceKind, Address, AuthState, Balance, Drafts, InputField,
    LedgerChanged, OperationKind, OperationOutcome, SecurityDelay, WithdrawalEligibility,
};
use crate::services::account_binder::{AccountBinder, AccountDeriver, BindOutcome};
use crate::services::balance_tracker::{BalanceSnapshot, BalanceTracker, RefreshOutcome};
use crate::services::clock::Clock;
use crate::services::deposit::DepositExecutor;
use crate::services::lifecycle::{
    event_channel, ChangeNotifier, ComponentEvent, EventReceiver, Generation, InFlight, TaskSlot,
};
use crate::services::notices::{Notice, Notices, Pulse};
use crate::services::session::{LedgerConnector, LedgerSession, LedgerSessionFactory};
use crate::services::withdrawal::{WithdrawalCoordinator, WithdrawalSnapshot};
use crate::storage::Preferences;

const LEDGER_EVENT_CAPACITY: usize = 64;

/// External collaborators the controller is built from.
pub struct ControllerDeps {
    pub connector: Option<Arc<dyn LedgerConnector>>,
    pub deriver: Option<Arc<dyn AccountDeriver>>,
    pub clock: Arc<dyn Clock>,
    pub preferences: Option<Arc<Preferences>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub valid: bool,
    pub generation: Option<Generation>,
    pub security_delay: Option<SecurityDelay>,
    pub error: Option<String>,
}

/// Everything the presentation layer renders.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerState {
    pub revision: u64,
    pub network: String,
    pub token_symbol: String,
    pub funding_target: Option<Address>,
    pub allowed_sources: Vec<AccountSourceKind>,
    pub selection: Option<AccountSelection>,
    pub account: Option<Account>,
    pub resolving_account: bool,
    pub session: SessionStatus,
    pub auto_refresh_enabled: bool,
    pub balance: BalanceSnapshot,
    pub withdrawal: WithdrawalSnapshot,
    pub in_flight: Vec<OperationKind>,
    pub pulses: Vec<Pulse>,
    pub notice: Option<Notice>,
    pub inputs: BTreeMap<InputField, String>,
    pub last_outcome: Option<OperationOutcome>,
}

pub struct LedgerController {
    config: ControllerConfig,
    binder: AccountBinder,
    factory: LedgerSessionFactory,
    session: RwLock<Option<Arc<LedgerSession>>>,
    session_error: RwLock<Option<LedgerError>>,
    balances: BalanceTracker,
    withdrawals: WithdrawalCoordinator,
    deposits: DepositExecutor,
    notices: Notices,
    drafts: Drafts,
    flights: InFlight,
    notifier: ChangeNotifier,
    ledger_tx: broadcast::Sender<LedgerChanged>,
    auth: RwLock<AuthState>,
    auto_refresh: AtomicBool,
    last_outcome: RwLock<Option<OperationOutcome>>,
    preferences: Option<Arc<Preferences>>,
    listener: TaskSlot,
    auth_task: TaskSlot,
}

impl LedgerController {
    /// Must be called inside a tokio runtime.
    pub fn new(config: ControllerConfig, deps: ControllerDeps) -> LedgerResult<Arc<Self>> {
        config.validate()?;

        let notifier = ChangeNotifier::new();
        let (events, events_rx) = event_channel();
        let flights = InFlight::new();
        let drafts = Drafts::new();
        let (ledger_tx, _) = broadcast::channel(LEDGER_EVENT_CAPACITY);

        let controller = Arc::new(Self {
            binder: AccountBinder::new(deps.deriver, &config),
            factory: LedgerSessionFactory::new(deps.connector, &config),
            session: RwLock::new(None),
            session_error: RwLock::new(None),
            balances: BalanceTracker::new(notifier.clone(), events.clone(), deps.clock.clone()),
            withdrawals: WithdrawalCoordinator::new(
                flights.clone(),
                notifier.clone(),
                events,
                deps.clock.clone(),
                config.countdown_tick,
            ),
            deposits: DepositExecutor::new(flights.clone(), drafts.clone(), notifier.clone(), deps.clock.clone()),
            notices: Notices::new(
                config.notice_duration,
                config.pulse_duration,
                notifier.clone(),
                deps.clock,
            ),
            drafts,
            flights,
            notifier,
            ledger_tx,
            auth: RwLock::new(AuthState::default()),
            auto_refresh: AtomicBool::new(config.auto_refresh),
            last_outcome: RwLock::new(None),
            preferences: deps.preferences,
            listener: TaskSlot::new(),
            auth_task: TaskSlot::new(),
            config,
        });
        controller.listen(events_rx);

        tracing::info!(
            "Ledger controller ready on {} (funding target: {})",
            controller.config.network,
            controller
                .config
                .funding_target
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "none".into())
        );
        Ok(controller)
    }

    fn listen(&self, mut events: EventReceiver) {
        let notices = self.notices.clone();
        self.listener.set(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ComponentEvent::BackgroundFailure { operation, error } => {
                        tracing::warn!("Background {} failed: {}", operation.as_str(), error);
                        notices.raise(&error);
                    }
                }
            }
        }));
    }

    /// Follows the auth boundary until the sender is dropped.
    pub fn watch_auth(self: &Arc<Self>, mut auth: watch::Receiver<AuthState>) {
        let weak = Arc::downgrade(self);
        self.auth_task.set(tokio::spawn(async move {
            loop {
                let state = auth.borrow_and_update().clone();
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = this.on_auth_changed(state).await {
                    tracing::debug!("Auth change not applied: {}", e);
                }
                drop(this);
                if auth.changed().await.is_err() {
                    break;
                }
            }
        }));
    }

    pub async fn restore_preferences(&self) {
        let Some(preferences) = self.preferences.clone() else {
            return;
        };
        match preferences.auto_refresh() {
            Ok(Some(enabled)) => self.auto_refresh.store(enabled, Ordering::SeqCst),
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not read auto-refresh preference: {}", e),
        }
        match preferences.selection() {
            Ok(Some(selection)) => {
                tracing::info!("Restoring {} account selection", selection.kind().as_str());
                if let Err(e) = self.select_source(selection).await {
                    tracing::warn!("Could not restore account selection: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not read account selection: {}", e),
        }
    }

    /// Binds the selected account source and re-acquires everything derived
    /// from it. Returns `None` if a later selection superseded this one.
    pub async fn select_source(&self, selection: AccountSelection) -> LedgerResult<Option<Account>> {
        if let Err(e) = self.binder.ensure_allowed(selection.kind()) {
            return self.fail(e);
        }
        if self.binder.selection().as_ref() == Some(&selection) && self.current_session().is_some() {
            return Ok(self.binder.active());
        }

        self.detach();
        let auth = self.auth.read().clone();
        self.rebind(selection, &auth).await
    }

    /// Applies a new auth boundary value. Only the delegated source depends
    /// on it.
    pub async fn on_auth_changed(&self, auth: AuthState) -> LedgerResult<Option<Account>> {
        let previous = std::mem::replace(&mut *self.auth.write(), auth.clone());
        if previous == auth {
            return Ok(self.binder.active());
        }
        if self.binder.selection() != Some(AccountSelection::Delegated) {
            return Ok(self.binder.active());
        }

        if !auth.has_credential {
            tracing::info!("Credential lost, releasing delegated account");
            self.binder.invalidate();
            self.detach();
            return Ok(None);
        }
        self.detach();
        self.rebind(AccountSelection::Delegated, &auth).await
    }

    async fn rebind(&self, selection: AccountSelection, auth: &AuthState) -> LedgerResult<Option<Account>> {
        self.notifier.notify();
        match self.binder.bind(selection.clone(), auth).await {
            Ok(BindOutcome::Bound { account, generation }) => {
                self.persist_selection(&selection);
                self.attach(&account, generation).await?;
                Ok(Some(account))
            }
            Ok(BindOutcome::Superseded) => Ok(None),
            Err(e) => {
                self.notifier.notify();
                self.fail(e)
            }
        }
    }

    async fn attach(&self, account: &Account, generation: Generation) -> LedgerResult<()> {
        let session = match self.factory.acquire(account, generation).await {
            Ok(session) => session,
            Err(e) => {
                if !self.binder.is_current(generation) {
                    return Ok(());
                }
                *self.session_error.write() = Some(e.clone());
                self.notifier.notify();
                return self.fail(e);
            }
        };
        if !self.binder.is_current(generation) {
            tracing::debug!("Dropping session {} for superseded account", generation.value());
            return Ok(());
        }

        *self.session.write() = Some(session.clone());
        *self.session_error.write() = None;
        self.balances.bind(session.clone());
        self.withdrawals.bind(session.clone());
        self.deposits.bind(generation);
        self.notifier.notify();

        if !self.is_funding_only() {
            if let Err(e) = self.withdrawals.load().await {
                self.notices.raise(&e);
            }
        }
        if self.binder.is_current(generation) && self.auto_refresh.load(Ordering::SeqCst) {
            self.balances.start_auto_refresh(self.config.refresh_interval);
            if let Err(e) = self.balances.refresh().await {
                self.notices.raise(&e);
            }
        }
        Ok(())
    }

    fn detach(&self) {
        let had_session = self.session.write().take().is_some();
        *self.session_error.write() = None;
        self.balances.unbind();
        self.withdrawals.unbind();
        self.deposits.unbind();
        if had_session {
            tracing::debug!("Ledger session released");
        }
        self.notifier.notify();
    }

    fn persist_selection(&self, selection: &AccountSelection) {
        if let Some(preferences) = &self.preferences {
            if let Err(e) = preferences.save_selection(selection) {
                tracing::warn!("Could not save account selection: {}", e);
            }
        }
    }

    pub async fn refresh_balance(&self) -> LedgerResult<Option<Balance>> {
        self.surface(self.require_session())?;
        match self.surface(self.balances.refresh().await)? {
            RefreshOutcome::Applied(balance) => Ok(Some(balance)),
            RefreshOutcome::Skipped => Ok(self.balances.balance()),
            RefreshOutcome::Discarded => Ok(None),
        }
    }

    pub async fn set_auto_refresh(&self, enabled: bool) -> LedgerResult<()> {
        self.auto_refresh.store(enabled, Ordering::SeqCst);
        if let Some(preferences) = &self.preferences {
            if let Err(e) = preferences.save_auto_refresh(enabled) {
                tracing::warn!("Could not save auto-refresh preference: {}", e);
            }
        }

        if !enabled {
            self.balances.stop();
            return Ok(());
        }
        if self.current_session().is_some() {
            self.balances.start_auto_refresh(self.config.refresh_interval);
            self.surface(self.balances.refresh().await)?;
        }
        self.notifier.notify();
        Ok(())
    }

    pub fn set_input(&self, field: InputField, value: String) {
        self.drafts.set(field, value);
        self.notifier.notify();
    }

    pub async fn deposit_self(&self) -> LedgerResult<OperationOutcome> {
        if self.is_funding_only() {
            return self.fail(LedgerError::configuration(
                "self deposits are disabled in funding-only mode",
            ));
        }
        let session = self.surface(self.require_session())?;
        let outcome = self.surface(self.deposits.submit_self(&session).await)?;
        Ok(self.complete(&session, outcome, true))
    }

    pub async fn deposit_for(&self) -> LedgerResult<OperationOutcome> {
        let session = self.surface(self.require_session())?;
        let default_target = self.config.funding_target.as_ref();
        let outcome = self.surface(self.deposits.submit_for(&session, default_target).await)?;
        Ok(self.complete(&session, outcome, true))
    }

    pub async fn request_withdraw(&self) -> LedgerResult<OperationOutcome> {
        self.surface(self.ensure_withdrawals_enabled())?;
        let session = self.surface(self.require_session())?;
        if self.withdrawals.request().is_some() {
            return self.fail(LedgerError::AlreadyPending);
        }

        let drawn = self.drafts.get(InputField::WithdrawAmount);
        let amount = self.surface(parse_units(&drawn, session.decimals()))?;
        let available = self
            .balances
            .balance()
            .filter(|b| &b.address == session.target())
            .map(|b| b.available_balance.raw);

        let outcome = self.surface(self.withdrawals.submit_request(amount, available).await)?;
        if self.binder.is_current(session.generation())
            && self.drafts.clear_if_unchanged(InputField::WithdrawAmount, &drawn)
        {
            self.notifier.notify();
        }
        Ok(self.complete(&session, outcome, false))
    }

    pub async fn check_eligibility(&self) -> LedgerResult<Option<WithdrawalEligibility>> {
        self.surface(self.ensure_withdrawals_enabled())?;
        self.surface(self.require_session())?;
        self.surface(self.withdrawals.check_eligibility().await)
    }

    pub async fn execute_withdraw(&self) -> LedgerResult<OperationOutcome> {
        self.surface(self.ensure_withdrawals_enabled())?;
        let session = self.surface(self.require_session())?;
        let outcome = self.surface(self.withdrawals.execute().await)?;
        Ok(self.complete(&session, outcome, true))
    }

    /// Success bookkeeping. Observers always hear about ledger changes; the
    /// pulse and follow-up refresh only apply while the account is unchanged.
    fn complete(&self, session: &LedgerSession, outcome: OperationOutcome, ledger_changed: bool) -> OperationOutcome {
        if ledger_changed {
            // no receivers is fine
            let _ = self.ledger_tx.send(LedgerChanged::from(&outcome));
        }
        if self.binder.is_current(session.generation()) {
            self.notices.pulse(outcome.kind, outcome.id);
            *self.last_outcome.write() = Some(outcome.clone());
            self.balances.schedule_refresh(self.config.deposit_settle_delay);
            self.notifier.notify();
        } else {
            tracing::debug!(
                "{} finished for a superseded account, state left untouched",
                outcome.kind.as_str()
            );
        }
        outcome
    }

    pub fn dismiss_notice(&self) {
        self.notices.dismiss();
    }

    pub fn state(&self) -> ControllerState {
        let session = self.current_session();
        let mut in_flight = self.flights.snapshot();
        let balance = self.balances.snapshot();
        if balance.loading {
            in_flight.push(OperationKind::RefreshBalance);
        }
        let mut allowed_sources = Vec::new();
        if self.config.allow_delegated {
            allowed_sources.push(AccountSourceKind::Delegated);
        }
        if self.config.allow_self_custodied {
            allowed_sources.push(AccountSourceKind::SelfCustodied);
        }

        ControllerState {
            revision: self.notifier.revision(),
            network: self.config.network.clone(),
            token_symbol: self.config.token_symbol.clone(),
            funding_target: self.config.funding_target.clone(),
            allowed_sources,
            selection: self.binder.selection(),
            account: self.binder.active(),
            resolving_account: self.binder.is_resolving(),
            session: SessionStatus {
                valid: session.is_some(),
                generation: session.as_ref().map(|s| s.generation()),
                security_delay: session.as_ref().and_then(|s| s.security_delay()),
                error: self.session_error.read().as_ref().map(|e| e.to_string()),
            },
            auto_refresh_enabled: self.auto_refresh.load(Ordering::SeqCst),
            balance,
            withdrawal: self.withdrawals.snapshot(),
            in_flight,
            pulses: self.notices.pulses(),
            notice: self.notices.current(),
            inputs: self.drafts.snapshot(),
            last_outcome: self.last_outcome.read().clone(),
        }
    }

    /// Revision counter, bumped on every visible change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }

    pub fn ledger_events(&self) -> broadcast::Receiver<LedgerChanged> {
        self.ledger_tx.subscribe()
    }

    /// Stops every timer and releases the session.
    pub fn shutdown(&self) {
        self.auth_task.clear();
        self.detach();
        self.notices.reset();
        self.listener.clear();
        tracing::info!("Ledger controller stopped");
    }

    fn current_session(&self) -> Option<Arc<LedgerSession>> {
        self.session.read().clone()
    }

    fn require_session(&self) -> LedgerResult<Arc<LedgerSession>> {
        if let Some(session) = self.current_session() {
            return Ok(session);
        }
        if let Some(e) = self.session_error.read().clone() {
            return Err(e);
        }
        if self.binder.active().is_none() {
            return Err(LedgerError::AccountUnavailable);
        }
        Err(LedgerError::session_unavailable("ledger session is not ready"))
    }

    fn is_funding_only(&self) -> bool {
        self.config.funding_target.is_some()
    }

    fn ensure_withdrawals_enabled(&self) -> LedgerResult<()> {
        if self.is_funding_only() {
            Err(LedgerError::configuration("withdrawals are disabled in funding-only mode"))
        } else {
            Ok(())
        }
    }

    fn surface<T>(&self, result: LedgerResult<T>) -> LedgerResult<T> {
        if let Err(e) = &result {
            self.notices.raise(e);
        }
        result
    }

    fn fail<T>(&self, error: LedgerError) -> LedgerResult<T> {
        self.notices.raise(&error);
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{address, FakeConnector, FakeDeriver, FakeLedger, ETH};
    use crate::storage::DbManager;
    use std::time::Duration;

    struct Fixture {
        ledger: FakeLedger,
        deriver: FakeDeriver,
        controller: Arc<LedgerController>,
    }

    fn config() -> ControllerConfig {
        let mut config = ControllerConfig::new("datil");
        config.call_timeout = None;
        config.countdown_tick = Duration::ZERO;
        config
    }

    fn fixture_with(config: ControllerConfig, preferences: Option<Arc<Preferences>>) -> Fixture {
        let ledger = FakeLedger::new();
        let deriver = FakeDeriver::new();
        let controller = LedgerController::new(
            config,
            ControllerDeps {
                connector: Some(FakeConnector::shared(&ledger)),
                deriver: Some(Arc::new(deriver.clone())),
                clock: ledger.clock(),
                preferences,
            },
        )
        .unwrap();
        Fixture {
            ledger,
            deriver,
            controller,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(config(), None)
    }

    fn self_custodied(n: u64) -> AccountSelection {
        AccountSelection::SelfCustodied { address: address(n) }
    }

    fn signed_in(n: u64) -> AuthState {
        AuthState {
            has_credential: true,
            public_key_id: Some(format!("pk-{}", n)),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn selecting_account_acquires_session_and_balance() {
        let fx = fixture();
        fx.ledger.set_balance(&address(1), 4 * ETH, 3 * ETH);

        let account = fx.controller.select_source(self_custodied(1)).await.unwrap().unwrap();
        assert_eq!(account.address, address(1));

        let state = fx.controller.state();
        assert!(state.session.valid);
        assert_eq!(state.session.security_delay.map(|d| d.seconds), Some(3600));
        let balance = state.balance.balance.unwrap();
        assert_eq!(balance.available_balance.formatted, "3");
        assert!(state.balance.auto_refresh);
        assert!(state.notice.is_none());
    }

    #[tokio::test]
    async fn missing_network_is_a_configuration_error() {
        let ledger = FakeLedger::new();
        let result = LedgerController::new(
            ControllerConfig::new(""),
            ControllerDeps {
                connector: Some(FakeConnector::shared(&ledger)),
                deriver: None,
                clock: ledger.clock(),
                preferences: None,
            },
        );
        assert!(matches!(result.err(), Some(LedgerError::Configuration(_))));
    }

    #[tokio::test]
    async fn disabled_source_is_rejected_without_connecting() {
        let mut config = config();
        config.allow_self_custodied = false;
        let fx = fixture_with(config, None);

        let err = fx.controller.select_source(self_custodied(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Configuration(_)));
        assert_eq!(fx.ledger.connects(), 0);
        assert_eq!(fx.controller.state().notice.unwrap().kind, "configuration");
    }

    #[tokio::test]
    async fn unreachable_ledger_blocks_operations() {
        let fx = fixture();
        fx.ledger.set_unreachable(true);

        let err = fx.controller.select_source(self_custodied(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::SessionUnavailable(_)));
        let state = fx.controller.state();
        assert!(!state.session.valid);
        assert!(state.session.error.is_some());

        fx.controller.set_input(InputField::DepositSelfAmount, "1".into());
        let err = fx.controller.deposit_self().await.unwrap_err();
        assert!(matches!(err, LedgerError::SessionUnavailable(_)));
        assert_eq!(fx.ledger.calls("deposit"), 0);
    }

    #[tokio::test]
    async fn operations_without_account_are_unavailable() {
        let fx = fixture();
        let err = fx.controller.refresh_balance().await.unwrap_err();
        assert_eq!(err, LedgerError::AccountUnavailable);
    }

    #[tokio::test]
    async fn switching_account_discards_in_flight_balance() {
        let mut config = config();
        config.auto_refresh = false;
        let fx = fixture_with(config, None);
        fx.ledger.set_balance(&address(1), 9 * ETH, 9 * ETH);
        fx.ledger.set_balance(&address(2), ETH, ETH);
        fx.controller.select_source(self_custodied(1)).await.unwrap();

        let gate = fx.ledger.hold("getBalance");
        let stale = {
            let controller = fx.controller.clone();
            tokio::spawn(async move { controller.refresh_balance().await })
        };
        settle().await;
        assert!(fx.controller.state().in_flight.contains(&OperationKind::RefreshBalance));

        fx.controller.select_source(self_custodied(2)).await.unwrap();
        drop(gate);
        assert_eq!(stale.await.unwrap().unwrap(), None);
        assert!(fx.controller.state().balance.balance.is_none());

        let balance = fx.controller.refresh_balance().await.unwrap().unwrap();
        assert_eq!(balance.address, address(2));
        assert_eq!(balance.total_balance.raw, ETH);
    }

    #[tokio::test(start_paused = true)]
    async fn deposit_for_notifies_clears_input_and_defers_refresh() {
        let fx = fixture();
        fx.controller.select_source(self_custodied(1)).await.unwrap();
        let mut changes = fx.controller.ledger_events();
        let before = fx.ledger.calls("getBalance");

        fx.controller
            .set_input(InputField::DepositForAddress, address(2).to_string());
        fx.controller.set_input(InputField::DepositForAmount, "0.5".into());
        let outcome = fx.controller.deposit_for().await.unwrap();
        assert_eq!(outcome.address, address(2));
        assert_eq!(outcome.amount.raw, ETH / 2);

        let event = changes.try_recv().unwrap();
        assert_eq!(event.address, address(2));
        assert_eq!(event.kind, OperationKind::DepositFor);

        let state = fx.controller.state();
        assert!(state.inputs.get(&InputField::DepositForAmount).is_none());
        assert!(state.inputs.get(&InputField::DepositForAddress).is_none());
        assert_eq!(state.pulses.len(), 1);
        assert_eq!(state.last_outcome.unwrap().id, outcome.id);

        settle().await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        settle().await;
        assert_eq!(fx.ledger.calls("getBalance"), before);
        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(fx.ledger.calls("getBalance"), before + 1);
    }

    #[tokio::test]
    async fn stale_deposit_leaves_new_account_drafts_alone() {
        let fx = fixture();
        fx.controller.select_source(self_custodied(1)).await.unwrap();
        fx.controller.set_input(InputField::DepositSelfAmount, "1".into());

        let gate = fx.ledger.hold("deposit");
        let pending = {
            let controller = fx.controller.clone();
            tokio::spawn(async move { controller.deposit_self().await })
        };
        settle().await;
        fx.controller.select_source(self_custodied(2)).await.unwrap();

        drop(gate);
        pending.await.unwrap().unwrap();
        let state = fx.controller.state();
        assert_eq!(state.inputs.get(&InputField::DepositSelfAmount).map(String::as_str), Some("1"));
        assert!(state.pulses.is_empty());
        assert!(state.last_outcome.is_none());
    }

    #[tokio::test]
    async fn failed_deposit_surfaces_transient_notice() {
        let fx = fixture();
        fx.controller.select_source(self_custodied(1)).await.unwrap();
        fx.controller.set_input(InputField::DepositSelfAmount, "1".into());
        fx.ledger.fail_next("deposit");

        assert!(fx.controller.deposit_self().await.is_err());
        let state = fx.controller.state();
        let notice = state.notice.unwrap();
        assert!(notice.transient);
        assert_eq!(notice.kind, "operation_failure");
        assert!(state.in_flight.is_empty());
        assert_eq!(state.inputs.get(&InputField::DepositSelfAmount).map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn withdrawal_lifecycle_through_delay() {
        let fx = fixture();
        let clock = fx.ledger.clock();
        fx.ledger.set_balance(&address(1), 5 * ETH, 5 * ETH);
        fx.controller.select_source(self_custodied(1)).await.unwrap();
        let mut changes = fx.controller.ledger_events();

        fx.controller.set_input(InputField::WithdrawAmount, "1".into());
        fx.controller.request_withdraw().await.unwrap();
        assert!(changes.try_recv().is_err());

        let err = fx.controller.request_withdraw().await.unwrap_err();
        assert_eq!(err, LedgerError::AlreadyPending);
        assert_eq!(fx.ledger.calls("requestWithdraw"), 1);

        clock.advance(Duration::from_secs(1800));
        let mid = fx.controller.check_eligibility().await.unwrap().unwrap();
        assert!(!mid.can_execute);
        assert_eq!(mid.time_remaining, Some(Duration::from_secs(1800)));
        assert!(matches!(
            fx.controller.execute_withdraw().await.unwrap_err(),
            LedgerError::NotExecutable { .. }
        ));
        assert_eq!(fx.ledger.calls("withdraw"), 0);

        clock.advance(Duration::from_secs(1801));
        let outcome = fx.controller.execute_withdraw().await.unwrap();
        assert_eq!(outcome.kind, OperationKind::ExecuteWithdraw);
        assert_eq!(changes.try_recv().unwrap().address, address(1));

        let state = fx.controller.state();
        assert!(state.withdrawal.request.is_none());
        assert!(fx.controller.balances.has_scheduled_refresh());
    }

    #[tokio::test]
    async fn withdraw_above_available_balance_is_refused() {
        let fx = fixture();
        fx.ledger.set_balance(&address(1), 5 * ETH, ETH);
        fx.controller.select_source(self_custodied(1)).await.unwrap();

        fx.controller.set_input(InputField::WithdrawAmount, "2".into());
        let err = fx.controller.request_withdraw().await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(fx.ledger.calls("requestWithdraw"), 0);
    }

    #[tokio::test]
    async fn funding_only_mode_targets_fixed_address() {
        let mut config = config();
        config.funding_target = Some(address(50));
        let fx = fixture_with(config, None);
        fx.ledger.set_balance(&address(50), 2 * ETH, 2 * ETH);
        fx.controller.select_source(self_custodied(1)).await.unwrap();

        let state = fx.controller.state();
        assert_eq!(state.balance.balance.unwrap().address, address(50));

        fx.controller.set_input(InputField::DepositSelfAmount, "1".into());
        assert!(matches!(
            fx.controller.deposit_self().await.unwrap_err(),
            LedgerError::Configuration(_)
        ));
        fx.controller.set_input(InputField::WithdrawAmount, "1".into());
        assert!(matches!(
            fx.controller.request_withdraw().await.unwrap_err(),
            LedgerError::Configuration(_)
        ));
        assert_eq!(fx.ledger.calls("getWithdrawRequest"), 0);

        fx.controller.set_input(InputField::DepositForAmount, "1".into());
        let outcome = fx.controller.deposit_for().await.unwrap();
        assert_eq!(outcome.address, address(50));
        assert_eq!(fx.ledger.balance_of(&address(50)).total, 3 * ETH);
    }

    #[tokio::test]
    async fn existing_request_resumes_on_selection() {
        let fx = fixture();
        let now = fx.ledger.clock().now();
        fx.ledger.set_request(&address(1), ETH, now);

        fx.controller.select_source(self_custodied(1)).await.unwrap();
        let withdrawal = fx.controller.state().withdrawal;
        assert_eq!(withdrawal.request.unwrap().amount.raw, ETH);
        assert_eq!(
            withdrawal.eligibility.unwrap().time_remaining,
            Some(Duration::from_secs(3600))
        );

        fx.controller.select_source(self_custodied(2)).await.unwrap();
        assert!(fx.controller.state().withdrawal.request.is_none());
    }

    #[tokio::test]
    async fn switching_source_discards_pending_derivation() {
        let fx = fixture();
        fx.controller.on_auth_changed(signed_in(1)).await.unwrap();
        let gate = fx.deriver.hold("pk-1");

        let delegated = {
            let controller = fx.controller.clone();
            tokio::spawn(async move { controller.select_source(AccountSelection::Delegated).await })
        };
        settle().await;
        assert!(fx.controller.state().resolving_account);

        fx.controller.select_source(self_custodied(5)).await.unwrap();
        drop(gate);
        assert_eq!(delegated.await.unwrap().unwrap(), None);

        let state = fx.controller.state();
        assert_eq!(state.account.unwrap().address, address(5));
        assert_eq!(fx.ledger.connects(), 1);
    }

    #[tokio::test]
    async fn previous_account_is_gone_while_delegated_resolves() {
        let fx = fixture();
        fx.controller.select_source(self_custodied(1)).await.unwrap();
        fx.controller.on_auth_changed(signed_in(2)).await.unwrap();
        let gate = fx.deriver.hold("pk-2");

        let delegated = {
            let controller = fx.controller.clone();
            tokio::spawn(async move { controller.select_source(AccountSelection::Delegated).await })
        };
        settle().await;

        let state = fx.controller.state();
        assert!(state.resolving_account);
        assert_eq!(state.selection, Some(AccountSelection::Delegated));
        assert!(state.account.is_none());
        assert!(!state.session.valid);
        assert!(state.balance.balance.is_none());

        drop(gate);
        let account = delegated.await.unwrap().unwrap().unwrap();
        assert_eq!(account.source, AccountSourceKind::Delegated);
    }

    #[tokio::test]
    async fn losing_credential_releases_delegated_account() {
        let fx = fixture();
        fx.controller.on_auth_changed(signed_in(1)).await.unwrap();
        let account = fx
            .controller
            .select_source(AccountSelection::Delegated)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.source, AccountSourceKind::Delegated);

        fx.controller.on_auth_changed(AuthState::default()).await.unwrap();
        let state = fx.controller.state();
        assert!(state.account.is_none());
        assert!(!state.session.valid);
        assert!(state.balance.balance.is_none());
    }

    #[tokio::test]
    async fn auth_watch_completes_delegated_binding() {
        let fx = fixture();
        let (tx, rx) = watch::channel(AuthState::default());
        fx.controller.watch_auth(rx);
        settle().await;

        let err = fx
            .controller
            .select_source(AccountSelection::Delegated)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Derivation(_)));
        assert!(fx.controller.state().account.is_none());

        tx.send(signed_in(2)).unwrap();
        settle().await;
        let state = fx.controller.state();
        assert_eq!(state.account.unwrap().address, address(2));
        assert!(state.session.valid);
    }

    #[tokio::test(start_paused = true)]
    async fn background_refresh_failure_becomes_notice() {
        let fx = fixture();
        fx.controller.select_source(self_custodied(1)).await.unwrap();
        settle().await;
        fx.ledger.fail_next("getBalance");

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        let notice = fx.controller.state().notice.unwrap();
        assert_eq!(notice.kind, "operation_failure");

        // transient: gone after the notice duration
        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert!(fx.controller.state().notice.is_none());
    }

    #[tokio::test]
    async fn preferences_restore_selection_and_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(DbManager::new(dir.path().join("ledger.db")).unwrap());
        let preferences = Arc::new(Preferences::new(db));
        preferences.save_selection(&self_custodied(3)).unwrap();
        preferences.save_auto_refresh(false).unwrap();

        let fx = fixture_with(config(), Some(preferences.clone()));
        fx.controller.restore_preferences().await;

        let state = fx.controller.state();
        assert_eq!(state.account.unwrap().address, address(3));
        assert!(!state.auto_refresh_enabled);
        assert_eq!(fx.ledger.calls("getBalance"), 0);

        fx.controller.set_auto_refresh(true).await.unwrap();
        assert_eq!(fx.ledger.calls("getBalance"), 1);
        assert_eq!(preferences.auto_refresh().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn shutdown_stops_timers() {
        let fx = fixture();
        fx.controller.select_source(self_custodied(1)).await.unwrap();
        assert!(fx.controller.state().balance.auto_refresh);

        fx.controller.shutdown();
        let state = fx.controller.state();
        assert!(!state.balance.auto_refresh);
        assert!(!state.session.valid);
    }
}
