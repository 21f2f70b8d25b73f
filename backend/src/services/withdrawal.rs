//! Two-phase withdrawal: request, wait out the security delay, execute.
//!
//! The local countdown only drives the display. `canExecuteWithdraw` is asked
//! again immediately before every `withdraw`, and once when the countdown
//! first reaches zero.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    EligibilitySource, OperationKind, OperationOutcome, SecurityDelay, TokenAmount, WithdrawalEligibility,
    WithdrawalRequest,
};
use crate::services::clock::Clock;
use crate::services::lifecycle::{
    ChangeNotifier, ComponentEvent, EventSender, Generation, InFlight, TaskSlot,
};
use crate::services::session::{LedgerSession, RemoteEligibility, RemoteWithdrawRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalPhase {
    Idle,
    Pending,
    PendingExecutable,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalSnapshot {
    pub phase: WithdrawalPhase,
    pub request: Option<WithdrawalRequest>,
    pub eligibility: Option<WithdrawalEligibility>,
    pub security_delay: Option<SecurityDelay>,
    pub loading: bool,
    pub checking: bool,
}

#[derive(Debug, Clone, Copy)]
struct ServiceAnswer {
    checked_at: DateTime<Utc>,
    can_execute: bool,
    remaining: Duration,
}

#[derive(Debug, Default)]
struct State {
    request: Option<WithdrawalRequest>,
    eligibility: Option<WithdrawalEligibility>,
    service: Option<ServiceAnswer>,
    /// the countdown already triggered its one authoritative check
    reconciled: bool,
}

impl State {
    fn phase(&self) -> WithdrawalPhase {
        match (&self.request, &self.eligibility) {
            (None, _) => WithdrawalPhase::Idle,
            (Some(_), Some(e)) if e.can_execute => WithdrawalPhase::PendingExecutable,
            (Some(_), _) => WithdrawalPhase::Pending,
        }
    }

    /// The countdown never contradicts a service `true`, and never runs
    /// ahead of the service's own remaining time.
    fn advisory(&self, delay: Option<SecurityDelay>, now: DateTime<Utc>) -> Option<WithdrawalEligibility> {
        let request = self.request.as_ref()?;
        if let Some(answer) = self.service.filter(|a| a.can_execute) {
            return Some(service_eligibility(answer));
        }

        let local = delay.and_then(|d| d.ready_at(request.requested_at));
        let service = self.service.and_then(|a| {
            let remaining = chrono::Duration::from_std(a.remaining).ok()?;
            a.checked_at.checked_add_signed(remaining)
        });
        let ready_at = match (local, service) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Some(match ready_at {
            Some(ready_at) => {
                let remaining = (ready_at - now).to_std().unwrap_or(Duration::ZERO);
                WithdrawalEligibility {
                    can_execute: remaining.is_zero(),
                    time_remaining: Some(remaining),
                    source: EligibilitySource::Countdown,
                }
            }
            None => WithdrawalEligibility::countdown(request.requested_at, None, now),
        })
    }
}

fn service_eligibility(answer: ServiceAnswer) -> WithdrawalEligibility {
    WithdrawalEligibility {
        can_execute: answer.can_execute,
        time_remaining: Some(if answer.can_execute { Duration::ZERO } else { answer.remaining }),
        source: EligibilitySource::Service,
    }
}

#[derive(Clone)]
pub struct WithdrawalCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    session: RwLock<Option<Arc<LedgerSession>>>,
    state: Mutex<State>,
    loading: Mutex<Option<Generation>>,
    flights: InFlight,
    ticker: TaskSlot,
    reconcile: TaskSlot,
    tick: Duration,
    notifier: ChangeNotifier,
    events: EventSender,
    clock: Arc<dyn Clock>,
}

impl WithdrawalCoordinator {
    pub fn new(
        flights: InFlight,
        notifier: ChangeNotifier,
        events: EventSender,
        clock: Arc<dyn Clock>,
        tick: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: RwLock::new(None),
                state: Mutex::new(State::default()),
                loading: Mutex::new(None),
                flights,
                ticker: TaskSlot::new(),
                reconcile: TaskSlot::new(),
                tick,
                notifier,
                events,
                clock,
            }),
        }
    }

    /// Resets the machine to Idle for a new session.
    pub fn bind(&self, session: Arc<LedgerSession>) {
        self.inner.reset(Some(session));
    }

    pub fn unbind(&self) {
        self.inner.reset(None);
    }

    pub fn phase(&self) -> WithdrawalPhase {
        self.inner.state.lock().phase()
    }

    pub fn request(&self) -> Option<WithdrawalRequest> {
        self.inner.state.lock().request.clone()
    }

    pub fn is_counting_down(&self) -> bool {
        self.inner.ticker.is_active()
    }

    pub fn snapshot(&self) -> WithdrawalSnapshot {
        let security_delay = self.inner.current().and_then(|s| s.security_delay());
        let state = self.inner.state.lock();
        WithdrawalSnapshot {
            phase: state.phase(),
            request: state.request.clone(),
            eligibility: state.eligibility.clone(),
            security_delay,
            loading: self.inner.is_loading(),
            checking: self.inner.flights.contains(OperationKind::CheckEligibility),
        }
    }

    /// Loads a request made in an earlier session so it resumes as Pending.
    pub async fn load(&self) -> LedgerResult<Option<WithdrawalRequest>> {
        let session = self.inner.require_session()?;
        let generation = session.generation();

        *self.inner.loading.lock() = Some(generation);
        self.inner.notifier.notify();
        let result = session.withdraw_request().await;
        {
            let mut loading = self.inner.loading.lock();
            if *loading == Some(generation) {
                *loading = None;
            }
        }

        let remote = match result {
            Ok(remote) => remote,
            Err(e) => {
                self.inner.notifier.notify();
                return Err(e);
            }
        };
        if !self.inner.is_current(generation) {
            tracing::debug!("Discarding withdrawal request for superseded session {}", generation.value());
            return Ok(None);
        }

        let request = remote.map(|r| to_request(&r, session.decimals()));
        match &request {
            Some(r) => {
                tracing::info!(
                    "Resuming pending withdrawal of {} for {}",
                    r.amount.formatted,
                    session.account().address
                );
                self.inner.apply_request(r.clone());
                Inner::start_countdown(&self.inner);
            }
            None => {
                self.inner.ticker.clear();
                *self.inner.state.lock() = State::default();
                self.inner.notifier.notify();
            }
        }
        Ok(request)
    }

    /// Submits a withdrawal request. At most one may be pending; a second
    /// one is refused here without contacting the service.
    pub async fn submit_request(&self, amount: u128, available: Option<u128>) -> LedgerResult<OperationOutcome> {
        let session = self.inner.require_session()?;
        if self.inner.state.lock().request.is_some() {
            return Err(LedgerError::AlreadyPending);
        }
        if amount == 0 {
            return Err(LedgerError::InvalidAmount("amount must be greater than zero".into()));
        }
        let decimals = session.decimals();
        if let Some(available) = available.filter(|a| amount > *a) {
            return Err(LedgerError::InsufficientBalance {
                available: TokenAmount::from_raw(available, decimals).formatted,
                requested: TokenAmount::from_raw(amount, decimals).formatted,
            });
        }

        let guard = self.inner.flights.begin_or_busy(OperationKind::RequestWithdraw)?;
        self.inner.notifier.notify();
        let result = session.request_withdraw(amount).await;
        drop(guard);
        self.inner.notifier.notify();
        let receipt = result?;

        let outcome = OperationOutcome::new(
            OperationKind::RequestWithdraw,
            receipt.transaction_reference,
            session.account().address.clone(),
            TokenAmount::from_raw(amount, decimals),
            self.inner.clock.now(),
        );
        tracing::info!(
            "Withdrawal of {} requested for {} ({})",
            outcome.amount.formatted,
            outcome.address,
            outcome.transaction_reference
        );

        if !self.inner.is_current(session.generation()) {
            return Ok(outcome);
        }
        self.inner.apply_request(WithdrawalRequest {
            amount: outcome.amount.clone(),
            requested_at: outcome.completed_at,
            pending: true,
        });

        // the service's timestamp wins when it is already readable
        match session.withdraw_request().await {
            Ok(Some(remote)) if self.inner.is_current(session.generation()) => {
                self.inner.apply_request(to_request(&remote, decimals));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Could not re-read withdrawal request: {}", e),
        }
        if self.inner.is_current(session.generation()) {
            Inner::start_countdown(&self.inner);
        }
        Ok(outcome)
    }

    /// Authoritative eligibility from the service. Idle answers `None`
    /// without a remote call.
    pub async fn check_eligibility(&self) -> LedgerResult<Option<WithdrawalEligibility>> {
        let session = self.inner.require_session()?;
        if self.inner.state.lock().request.is_none() {
            return Ok(None);
        }
        let guard = self.inner.flights.begin_or_busy(OperationKind::CheckEligibility)?;
        self.inner.notifier.notify();
        let result = self.inner.authoritative(&session).await;
        drop(guard);
        self.inner.notifier.notify();
        result.map(Some)
    }

    /// Executes the pending withdrawal after a fresh `canExecuteWithdraw`.
    /// On any failure the request stays as it was.
    pub async fn execute(&self) -> LedgerResult<OperationOutcome> {
        let session = self.inner.require_session()?;
        let request = self
            .inner
            .state
            .lock()
            .request
            .clone()
            .ok_or(LedgerError::NoPendingWithdrawal)?;

        let guard = self.inner.flights.begin_or_busy(OperationKind::ExecuteWithdraw)?;
        self.inner.notifier.notify();
        let result = self.execute_checked(&session, &request).await;
        drop(guard);
        self.inner.notifier.notify();
        result
    }

    async fn execute_checked(
        &self,
        session: &Arc<LedgerSession>,
        request: &WithdrawalRequest,
    ) -> LedgerResult<OperationOutcome> {
        let eligibility = self.inner.authoritative(session).await?;
        if !eligibility.can_execute {
            return Err(LedgerError::NotExecutable {
                time_remaining: eligibility.time_remaining,
            });
        }

        let receipt = session.withdraw(request.amount.raw).await?;
        let outcome = OperationOutcome::new(
            OperationKind::ExecuteWithdraw,
            receipt.transaction_reference,
            session.account().address.clone(),
            request.amount.clone(),
            self.inner.clock.now(),
        );
        tracing::info!(
            "Withdrawal of {} executed for {} ({})",
            outcome.amount.formatted,
            outcome.address,
            outcome.transaction_reference
        );

        if self.inner.is_current(session.generation()) {
            self.inner.ticker.clear();
            self.inner.reconcile.clear();
            *self.inner.state.lock() = State::default();
        }
        Ok(outcome)
    }
}

fn to_request(remote: &RemoteWithdrawRequest, decimals: u32) -> WithdrawalRequest {
    WithdrawalRequest {
        amount: TokenAmount::from_raw(remote.amount, decimals),
        requested_at: remote.requested_at,
        pending: true,
    }
}

impl Inner {
    fn current(&self) -> Option<Arc<LedgerSession>> {
        self.session.read().clone()
    }

    fn require_session(&self) -> LedgerResult<Arc<LedgerSession>> {
        self.current()
            .ok_or_else(|| LedgerError::session_unavailable("no ledger session"))
    }

    fn is_current(&self, generation: Generation) -> bool {
        self.session
            .read()
            .as_ref()
            .map(|s| s.generation() == generation)
            .unwrap_or(false)
    }

    fn is_loading(&self) -> bool {
        match (*self.loading.lock(), self.current()) {
            (Some(stamp), Some(session)) => stamp == session.generation(),
            _ => false,
        }
    }

    fn reset(&self, session: Option<Arc<LedgerSession>>) {
        self.ticker.clear();
        self.reconcile.clear();
        *self.state.lock() = State::default();
        *self.loading.lock() = None;
        *self.session.write() = session;
        self.notifier.notify();
    }

    fn apply_request(&self, request: WithdrawalRequest) {
        let delay = self.current().and_then(|s| s.security_delay());
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            let same = state
                .request
                .as_ref()
                .map(|r| r.amount == request.amount && r.requested_at == request.requested_at)
                .unwrap_or(false);
            if !same {
                state.service = None;
                state.reconciled = false;
            }
            state.request = Some(request);
            state.eligibility = state.advisory(delay, now);
        }
        self.notifier.notify();
    }

    async fn authoritative(&self, session: &Arc<LedgerSession>) -> LedgerResult<WithdrawalEligibility> {
        if session.security_delay().is_none() {
            if let Err(e) = session.ensure_security_delay().await {
                tracing::warn!("Security delay still unknown: {}", e);
            }
        }

        let RemoteEligibility {
            can_execute,
            time_remaining_secs,
        } = session.can_execute_withdraw().await?;
        let answer = ServiceAnswer {
            checked_at: self.clock.now(),
            can_execute,
            remaining: Duration::from_secs(time_remaining_secs),
        };
        let eligibility = service_eligibility(answer);

        if self.is_current(session.generation()) {
            let mut state = self.state.lock();
            if state.request.is_some() {
                state.service = Some(answer);
                state.eligibility = Some(eligibility.clone());
            }
        }
        Ok(eligibility)
    }

    fn start_countdown(this: &Arc<Inner>) {
        if this.tick.is_zero() {
            return;
        }
        let weak = Arc::downgrade(this);
        let first = tokio::time::Instant::now() + this.tick;
        let handle = tokio::spawn(countdown_loop(weak, first, this.tick));
        this.ticker.set(handle);
    }

    /// Returns false once there is nothing left to count down.
    fn on_tick(this: &Arc<Inner>) -> bool {
        let Some(session) = this.current() else {
            return false;
        };
        let now = this.clock.now();
        let (changed, reconcile) = {
            let mut state = this.state.lock();
            let Some(eligibility) = state.advisory(session.security_delay(), now) else {
                return false;
            };
            let changed = state.eligibility.as_ref() != Some(&eligibility);
            let reconcile = eligibility.can_execute
                && eligibility.source == EligibilitySource::Countdown
                && !state.reconciled;
            if reconcile {
                state.reconciled = true;
            }
            state.eligibility = Some(eligibility);
            (changed, reconcile)
        };
        if changed {
            this.notifier.notify();
        }
        if reconcile {
            tracing::debug!("Countdown reached zero, asking the service");
            let weak = Arc::downgrade(this);
            let handle = tokio::spawn(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let Some(guard) = inner.flights.try_begin(OperationKind::CheckEligibility) else {
                    return;
                };
                inner.notifier.notify();
                let result = inner.authoritative(&session).await;
                drop(guard);
                inner.notifier.notify();
                if let Err(error) = result {
                    tracing::warn!("Eligibility reconciliation failed: {}", error);
                    let _ = inner.events.send(ComponentEvent::BackgroundFailure {
                        operation: OperationKind::CheckEligibility,
                        error,
                    });
                }
            });
            this.reconcile.set(handle);
        }
        true
    }
}

async fn countdown_loop(weak: Weak<Inner>, first: tokio::time::Instant, tick: Duration) {
    let mut ticker = tokio::time::interval_at(first, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if !Inner::on_tick(&inner) {
            break;
        }
    }
}
