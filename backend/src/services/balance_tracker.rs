use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{Balance, OperationKind};
use crate::services::clock::Clock;
use crate::services::lifecycle::{ChangeNotifier, ComponentEvent, EventSender, Generation, TaskSlot};
use crate::services::session::LedgerSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied(Balance),
    /// the session changed while the call was outstanding
    Discarded,
    /// a refresh for this session was already running
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BalanceSnapshot {
    pub balance: Option<Balance>,
    pub loading: bool,
    pub auto_refresh: bool,
}

/// Caches the balance of the session's target address.
#[derive(Clone)]
pub struct BalanceTracker {
    inner: Arc<Inner>,
}

struct Inner {
    session: RwLock<Option<Arc<LedgerSession>>>,
    balance: RwLock<Option<Balance>>,
    in_flight: Mutex<Option<Generation>>,
    auto: TaskSlot,
    deferred: TaskSlot,
    notifier: ChangeNotifier,
    events: EventSender,
    clock: Arc<dyn Clock>,
}

/// Releases the in-flight stamp even when the refreshing task is aborted.
struct RefreshGuard<'a> {
    in_flight: &'a Mutex<Option<Generation>>,
    generation: Generation,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.in_flight.lock();
        if *slot == Some(self.generation) {
            *slot = None;
        }
    }
}

impl BalanceTracker {
    pub fn new(notifier: ChangeNotifier, events: EventSender, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: RwLock::new(None),
                balance: RwLock::new(None),
                in_flight: Mutex::new(None),
                auto: TaskSlot::new(),
                deferred: TaskSlot::new(),
                notifier,
                events,
                clock,
            }),
        }
    }

    /// Points the tracker at a new session. The cached balance and any
    /// deferred refresh belong to the old one and are dropped.
    pub fn bind(&self, session: Arc<LedgerSession>) {
        self.inner.deferred.clear();
        *self.inner.balance.write() = None;
        *self.inner.session.write() = Some(session);
        self.inner.notifier.notify();
    }

    pub fn unbind(&self) {
        self.inner.auto.clear();
        self.inner.deferred.clear();
        *self.inner.session.write() = None;
        *self.inner.balance.write() = None;
        self.inner.notifier.notify();
    }

    pub async fn refresh(&self) -> LedgerResult<RefreshOutcome> {
        self.inner.refresh().await
    }

    /// Starts the fixed-cadence loop, replacing any running one. The first
    /// tick fires one interval from now.
    pub fn start_auto_refresh(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let first = tokio::time::Instant::now() + interval;
        let handle = tokio::spawn(auto_refresh_loop(weak, first, interval));
        self.inner.auto.set(handle);
        self.inner.notifier.notify();
        tracing::debug!("Balance auto-refresh started every {:?}", interval);
    }

    pub fn stop(&self) {
        self.inner.auto.clear();
        self.inner.notifier.notify();
    }

    pub fn is_auto_refreshing(&self) -> bool {
        self.inner.auto.is_active()
    }

    /// One refresh after `delay`, replacing any refresh already scheduled.
    pub fn schedule_refresh(&self, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let deadline = tokio::time::Instant::now() + delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = inner.refresh().await {
                    inner.report(e);
                }
            }
        });
        self.inner.deferred.set(handle);
    }

    pub fn has_scheduled_refresh(&self) -> bool {
        self.inner.deferred.is_active()
    }

    pub fn balance(&self) -> Option<Balance> {
        self.inner.balance.read().clone()
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            balance: self.balance(),
            loading: self.inner.is_loading(),
            auto_refresh: self.is_auto_refreshing(),
        }
    }
}

impl Inner {
    fn current(&self) -> Option<Arc<LedgerSession>> {
        self.session.read().clone()
    }

    fn is_current(&self, generation: Generation) -> bool {
        self.session
            .read()
            .as_ref()
            .map(|s| s.generation() == generation)
            .unwrap_or(false)
    }

    fn is_loading(&self) -> bool {
        match (*self.in_flight.lock(), self.current()) {
            (Some(stamp), Some(session)) => stamp == session.generation(),
            _ => false,
        }
    }

    async fn refresh(&self) -> LedgerResult<RefreshOutcome> {
        let session = self
            .current()
            .ok_or_else(|| LedgerError::session_unavailable("no ledger session"))?;
        let generation = session.generation();

        let guard = {
            let mut slot = self.in_flight.lock();
            if *slot == Some(generation) {
                tracing::debug!("Balance refresh already running for session {}", generation.value());
                return Ok(RefreshOutcome::Skipped);
            }
            *slot = Some(generation);
            RefreshGuard {
                in_flight: &self.in_flight,
                generation,
            }
        };
        self.notifier.notify();

        let result = session.balance(session.target(), self.clock.now()).await;
        drop(guard);

        if !self.is_current(generation) {
            tracing::debug!("Discarding balance for superseded session {}", generation.value());
            return Ok(RefreshOutcome::Discarded);
        }

        match result {
            Ok(balance) => {
                tracing::debug!(
                    "Balance for {}: total={} available={}",
                    balance.address,
                    balance.total_balance.formatted,
                    balance.available_balance.formatted
                );
                *self.balance.write() = Some(balance.clone());
                self.notifier.notify();
                Ok(RefreshOutcome::Applied(balance))
            }
            Err(e) => {
                self.notifier.notify();
                Err(e)
            }
        }
    }

    fn report(&self, error: LedgerError) {
        tracing::warn!("Background balance refresh failed: {}", error);
        let _ = self.events.send(ComponentEvent::BackgroundFailure {
            operation: OperationKind::RefreshBalance,
            error,
        });
    }
}

async fn auto_refresh_loop(weak: Weak<Inner>, first: tokio::time::Instant, period: Duration) {
    let mut ticker = tokio::time::interval_at(first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        // awaited inline: the next tick is not polled until this returns
        match inner.refresh().await {
            Ok(RefreshOutcome::Skipped) => tracing::debug!("Auto-refresh tick skipped"),
            Ok(_) => {}
            Err(e) => inner.report(e),
        }
    }
}
