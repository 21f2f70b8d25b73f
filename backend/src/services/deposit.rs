use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{parse_units, Address, Drafts, InputField, OperationKind, OperationOutcome, TokenAmount};
use crate::services::clock::Clock;
use crate::services::lifecycle::{ChangeNotifier, Generation, InFlight};
use crate::services::session::LedgerSession;

/// One-shot deposits. Each call-site runs at most once at a time; a second
/// submission is refused, not queued.
pub struct DepositExecutor {
    flights: InFlight,
    drafts: Drafts,
    notifier: ChangeNotifier,
    clock: Arc<dyn Clock>,
    /// drafts belong to this binding; results from older ones leave them alone
    bound: RwLock<Option<Generation>>,
}

impl DepositExecutor {
    pub fn new(flights: InFlight, drafts: Drafts, notifier: ChangeNotifier, clock: Arc<dyn Clock>) -> Self {
        Self {
            flights,
            drafts,
            notifier,
            clock,
            bound: RwLock::new(None),
        }
    }

    pub fn bind(&self, generation: Generation) {
        *self.bound.write() = Some(generation);
    }

    pub fn unbind(&self) {
        *self.bound.write() = None;
    }

    pub async fn deposit_self(&self, session: &LedgerSession, amount: u128) -> LedgerResult<OperationOutcome> {
        let target = session.account().address.clone();
        self.run(OperationKind::DepositSelf, session, target, amount).await
    }

    pub async fn deposit_for(
        &self,
        session: &LedgerSession,
        target: &Address,
        amount: u128,
    ) -> LedgerResult<OperationOutcome> {
        self.run(OperationKind::DepositFor, session, target.clone(), amount)
            .await
    }

    /// Deposits the `deposit_self_amount` draft and clears it on success.
    pub async fn submit_self(&self, session: &LedgerSession) -> LedgerResult<OperationOutcome> {
        let drawn = self.drafts.get(InputField::DepositSelfAmount);
        let amount = parse_units(&drawn, session.decimals())?;
        let outcome = self.deposit_self(session, amount).await?;
        self.clear(session, InputField::DepositSelfAmount, &drawn);
        Ok(outcome)
    }

    /// Deposits the `deposit_for_amount` draft to `deposit_for_address`,
    /// falling back to `default_target` when no address was entered.
    pub async fn submit_for(
        &self,
        session: &LedgerSession,
        default_target: Option<&Address>,
    ) -> LedgerResult<OperationOutcome> {
        let drawn_address = self.drafts.get(InputField::DepositForAddress);
        let drawn_amount = self.drafts.get(InputField::DepositForAmount);

        let target = if drawn_address.trim().is_empty() {
            default_target
                .cloned()
                .ok_or_else(|| LedgerError::InvalidAddress("recipient address is required".into()))?
        } else {
            Address::parse(&drawn_address)?
        };
        let amount = parse_units(&drawn_amount, session.decimals())?;

        let outcome = self.deposit_for(session, &target, amount).await?;
        self.clear(session, InputField::DepositForAmount, &drawn_amount);
        if !drawn_address.is_empty() {
            self.clear(session, InputField::DepositForAddress, &drawn_address);
        }
        Ok(outcome)
    }

    fn clear(&self, session: &LedgerSession, field: InputField, drawn: &str) {
        if *self.bound.read() != Some(session.generation()) {
            tracing::debug!("Keeping {:?} draft, deposit finished for a previous account", field);
            return;
        }
        if self.drafts.clear_if_unchanged(field, drawn) {
            self.notifier.notify();
        }
    }

    async fn run(
        &self,
        kind: OperationKind,
        session: &LedgerSession,
        target: Address,
        amount: u128,
    ) -> LedgerResult<OperationOutcome> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount("amount must be greater than zero".into()));
        }
        let guard = self.flights.begin_or_busy(kind)?;
        self.notifier.notify();

        let result = match kind {
            OperationKind::DepositFor => session.deposit_for(&target, amount).await,
            _ => session.deposit(amount).await,
        };
        drop(guard);
        self.notifier.notify();

        let receipt = result?;
        let outcome = OperationOutcome::new(
            kind,
            receipt.transaction_reference,
            target,
            TokenAmount::from_raw(amount, session.decimals()),
            self.clock.now(),
        );
        tracing::info!(
            "Deposited {} to {} ({})",
            outcome.amount.formatted,
            outcome.address,
            outcome.transaction_reference
        );
        Ok(outcome)
    }
}
