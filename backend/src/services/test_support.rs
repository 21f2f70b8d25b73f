//! Scripted fakes for component and controller tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::ControllerConfig;
use crate::models::{Account, AccountSourceKind, Address};
use crate::services::account_binder::AccountDeriver;
use crate::services::clock::Clock;
use crate::services::lifecycle::GenerationCounter;
use crate::services::session::{
    LedgerApi, LedgerConnector, LedgerSession, LedgerSessionFactory, RemoteBalance, RemoteEligibility,
    RemoteWithdrawRequest, TxReceipt,
};

pub fn address(n: u64) -> Address {
    Address::parse(&format!("0x{:040x}", n)).expect("test address")
}

pub fn account(n: u64, source: AccountSourceKind) -> Account {
    Account {
        address: address(n),
        source,
    }
}

pub const ETH: u128 = 1_000_000_000_000_000_000;

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Holding a gate blocks every call to its operation until the gate drops.
pub struct Gate {
    semaphore: Arc<Semaphore>,
}

impl Drop for Gate {
    fn drop(&mut self) {
        self.semaphore.close();
    }
}

#[derive(Default)]
struct Book {
    balances: HashMap<Address, RemoteBalance>,
    requests: HashMap<Address, RemoteWithdrawRequest>,
    eligibility: HashMap<Address, RemoteEligibility>,
    delay: u64,
    failures: HashMap<String, usize>,
    calls: HashMap<String, usize>,
    gates: HashMap<String, Arc<Semaphore>>,
    unreachable: bool,
    connects: usize,
    tx_seq: u64,
}

#[derive(Clone)]
pub struct FakeLedger {
    book: Arc<Mutex<Book>>,
    clock: Arc<ManualClock>,
    generations: Arc<GenerationCounter>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::with_clock(ManualClock::new())
    }

    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        let book = Book {
            delay: 3600,
            ..Default::default()
        };
        Self {
            book: Arc::new(Mutex::new(book)),
            clock,
            generations: Arc::new(GenerationCounter::new()),
        }
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        self.clock.clone()
    }

    /// A session for `address(n)` with a fresh generation and no call timeout.
    pub async fn session(&self, n: u64) -> Arc<LedgerSession> {
        let mut config = ControllerConfig::new("datil");
        config.call_timeout = None;
        let factory = LedgerSessionFactory::new(Some(FakeConnector::shared(self)), &config);
        factory
            .acquire(&account(n, AccountSourceKind::SelfCustodied), self.generations.advance())
            .await
            .expect("fake session")
    }

    pub fn set_delay(&self, seconds: u64) {
        self.book.lock().delay = seconds;
    }

    pub fn delay(&self) -> u64 {
        self.book.lock().delay
    }

    pub fn set_balance(&self, address: &Address, total: u128, available: u128) {
        self.book
            .lock()
            .balances
            .insert(address.clone(), RemoteBalance { total, available });
    }

    pub fn balance_of(&self, address: &Address) -> RemoteBalance {
        self.book
            .lock()
            .balances
            .get(address)
            .copied()
            .unwrap_or(RemoteBalance { total: 0, available: 0 })
    }

    pub fn set_request(&self, address: &Address, amount: u128, requested_at: DateTime<Utc>) {
        self.book.lock().requests.insert(
            address.clone(),
            RemoteWithdrawRequest { amount, requested_at },
        );
    }

    pub fn request_of(&self, address: &Address) -> Option<RemoteWithdrawRequest> {
        self.book.lock().requests.get(address).cloned()
    }

    /// Pins the service's `canExecuteWithdraw` answer regardless of the clock.
    pub fn set_eligibility(&self, address: &Address, can_execute: bool, time_remaining_secs: u64) {
        self.book.lock().eligibility.insert(
            address.clone(),
            RemoteEligibility {
                can_execute,
                time_remaining_secs,
            },
        );
    }

    pub fn fail_next(&self, operation: &str) {
        *self.book.lock().failures.entry(operation.to_string()).or_default() += 1;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.book.lock().unreachable = unreachable;
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.book.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn connects(&self) -> usize {
        self.book.lock().connects
    }

    pub fn hold(&self, operation: &str) -> Gate {
        let semaphore = Arc::new(Semaphore::new(0));
        self.book
            .lock()
            .gates
            .insert(operation.to_string(), semaphore.clone());
        Gate { semaphore }
    }

    async fn enter(&self, operation: &str) -> anyhow::Result<()> {
        let gate = {
            let mut book = self.book.lock();
            *book.calls.entry(operation.to_string()).or_default() += 1;
            book.gates.get(operation).cloned()
        };
        if let Some(gate) = gate {
            // resolves once the gate is closed
            let _ = gate.acquire().await;
        }
        let mut book = self.book.lock();
        book.gates.retain(|_, g| !g.is_closed());
        if let Some(count) = book.failures.get_mut(operation) {
            if *count > 0 {
                *count -= 1;
                anyhow::bail!("{} rejected by fake ledger", operation);
            }
        }
        Ok(())
    }

    fn receipt(&self) -> TxReceipt {
        let mut book = self.book.lock();
        book.tx_seq += 1;
        TxReceipt {
            transaction_reference: format!("0x{:064x}", book.tx_seq),
        }
    }

    fn eligibility_of(&self, address: &Address) -> RemoteEligibility {
        let book = self.book.lock();
        if let Some(pinned) = book.eligibility.get(address) {
            return *pinned;
        }
        match book.requests.get(address) {
            Some(request) => {
                let ready_at = request.requested_at + chrono::Duration::seconds(book.delay as i64);
                let remaining = (ready_at - self.clock.now()).num_seconds().max(0) as u64;
                RemoteEligibility {
                    can_execute: remaining == 0,
                    time_remaining_secs: remaining,
                }
            }
            None => RemoteEligibility {
                can_execute: false,
                time_remaining_secs: 0,
            },
        }
    }
}

pub struct FakeConnector {
    ledger: FakeLedger,
}

impl FakeConnector {
    pub fn shared(ledger: &FakeLedger) -> Arc<dyn LedgerConnector> {
        Arc::new(Self {
            ledger: ledger.clone(),
        })
    }
}

#[async_trait]
impl LedgerConnector for FakeConnector {
    async fn connect(&self, account: &Account, _network: &str) -> anyhow::Result<Arc<dyn LedgerApi>> {
        let mut book = self.ledger.book.lock();
        if book.unreachable {
            anyhow::bail!("ledger service unreachable");
        }
        book.connects += 1;
        Ok(Arc::new(FakeHandle {
            ledger: self.ledger.clone(),
            signer: account.address.clone(),
        }))
    }
}

struct FakeHandle {
    ledger: FakeLedger,
    signer: Address,
}

#[async_trait]
impl LedgerApi for FakeHandle {
    async fn get_balance(&self, address: &Address) -> anyhow::Result<RemoteBalance> {
        self.ledger.enter("getBalance").await?;
        Ok(self.ledger.balance_of(address))
    }

    async fn deposit(&self, amount: u128) -> anyhow::Result<TxReceipt> {
        self.ledger.enter("deposit").await?;
        let current = self.ledger.balance_of(&self.signer);
        self.ledger
            .set_balance(&self.signer, current.total + amount, current.available + amount);
        Ok(self.ledger.receipt())
    }

    async fn deposit_for(&self, address: &Address, amount: u128) -> anyhow::Result<TxReceipt> {
        self.ledger.enter("depositFor").await?;
        let current = self.ledger.balance_of(address);
        self.ledger
            .set_balance(address, current.total + amount, current.available + amount);
        Ok(self.ledger.receipt())
    }

    async fn get_withdraw_delay(&self) -> anyhow::Result<u64> {
        self.ledger.enter("getWithdrawDelay").await?;
        Ok(self.ledger.delay())
    }

    async fn request_withdraw(&self, amount: u128) -> anyhow::Result<TxReceipt> {
        self.ledger.enter("requestWithdraw").await?;
        if self.ledger.request_of(&self.signer).is_some() {
            anyhow::bail!("withdrawal already requested");
        }
        let now = self.ledger.clock.now();
        self.ledger.set_request(&self.signer, amount, now);
        Ok(self.ledger.receipt())
    }

    async fn get_withdraw_request(&self, address: &Address) -> anyhow::Result<Option<RemoteWithdrawRequest>> {
        self.ledger.enter("getWithdrawRequest").await?;
        Ok(self.ledger.request_of(address))
    }

    async fn can_execute_withdraw(&self, address: &Address) -> anyhow::Result<RemoteEligibility> {
        self.ledger.enter("canExecuteWithdraw").await?;
        Ok(self.ledger.eligibility_of(address))
    }

    async fn withdraw(&self, amount: u128) -> anyhow::Result<TxReceipt> {
        self.ledger.enter("withdraw").await?;
        if !self.ledger.eligibility_of(&self.signer).can_execute {
            anyhow::bail!("security delay has not elapsed");
        }
        let current = self.ledger.balance_of(&self.signer);
        self.ledger.set_balance(
            &self.signer,
            current.total.saturating_sub(amount),
            current.available.min(current.total.saturating_sub(amount)),
        );
        let mut book = self.ledger.book.lock();
        book.requests.remove(&self.signer);
        book.eligibility.remove(&self.signer);
        drop(book);
        Ok(self.ledger.receipt())
    }
}

/// Derives `address(n)` for public key id `"pk-n"`.
#[derive(Clone, Default)]
pub struct FakeDeriver {
    gates: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    failures: Arc<Mutex<usize>>,
    calls: Arc<Mutex<usize>>,
}

impl FakeDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self, public_key_id: &str) -> Gate {
        let semaphore = Arc::new(Semaphore::new(0));
        self.gates
            .lock()
            .insert(public_key_id.to_string(), semaphore.clone());
        Gate { semaphore }
    }

    pub fn fail_next(&self) {
        *self.failures.lock() += 1;
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl AccountDeriver for FakeDeriver {
    async fn derive(&self, public_key_id: &str, _network: &str) -> anyhow::Result<Address> {
        *self.calls.lock() += 1;
        let gate = self.gates.lock().get(public_key_id).cloned();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("derivation rejected for {}", public_key_id);
            }
        }
        let n: u64 = public_key_id
            .strip_prefix("pk-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("unknown public key {}", public_key_id))?;
        Ok(address(n))
    }
}
