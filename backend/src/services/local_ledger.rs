//! In-process ledger used with `LEDGER_MODE=local` for demos and development.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{Account, Address, SecurityDelay};
use crate::services::clock::Clock;
use crate::services::session::{
    LedgerApi, LedgerConnector, RemoteBalance, RemoteEligibility, RemoteWithdrawRequest, TxReceipt,
};

#[derive(Debug, Default, Clone, Copy)]
struct Entry {
    total: u128,
    /// held by a pending withdrawal request
    locked: u128,
}

#[derive(Default)]
struct Book {
    entries: HashMap<Address, Entry>,
    requests: HashMap<Address, RemoteWithdrawRequest>,
}

#[derive(Clone)]
pub struct LocalLedger {
    book: Arc<Mutex<Book>>,
    delay: Duration,
    clock: Arc<dyn Clock>,
}

impl LocalLedger {
    pub fn new(delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            book: Arc::new(Mutex::new(Book::default())),
            delay,
            clock,
        }
    }

    pub fn credit(&self, address: &Address, amount: u128) {
        let mut book = self.book.lock();
        let entry = book.entries.entry(address.clone()).or_default();
        entry.total = entry.total.saturating_add(amount);
    }

    fn eligibility(&self, address: &Address) -> RemoteEligibility {
        let book = self.book.lock();
        match book.requests.get(address) {
            Some(request) => {
                match SecurityDelay::from_seconds(self.delay.as_secs()).ready_at(request.requested_at) {
                    Some(ready_at) => {
                        let remaining = (ready_at - self.clock.now()).num_seconds().max(0) as u64;
                        RemoteEligibility {
                            can_execute: remaining == 0,
                            time_remaining_secs: remaining,
                        }
                    }
                    None => RemoteEligibility {
                        can_execute: false,
                        time_remaining_secs: u64::MAX,
                    },
                }
            }
            None => RemoteEligibility {
                can_execute: false,
                time_remaining_secs: 0,
            },
        }
    }
}

fn receipt() -> TxReceipt {
    let bytes: [u8; 32] = rand::random();
    TxReceipt {
        transaction_reference: format!("0x{}", hex::encode(bytes)),
    }
}

#[async_trait]
impl LedgerConnector for LocalLedger {
    async fn connect(&self, account: &Account, network: &str) -> Result<Arc<dyn LedgerApi>> {
        tracing::debug!("Local ledger session for {} on {}", account.address, network);
        Ok(Arc::new(LocalHandle {
            ledger: self.clone(),
            signer: account.address.clone(),
        }))
    }
}

struct LocalHandle {
    ledger: LocalLedger,
    signer: Address,
}

#[async_trait]
impl LedgerApi for LocalHandle {
    async fn get_balance(&self, address: &Address) -> Result<RemoteBalance> {
        let book = self.ledger.book.lock();
        let entry = book.entries.get(address).copied().unwrap_or_default();
        Ok(RemoteBalance {
            total: entry.total,
            available: entry.total - entry.locked,
        })
    }

    async fn deposit(&self, amount: u128) -> Result<TxReceipt> {
        self.ledger.credit(&self.signer, amount);
        Ok(receipt())
    }

    async fn deposit_for(&self, address: &Address, amount: u128) -> Result<TxReceipt> {
        self.ledger.credit(address, amount);
        Ok(receipt())
    }

    async fn get_withdraw_delay(&self) -> Result<u64> {
        Ok(self.ledger.delay.as_secs())
    }

    async fn request_withdraw(&self, amount: u128) -> Result<TxReceipt> {
        let now = self.ledger.clock.now();
        let mut book = self.ledger.book.lock();
        if book.requests.contains_key(&self.signer) {
            bail!("a withdrawal request already exists");
        }
        let entry = book.entries.entry(self.signer.clone()).or_default();
        let available = entry.total - entry.locked;
        if amount > available {
            bail!("amount {} exceeds available balance {}", amount, available);
        }
        entry.locked += amount;
        book.requests.insert(
            self.signer.clone(),
            RemoteWithdrawRequest {
                amount,
                requested_at: now,
            },
        );
        Ok(receipt())
    }

    async fn get_withdraw_request(&self, address: &Address) -> Result<Option<RemoteWithdrawRequest>> {
        Ok(self.ledger.book.lock().requests.get(address).cloned())
    }

    async fn can_execute_withdraw(&self, address: &Address) -> Result<RemoteEligibility> {
        Ok(self.ledger.eligibility(address))
    }

    async fn withdraw(&self, amount: u128) -> Result<TxReceipt> {
        let eligibility = self.ledger.eligibility(&self.signer);
        let mut book = self.ledger.book.lock();
        let Some(request) = book.requests.get(&self.signer).cloned() else {
            bail!("no withdrawal request");
        };
        if !eligibility.can_execute {
            bail!("security delay has {}s remaining", eligibility.time_remaining_secs);
        }
        if amount > request.amount {
            bail!("amount {} exceeds requested {}", amount, request.amount);
        }
        let entry = book.entries.entry(self.signer.clone()).or_default();
        entry.locked -= request.amount;
        entry.total -= amount;
        book.requests.remove(&self.signer);
        Ok(receipt())
    }
}
