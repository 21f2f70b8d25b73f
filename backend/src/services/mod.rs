pub mod account_binder;
pub mod balance_tracker;
pub mod clock;
pub mod controller;
pub mod deposit;
pub mod lifecycle;
pub mod local_ledger;
pub mod notices;
pub mod remote;
pub mod session;
pub mod withdrawal;

#[cfg(test)]
pub mod test_support;

pub use controller::{ControllerDeps, LedgerController};
