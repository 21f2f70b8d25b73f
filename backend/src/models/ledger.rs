use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{LedgerError, LedgerResult};
use crate::models::amount::TokenAmount;

/// A 20-byte hex account address, normalised to lowercase with a `0x` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(input: &str) -> LedgerResult<Self> {
        let trimmed = input.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| LedgerError::InvalidAddress(format!("{} is missing 0x prefix", trimmed)))?;
        let bytes = hex::decode(body)
            .map_err(|e| LedgerError::InvalidAddress(format!("{}: {}", trimmed, e)))?;
        if bytes.len() != 20 {
            return Err(LedgerError::InvalidAddress(format!(
                "{} is {} bytes, expected 20",
                trimmed,
                bytes.len()
            )));
        }
        Ok(Self(format!("0x{}", hex::encode(bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountSourceKind {
    /// derived from a custodial key held by the auth layer
    Delegated,
    /// supplied directly by the user
    SelfCustodied,
}

impl AccountSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountSourceKind::Delegated => "delegated",
            AccountSourceKind::SelfCustodied => "self_custodied",
        }
    }
}

/// The account-source selection made by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum AccountSelection {
    Delegated,
    SelfCustodied { address: Address },
}

impl AccountSelection {
    pub fn kind(&self) -> AccountSourceKind {
        match self {
            AccountSelection::Delegated => AccountSourceKind::Delegated,
            AccountSelection::SelfCustodied { .. } => AccountSourceKind::SelfCustodied,
        }
    }
}

/// Opaque signing identity. Two accounts are the same identity only if both
/// address and source match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub address: Address,
    pub source: AccountSourceKind,
}

/// What the auth layer currently knows. Owned upstream; the binder only reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    pub has_credential: bool,
    pub public_key_id: Option<String>,
}

/// Ledger balance for one address. Replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub address: Address,
    pub total_balance: TokenAmount,
    pub available_balance: TokenAmount,
    pub fetched_at: DateTime<Utc>,
}

impl Balance {
    /// Builds a balance from raw service values, rejecting `available > total`.
    pub fn from_raw(
        address: Address,
        total: u128,
        available: u128,
        decimals: u32,
        fetched_at: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        if available > total {
            return Err(LedgerError::operation(
                "getBalance",
                format!("available balance {} exceeds total {}", available, total),
            ));
        }
        Ok(Self {
            address,
            total_balance: TokenAmount::from_raw(total, decimals),
            available_balance: TokenAmount::from_raw(available, decimals),
            fetched_at,
        })
    }
}

/// Mandatory wait between withdrawal request and execution, fixed per session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SecurityDelay {
    pub seconds: u64,
    pub hours: f64,
}

impl SecurityDelay {
    pub fn from_seconds(seconds: u64) -> Self {
        Self {
            seconds,
            hours: seconds as f64 / 3600.0,
        }
    }

    /// When a request made at `requested_at` becomes executable. `None` if that
    /// instant is not representable, which callers treat as an unknown delay.
    pub fn ready_at(&self, requested_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let seconds = i64::try_from(self.seconds).ok()?;
        requested_at.checked_add_signed(chrono::Duration::try_seconds(seconds)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WithdrawalRequest {
    pub amount: TokenAmount,
    pub requested_at: DateTime<Utc>,
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilitySource {
    /// derived locally from `requested_at + delay`
    Countdown,
    /// answered by the ledger service
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WithdrawalEligibility {
    pub can_execute: bool,
    /// None when the security delay is unknown and no countdown can be shown
    #[serde(serialize_with = "serialize_opt_secs")]
    pub time_remaining: Option<Duration>,
    pub source: EligibilitySource,
}

impl WithdrawalEligibility {
    /// Advisory eligibility from the request time and delay.
    pub fn countdown(
        requested_at: DateTime<Utc>,
        delay: Option<SecurityDelay>,
        now: DateTime<Utc>,
    ) -> Self {
        match delay.and_then(|d| d.ready_at(requested_at)) {
            Some(ready_at) => {
                let remaining = (ready_at - now).to_std().unwrap_or(Duration::ZERO);
                Self {
                    can_execute: remaining.is_zero(),
                    time_remaining: Some(remaining),
                    source: EligibilitySource::Countdown,
                }
            }
            None => Self {
                can_execute: false,
                time_remaining: None,
                source: EligibilitySource::Countdown,
            },
        }
    }
}

fn serialize_opt_secs<S: serde::Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => s.serialize_some(&d.as_secs()),
        None => s.serialize_none(),
    }
}

/// Logical actions the controller tracks for in-flight flags and success pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    DepositSelf,
    DepositFor,
    RequestWithdraw,
    CheckEligibility,
    ExecuteWithdraw,
    RefreshBalance,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::DepositSelf => "deposit_self",
            OperationKind::DepositFor => "deposit_for",
            OperationKind::RequestWithdraw => "request_withdraw",
            OperationKind::CheckEligibility => "check_eligibility",
            OperationKind::ExecuteWithdraw => "execute_withdraw",
            OperationKind::RefreshBalance => "refresh_balance",
        }
    }
}

/// Result of a state-changing ledger call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub id: uuid::Uuid,
    pub kind: OperationKind,
    pub transaction_reference: String,
    /// address whose ledger entry changed
    pub address: Address,
    pub amount: TokenAmount,
    pub completed_at: DateTime<Utc>,
}

impl OperationOutcome {
    pub fn new(
        kind: OperationKind,
        transaction_reference: String,
        address: Address,
        amount: TokenAmount,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            kind,
            transaction_reference,
            address,
            amount,
            completed_at,
        }
    }
}

/// Fire-and-forget notification for observers outside the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerChanged {
    pub address: Address,
    pub kind: OperationKind,
    pub transaction_reference: String,
}

impl From<&OperationOutcome> for LedgerChanged {
    fn from(outcome: &OperationOutcome) -> Self {
        Self {
            address: outcome.address.clone(),
            kind: outcome.kind,
            transaction_reference: outcome.transaction_reference.clone(),
        }
    }
}
