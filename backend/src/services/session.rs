use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ControllerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{Account, Address, Balance, SecurityDelay};
use crate::services::lifecycle::Generation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBalance {
    pub total: u128,
    pub available: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteWithdrawRequest {
    pub amount: u128,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteEligibility {
    pub can_execute: bool,
    pub time_remaining_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub transaction_reference: String,
}

/// Remote ledger operations for one signing account.
#[async_trait]
pub trait LedgerApi: Send + Sync {
    async fn get_balance(&self, address: &Address) -> anyhow::Result<RemoteBalance>;
    async fn deposit(&self, amount: u128) -> anyhow::Result<TxReceipt>;
    async fn deposit_for(&self, address: &Address, amount: u128) -> anyhow::Result<TxReceipt>;
    /// security delay in seconds
    async fn get_withdraw_delay(&self) -> anyhow::Result<u64>;
    async fn request_withdraw(&self, amount: u128) -> anyhow::Result<TxReceipt>;
    async fn get_withdraw_request(&self, address: &Address) -> anyhow::Result<Option<RemoteWithdrawRequest>>;
    async fn can_execute_withdraw(&self, address: &Address) -> anyhow::Result<RemoteEligibility>;
    async fn withdraw(&self, amount: u128) -> anyhow::Result<TxReceipt>;
}

/// Produces a [`LedgerApi`] bound to an account.
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    async fn connect(&self, account: &Account, network: &str) -> anyhow::Result<Arc<dyn LedgerApi>>;
}

/// Address-scoped handle for ledger operations. Discarded, never reused,
/// when the account changes.
pub struct LedgerSession {
    generation: Generation,
    account: Account,
    target: Address,
    api: Arc<dyn LedgerApi>,
    security_delay: RwLock<Option<SecurityDelay>>,
    call_timeout: Option<Duration>,
    decimals: u32,
}

impl std::fmt::Debug for LedgerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerSession")
            .field("generation", &self.generation)
            .field("account", &self.account)
            .field("target", &self.target)
            .field("security_delay", &*self.security_delay.read())
            .finish()
    }
}

impl LedgerSession {
    pub fn new(
        generation: Generation,
        account: Account,
        target: Address,
        api: Arc<dyn LedgerApi>,
        call_timeout: Option<Duration>,
        decimals: u32,
    ) -> Self {
        Self {
            generation,
            account,
            target,
            api,
            security_delay: RwLock::new(None),
            call_timeout,
            decimals,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Address whose balance is tracked; differs from the account in funding-only mode.
    pub fn target(&self) -> &Address {
        &self.target
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    pub fn security_delay(&self) -> Option<SecurityDelay> {
        *self.security_delay.read()
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> LedgerResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let result = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!("{} for {} timed out after {:?}", operation, self.account.address, limit);
                    return Err(LedgerError::Timeout(operation.to_string()));
                }
            },
            None => fut.await,
        };
        result.map_err(|e| {
            tracing::error!("{} for {} failed: {:#}", operation, self.account.address, e);
            LedgerError::operation(operation, format!("{:#}", e))
        })
    }

    pub async fn balance(&self, address: &Address, fetched_at: DateTime<Utc>) -> LedgerResult<Balance> {
        let raw = self.call("getBalance", self.api.get_balance(address)).await?;
        Balance::from_raw(address.clone(), raw.total, raw.available, self.decimals, fetched_at)
    }

    pub async fn deposit(&self, amount: u128) -> LedgerResult<TxReceipt> {
        self.call("deposit", self.api.deposit(amount)).await
    }

    pub async fn deposit_for(&self, address: &Address, amount: u128) -> LedgerResult<TxReceipt> {
        self.call("depositFor", self.api.deposit_for(address, amount)).await
    }

    pub async fn request_withdraw(&self, amount: u128) -> LedgerResult<TxReceipt> {
        self.call("requestWithdraw", self.api.request_withdraw(amount)).await
    }

    pub async fn withdraw_request(&self) -> LedgerResult<Option<RemoteWithdrawRequest>> {
        let address = &self.account.address;
        let request = self
            .call("getWithdrawRequest", self.api.get_withdraw_request(address))
            .await?;
        // the service reports an empty slot as a zero amount on some deployments
        Ok(request.filter(|r| r.amount > 0))
    }

    pub async fn can_execute_withdraw(&self) -> LedgerResult<RemoteEligibility> {
        let address = &self.account.address;
        self.call("canExecuteWithdraw", self.api.can_execute_withdraw(address)).await
    }

    pub async fn withdraw(&self, amount: u128) -> LedgerResult<TxReceipt> {
        self.call("withdraw", self.api.withdraw(amount)).await
    }

    /// Fetches the delay once; later calls return the stored value.
    pub async fn ensure_security_delay(&self) -> LedgerResult<SecurityDelay> {
        if let Some(delay) = self.security_delay() {
            return Ok(delay);
        }
        let seconds = self.call("getWithdrawDelay", self.api.get_withdraw_delay()).await?;
        let delay = SecurityDelay::from_seconds(seconds);
        let mut slot = self.security_delay.write();
        Ok(*slot.get_or_insert(delay))
    }
}

/// Acquires a [`LedgerSession`] for a bound account.
pub struct LedgerSessionFactory {
    connector: Option<Arc<dyn LedgerConnector>>,
    network: String,
    funding_target: Option<Address>,
    call_timeout: Option<Duration>,
    decimals: u32,
}

impl LedgerSessionFactory {
    pub fn new(connector: Option<Arc<dyn LedgerConnector>>, config: &ControllerConfig) -> Self {
        Self {
            connector,
            network: config.network.clone(),
            funding_target: config.funding_target.clone(),
            call_timeout: config.call_timeout,
            decimals: config.token_decimals,
        }
    }

    pub async fn acquire(&self, account: &Account, generation: Generation) -> LedgerResult<Arc<LedgerSession>> {
        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| LedgerError::session_unavailable("no ledger client configured"))?;

        let connect = connector.connect(account, &self.network);
        let api = match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| LedgerError::Timeout("ledger connect".into()))?,
            None => connect.await,
        }
        .map_err(|e| LedgerError::session_unavailable(format!("{:#}", e)))?;

        let target = self
            .funding_target
            .clone()
            .unwrap_or_else(|| account.address.clone());
        let session = Arc::new(LedgerSession::new(
            generation,
            account.clone(),
            target,
            api,
            self.call_timeout,
            self.decimals,
        ));

        match session.ensure_security_delay().await {
            Ok(delay) => tracing::info!(
                "Ledger session {} acquired for {} (security delay {}s)",
                generation.value(),
                account.address,
                delay.seconds
            ),
            Err(e) => tracing::warn!(
                "Ledger session {} acquired for {} without security delay: {}",
                generation.value(),
                account.address,
                e
            ),
        }

        Ok(session)
    }
}
