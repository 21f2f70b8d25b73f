use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{check, http_client, u128_string};
use crate::models::{Account, Address};
use crate::services::session::{
    LedgerApi, LedgerConnector, RemoteBalance, RemoteEligibility, RemoteWithdrawRequest, TxReceipt,
};

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(with = "u128_string")]
    total: u128,
    #[serde(with = "u128_string")]
    available: u128,
}

#[derive(Debug, Serialize)]
struct AmountRequest<'a> {
    from: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<&'a str>,
    #[serde(with = "u128_string")]
    amount: u128,
}

#[derive(Debug, Deserialize)]
struct ReceiptResponse {
    transaction_reference: String,
}

#[derive(Debug, Deserialize)]
struct DelayResponse {
    seconds: u64,
}

#[derive(Debug, Deserialize)]
struct WithdrawRequestResponse {
    #[serde(with = "u128_string")]
    amount: u128,
    requested_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct EligibilityResponse {
    can_execute: bool,
    #[serde(default)]
    time_remaining_secs: u64,
}

/// Connects to the ledger service's HTTP API.
pub struct HttpLedgerConnector {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLedgerConnector {
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LedgerConnector for HttpLedgerConnector {
    async fn connect(&self, account: &Account, network: &str) -> Result<Arc<dyn LedgerApi>> {
        let root = format!("{}/v1/{}", self.base_url, network);
        check(self.client.get(format!("{}/status", root)).send().await?).await?;
        tracing::debug!("Ledger service reachable at {}", root);

        Ok(Arc::new(HttpLedgerApi {
            client: self.client.clone(),
            root,
            signer: account.address.clone(),
        }))
    }
}

struct HttpLedgerApi {
    client: reqwest::Client,
    root: String,
    signer: Address,
}

impl HttpLedgerApi {
    async fn post_amount(&self, path: &str, to: Option<&Address>, amount: u128) -> Result<TxReceipt> {
        let body = AmountRequest {
            from: self.signer.as_str(),
            to: to.map(|a| a.as_str()),
            amount,
        };
        let response: ReceiptResponse = check(
            self.client
                .post(format!("{}/{}", self.root, path))
                .json(&body)
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        Ok(TxReceipt {
            transaction_reference: response.transaction_reference,
        })
    }
}

#[async_trait]
impl LedgerApi for HttpLedgerApi {
    async fn get_balance(&self, address: &Address) -> Result<RemoteBalance> {
        let url = format!("{}/balances/{}", self.root, address);
        let response: BalanceResponse = check(self.client.get(&url).send().await?).await?.json().await?;
        Ok(RemoteBalance {
            total: response.total,
            available: response.available,
        })
    }

    async fn deposit(&self, amount: u128) -> Result<TxReceipt> {
        self.post_amount("deposits", None, amount).await
    }

    async fn deposit_for(&self, address: &Address, amount: u128) -> Result<TxReceipt> {
        self.post_amount("deposits", Some(address), amount).await
    }

    async fn get_withdraw_delay(&self) -> Result<u64> {
        let url = format!("{}/withdrawals/delay", self.root);
        let response: DelayResponse = check(self.client.get(&url).send().await?).await?.json().await?;
        Ok(response.seconds)
    }

    async fn request_withdraw(&self, amount: u128) -> Result<TxReceipt> {
        self.post_amount("withdrawals/requests", None, amount).await
    }

    async fn get_withdraw_request(&self, address: &Address) -> Result<Option<RemoteWithdrawRequest>> {
        let url = format!("{}/withdrawals/requests/{}", self.root, address);
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: WithdrawRequestResponse = check(response).await?.json().await?;
        Ok(Some(RemoteWithdrawRequest {
            amount: body.amount,
            requested_at: body.requested_at,
        }))
    }

    async fn can_execute_withdraw(&self, address: &Address) -> Result<RemoteEligibility> {
        let url = format!("{}/withdrawals/eligibility/{}", self.root, address);
        let response: EligibilityResponse = check(self.client.get(&url).send().await?).await?.json().await?;
        Ok(RemoteEligibility {
            can_execute: response.can_execute,
            time_remaining_secs: response.time_remaining_secs,
        })
    }

    async fn withdraw(&self, amount: u128) -> Result<TxReceipt> {
        self.post_amount("withdrawals", None, amount).await
    }
}
