use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{check, http_client};
use crate::models::Address;
use crate::services::account_binder::AccountDeriver;

#[derive(Debug, Serialize)]
struct DeriveRequest<'a> {
    public_key_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct DeriveResponse {
    address: String,
}

/// Resolves delegated account addresses through the derivation service.
pub struct HttpAccountDeriver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccountDeriver {
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AccountDeriver for HttpAccountDeriver {
    async fn derive(&self, public_key_id: &str, network: &str) -> Result<Address> {
        let url = format!("{}/v1/{}/accounts/derive", self.base_url, network);
        let response: DeriveResponse = check(
            self.client
                .post(&url)
                .json(&DeriveRequest { public_key_id })
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        Address::parse(&response.address).context("derivation service returned a malformed address")
    }
}
