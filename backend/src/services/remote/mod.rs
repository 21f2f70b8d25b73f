//! HTTP adapters for the remote ledger and account-derivation services.

pub mod derivation_client;
pub mod ledger_client;

pub use derivation_client::HttpAccountDeriver;
pub use ledger_client::HttpLedgerConnector;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::time::Duration;

/// Integer amounts travel as decimal strings so no side loses precision.
pub(crate) mod u128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub(crate) fn http_client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

/// Turns a non-2xx response into an error carrying the service's message.
pub(crate) async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    Err(anyhow!("{} ({})", message.trim(), status))
}
