use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::ControllerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{Account, AccountSelection, AccountSourceKind, Address, AuthState};
use crate::services::lifecycle::{Generation, GenerationCounter};

/// Derives a delegated account address from the auth layer's key.
#[async_trait]
pub trait AccountDeriver: Send + Sync {
    async fn derive(&self, public_key_id: &str, network: &str) -> anyhow::Result<Address>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Bound { account: Account, generation: Generation },
    /// a later selection replaced this one while it was resolving
    Superseded,
}

pub struct AccountBinder {
    deriver: Option<Arc<dyn AccountDeriver>>,
    network: String,
    allow_delegated: bool,
    allow_self_custodied: bool,
    generations: GenerationCounter,
    selection: RwLock<Option<AccountSelection>>,
    active: RwLock<Option<Account>>,
    resolving: RwLock<bool>,
}

impl AccountBinder {
    pub fn new(deriver: Option<Arc<dyn AccountDeriver>>, config: &ControllerConfig) -> Self {
        Self {
            deriver,
            network: config.network.clone(),
            allow_delegated: config.allow_delegated,
            allow_self_custodied: config.allow_self_custodied,
            generations: GenerationCounter::new(),
            selection: RwLock::new(None),
            active: RwLock::new(None),
            resolving: RwLock::new(false),
        }
    }

    pub fn ensure_allowed(&self, kind: AccountSourceKind) -> LedgerResult<()> {
        let allowed = match kind {
            AccountSourceKind::Delegated => self.allow_delegated,
            AccountSourceKind::SelfCustodied => self.allow_self_custodied,
        };
        if allowed {
            Ok(())
        } else {
            Err(LedgerError::configuration(format!(
                "{} accounts are disabled",
                kind.as_str().replace('_', "-")
            )))
        }
    }

    pub fn active(&self) -> Option<Account> {
        self.active.read().clone()
    }

    pub fn selection(&self) -> Option<AccountSelection> {
        self.selection.read().clone()
    }

    pub fn is_resolving(&self) -> bool {
        *self.resolving.read()
    }

    #[cfg(test)]
    pub fn generation(&self) -> Generation {
        self.generations.current()
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.generations.is_current(generation)
    }

    /// Binds the selection, superseding any derivation still in progress.
    /// Disallowed sources are rejected before anything changes.
    pub async fn bind(&self, selection: AccountSelection, auth: &AuthState) -> LedgerResult<BindOutcome> {
        self.ensure_allowed(selection.kind())?;

        let generation = self.generations.advance();
        *self.active.write() = None;
        *self.selection.write() = Some(selection.clone());
        *self.resolving.write() = selection.kind() == AccountSourceKind::Delegated;

        let result = match &selection {
            AccountSelection::SelfCustodied { address } => Ok(Account {
                address: address.clone(),
                source: AccountSourceKind::SelfCustodied,
            }),
            AccountSelection::Delegated => {
                let derived = self.derive(auth).await;
                if !self.is_current(generation) {
                    tracing::debug!("Discarding delegated derivation for superseded generation {}", generation.value());
                    return Ok(BindOutcome::Superseded);
                }
                *self.resolving.write() = false;
                derived.map(|address| Account {
                    address,
                    source: AccountSourceKind::Delegated,
                })
            }
        };

        match result {
            Ok(account) => {
                tracing::info!("Bound {} account {}", account.source.as_str(), account.address);
                *self.active.write() = Some(account.clone());
                Ok(BindOutcome::Bound { account, generation })
            }
            Err(e) => {
                tracing::warn!("Account binding failed: {}", e);
                *self.active.write() = None;
                Err(e)
            }
        }
    }

    async fn derive(&self, auth: &AuthState) -> LedgerResult<Address> {
        if !auth.has_credential {
            return Err(LedgerError::derivation("auth context is missing"));
        }
        let public_key_id = auth
            .public_key_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| LedgerError::derivation("public key identifier is missing"))?;
        let deriver = self
            .deriver
            .as_ref()
            .ok_or_else(|| LedgerError::derivation("no account deriver configured"))?;
        deriver
            .derive(public_key_id, &self.network)
            .await
            .map_err(|e| LedgerError::derivation(format!("{:#}", e)))
    }

    /// Drops the active account, e.g. when the auth layer loses its credential.
    pub fn invalidate(&self) -> Generation {
        let generation = self.generations.advance();
        *self.active.write() = None;
        *self.resolving.write() = false;
        generation
    }
}
