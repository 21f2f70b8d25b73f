use anyhow::Result;
use std::sync::Arc;

use crate::models::AccountSelection;
use crate::storage::DbManager;

const SELECTION_KEY: &str = "account_selection";
const AUTO_REFRESH_KEY: &str = "auto_refresh";

/// User choices restored at start-up.
pub struct Preferences {
    db: Arc<DbManager>,
}

impl Preferences {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    pub fn selection(&self) -> Result<Option<AccountSelection>> {
        match self.db.get_setting(SELECTION_KEY)? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(selection) => Ok(Some(selection)),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable stored account selection: {}", e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn save_selection(&self, selection: &AccountSelection) -> Result<()> {
        let json = serde_json::to_string(selection)?;
        self.db.save_setting(SELECTION_KEY, &json)
    }

    pub fn auto_refresh(&self) -> Result<Option<bool>> {
        Ok(self
            .db
            .get_setting(AUTO_REFRESH_KEY)?
            .and_then(|v| v.parse::<bool>().ok()))
    }

    pub fn save_auto_refresh(&self, enabled: bool) -> Result<()> {
        self.db.save_setting(AUTO_REFRESH_KEY, &enabled.to_string())
    }
}
