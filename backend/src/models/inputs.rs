use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Form fields whose drafts the controller holds for the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputField {
    DepositSelfAmount,
    DepositForAmount,
    DepositForAddress,
    WithdrawAmount,
}

impl InputField {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "deposit_self_amount" => Some(InputField::DepositSelfAmount),
            "deposit_for_amount" => Some(InputField::DepositForAmount),
            "deposit_for_address" => Some(InputField::DepositForAddress),
            "withdraw_amount" => Some(InputField::WithdrawAmount),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Drafts {
    values: Arc<Mutex<BTreeMap<InputField, String>>>,
}

impl Drafts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: InputField) -> String {
        self.values.lock().get(&field).cloned().unwrap_or_default()
    }

    pub fn set(&self, field: InputField, value: impl Into<String>) {
        self.values.lock().insert(field, value.into());
    }

    /// Clears the field only if nobody edited it since `drawn` was read.
    pub fn clear_if_unchanged(&self, field: InputField, drawn: &str) -> bool {
        let mut values = self.values.lock();
        match values.get(&field) {
            Some(current) if current == drawn => {
                values.remove(&field);
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<InputField, String> {
        self.values.lock().clone()
    }
}
