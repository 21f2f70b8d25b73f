pub mod amount;
pub mod inputs;
pub mod ledger;

pub use amount::{parse_units, TokenAmount};
pub use inputs::{Drafts, InputField};
pub use ledger::*;
