pub mod db_manager;
pub mod preferences;

pub use db_manager::DbManager;
pub use preferences::Preferences;
