pub mod db;
pub mod drafts;
pub mod emails;
pub mod events;
pub mod settings;

pub use db::{storage, Store};
pub use settings::SettingsRegistry;
