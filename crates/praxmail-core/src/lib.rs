pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod types;

pub use config::Config;
pub use constants::*;
pub use error::MailError;
pub use types::*;
