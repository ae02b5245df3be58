pub mod config;
pub mod error;
pub mod tier;
pub mod types;

pub use config::Config;
pub use error::{ConfigError, StoreError};
pub use tier::{Tier, TierSchedule};
pub use types::*;
