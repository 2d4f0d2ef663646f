pub mod config;

pub use config::{ChainConfig, DEVNET_CONFIG};
