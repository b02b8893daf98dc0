//! Peg asset prices from public market data APIs.

pub mod assets;
pub mod backoff;
pub mod coincap;
pub mod coinmarketcap;
pub mod config;
pub mod error;
pub mod oneforge;
pub mod source;

pub use assets::{PegAssets, PegItem};
pub use config::PollingConfig;
pub use error::{PollingError, PollingResult};
pub use source::PegPriceSource;

use coincap::CoinCapSource;
use coinmarketcap::CoinMarketCapSource;
use oneforge::OneForgeSource;
use prosper_core::log::Logger;

/// Identifiers accepted by [`new_data_source`].
pub const DATA_SOURCES: &[&str] = &["coincap", "coinmarketcap", "1forge"];

/// Builds the source named `identifier`, ignoring case.
pub fn new_data_source(identifier: &str, config: &PollingConfig, logger: Logger) -> PollingResult<Box<dyn PegPriceSource>> {
    let source: Box<dyn PegPriceSource> = match identifier.to_ascii_lowercase().as_str() {
        "coincap" => Box::new(CoinCapSource::new(config, logger)?),
        "coinmarketcap" => Box::new(CoinMarketCapSource::new(config, logger)?),
        "1forge" => Box::new(OneForgeSource::new(config, logger)?),
        _ => return Err(PollingError::UnknownSource(identifier.to_string())),
    };
    Ok(source)
}
