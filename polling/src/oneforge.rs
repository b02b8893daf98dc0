//! <https://1forge.com>, needs an api key. Quotes currencies and metals.

use crate::{
    assets::{COMMODITY_ASSETS, CURRENCY_ASSETS, PegAssets, PegItem, V4_CURRENCY_ADDITIONS, merge_lists},
    backoff::ExponentialBackoff,
    config::{PollingConfig, api_key},
    error::{PollingError, PollingResult},
    source::{PegPriceSource, fetch_body, http_client},
};
use async_trait::async_trait;
use prosper_core::{debug, log::Logger};
use serde::Deserialize;
use std::collections::HashMap;

pub const ONEFORGE_API_URL: &str = "https://api.1forge.com/quotes";

#[derive(Debug, Deserialize)]
struct OneForgeRate {
    symbol: String,
    price: f64,
    timestamp: i64,
}

/// 1Forge spells a few tickers differently.
fn forge_symbol(asset: &str) -> &str {
    match asset {
        "XBT" => "BTC",
        "XBC" => "BCH",
        "DASH" => "DSH",
        other => other,
    }
}

fn pair(asset: &str) -> String {
    format!("{}USD", forge_symbol(asset))
}

/// Extracts the supported pegs from a `/quotes` body.
pub fn parse_prices(body: &[u8], supported: &[&str]) -> PollingResult<PegAssets> {
    let rates: Vec<OneForgeRate> = serde_json::from_slice(body)?;
    let rates = rates.into_iter().map(|rate| (rate.symbol.clone(), rate)).collect::<HashMap<_, _>>();

    let mut prices = PegAssets::new();
    for &asset in supported {
        let Some(rate) = rates.get(&pair(asset)) else { continue };
        let item = PegItem::new(rate.price, rate.timestamp)
            .ok_or_else(|| PollingError::Parse(format!("timestamp {} of {} out of range", rate.timestamp, rate.symbol)))?;
        prices.insert(asset.to_string(), item);
    }
    Ok(prices)
}

pub struct OneForgeSource {
    api_key: String,
    client: reqwest::Client,
    backoff: ExponentialBackoff,
    logger: Logger,
}

impl OneForgeSource {
    pub fn new(config: &PollingConfig, logger: Logger) -> PollingResult<Self> {
        let api_key = api_key(&config.oneforge_key).ok_or_else(|| PollingError::Configuration("1Forge requires an api key".into()))?;
        Ok(Self { api_key, client: http_client(config)?, backoff: config.backoff.clone(), logger })
    }

    fn pairs(&self) -> String {
        self.supported_pegs().into_iter().map(pair).collect::<Vec<_>>().join(",")
    }
}

#[async_trait]
impl PegPriceSource for OneForgeSource {
    fn name(&self) -> &'static str {
        "1Forge"
    }

    fn url(&self) -> &'static str {
        "https://1forge.com"
    }

    fn supported_pegs(&self) -> Vec<&'static str> {
        merge_lists(&[CURRENCY_ASSETS, COMMODITY_ASSETS, V4_CURRENCY_ADDITIONS])
    }

    async fn fetch_peg_prices(&self) -> PollingResult<PegAssets> {
        let pairs = self.pairs();
        let supported = self.supported_pegs();
        let (this, pairs, supported) = (self, pairs.as_str(), supported.as_slice());
        let prices = self
            .backoff
            .retry(self.name(), &self.logger, move || async move {
                let request = this.client.get(ONEFORGE_API_URL).query(&[("pairs", pairs), ("api_key", this.api_key.as_str())]);
                let body = fetch_body(request).await?;
                parse_prices(&body, supported)
            })
            .await?;
        debug!(self.logger, "{} returned {} prices", self.name(), prices.len());
        Ok(prices)
    }
}
