//! <https://coincap.io/>, no credential needed.

use crate::{
    assets::{CRYPTO_ASSETS, PegAssets, PegItem, V4_CRYPTO_ADDITIONS, merge_lists},
    backoff::ExponentialBackoff,
    config::PollingConfig,
    error::{PollingError, PollingResult},
    source::{PegPriceSource, fetch_body, http_client},
};
use async_trait::async_trait;
use prosper_core::{debug, log::Logger};
use serde::Deserialize;

pub const COINCAP_API_URL: &str = "http://api.coincap.io/v2/assets";

/// CoinCap asset id of every ticker we quote.
pub const COINCAP_ASSET_IDS: &[(&str, &str)] = &[
    ("XBT", "bitcoin"),
    ("ETH", "ethereum"),
    ("LTC", "litecoin"),
    ("RVN", "ravencoin"),
    ("XBC", "bitcoin-cash"),
    ("FCT", "factom"),
    ("BNB", "binance-coin"),
    ("XLM", "stellar"),
    ("ADA", "cardano"),
    ("XMR", "monero"),
    ("DASH", "dash"),
    ("ZEC", "zcash"),
    ("DCR", "decred"),
    ("EOS", "eos"),
    ("LINK", "chainlink"),
    ("ATOM", "cosmos"),
    ("BAT", "basic-attention-token"),
    ("XTZ", "tezos"),
];

#[derive(Debug, Deserialize)]
struct CoinCapResponse {
    data: Vec<CoinCapRecord>,
    /// Milliseconds since the epoch.
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoinCapRecord {
    id: String,
    symbol: String,
    price_usd: String,
}

fn asset_id(ticker: &str) -> Option<&'static str> {
    COINCAP_ASSET_IDS.iter().find(|(symbol, _)| *symbol == ticker).map(|(_, id)| *id)
}

fn ticker(symbol: &str) -> &str {
    match symbol {
        "BTC" | "XBT" => "XBT",
        "BCH" | "XBC" => "XBC",
        "ZCASH" | "ZEC" => "ZEC",
        other => other,
    }
}

/// Extracts the supported pegs from a CoinCap `/v2/assets` body.
pub fn parse_prices(body: &[u8], supported: &[&str]) -> PollingResult<PegAssets> {
    let response: CoinCapResponse = serde_json::from_slice(body)?;
    let when_unix = response.timestamp / 1000;

    let mut prices = PegAssets::new();
    for record in response.data {
        // a known symbol under another id is a duplicate ticker
        if asset_id(&record.symbol).is_some_and(|id| id != record.id) {
            continue;
        }
        let ticker = ticker(&record.symbol);
        if !supported.contains(&ticker) {
            continue;
        }
        let value = record
            .price_usd
            .parse::<f64>()
            .map_err(|err| PollingError::Parse(format!("price of {} is {:?}: {}", ticker, record.price_usd, err)))?;
        let item = PegItem::new(value, when_unix)
            .ok_or_else(|| PollingError::Parse(format!("timestamp {} out of range", response.timestamp)))?;
        prices.insert(ticker.to_string(), item);
    }
    Ok(prices)
}

pub struct CoinCapSource {
    client: reqwest::Client,
    backoff: ExponentialBackoff,
    logger: Logger,
}

impl CoinCapSource {
    pub fn new(config: &PollingConfig, logger: Logger) -> PollingResult<Self> {
        Ok(Self { client: http_client(config)?, backoff: config.backoff.clone(), logger })
    }

    fn request_url(&self) -> String {
        let ids = self.supported_pegs().into_iter().filter_map(asset_id).collect::<Vec<_>>();
        format!("{}?ids={}", COINCAP_API_URL, ids.join(","))
    }
}

#[async_trait]
impl PegPriceSource for CoinCapSource {
    fn name(&self) -> &'static str {
        "CoinCap"
    }

    fn url(&self) -> &'static str {
        "https://coincap.io/"
    }

    fn supported_pegs(&self) -> Vec<&'static str> {
        merge_lists(&[CRYPTO_ASSETS, V4_CRYPTO_ADDITIONS])
    }

    async fn fetch_peg_prices(&self) -> PollingResult<PegAssets> {
        let url = self.request_url();
        let supported = self.supported_pegs();
        let (client, url, supported) = (&self.client, url.as_str(), supported.as_slice());
        let prices = self
            .backoff
            .retry(self.name(), &self.logger, move || async move {
                let body = fetch_body(client.get(url)).await?;
                parse_prices(&body, supported)
            })
            .await?;
        debug!(self.logger, "{} returned {} prices", self.name(), prices.len());
        Ok(prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = include_str!("../tests/fixtures/coincap.json");

    #[test]
    fn test_parse_prices() {
        let supported = merge_lists(&[CRYPTO_ASSETS, V4_CRYPTO_ADDITIONS]);
        let prices = parse_prices(BODY.as_bytes(), &supported).unwrap();

        assert_eq!(prices.len(), 4);
        assert_eq!(prices["XBT"].value, 11843.8217);
        assert_eq!(prices["XBC"].value, 323.5);
        assert_eq!(prices["FCT"].value, 3.1);
        assert_eq!(prices["ZEC"].value, 60.25);
        assert_eq!(prices["XBT"].when_unix, 1565133632);
        // the bogus "FCT" listed under another id was skipped
        assert!(prices.values().all(|item| item.value != 99.0));
        assert!(!prices.contains_key("DOGE"));
    }

    #[test]
    fn test_parse_rejects_bad_price() {
        let body = r#"{"data":[{"id":"bitcoin","symbol":"BTC","priceUsd":"lots"}],"timestamp":0}"#;
        assert!(matches!(parse_prices(body.as_bytes(), CRYPTO_ASSETS), Err(PollingError::Parse(_))));
        assert!(matches!(parse_prices(b"<html>", CRYPTO_ASSETS), Err(PollingError::Parse(_))));
    }

    #[test]
    fn test_request_url_lists_every_id() {
        let source = CoinCapSource::new(&PollingConfig::default(), Logger::discard()).unwrap();
        let url = source.request_url();
        assert!(url.starts_with("http://api.coincap.io/v2/assets?ids=bitcoin,ethereum,"));
        assert!(url.ends_with(",tezos"));
    }
}
