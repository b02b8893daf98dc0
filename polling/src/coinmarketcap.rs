//! <https://coinmarketcap.com/>, needs an api key.

use crate::{
    assets::{CRYPTO_ASSETS, PegAssets, PegItem},
    backoff::ExponentialBackoff,
    config::{PollingConfig, api_key},
    error::{PollingError, PollingResult},
    source::{PegPriceSource, fetch_body, http_client},
};
use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use prosper_core::{debug, log::Logger, warn};
use serde::Deserialize;
use std::collections::HashMap;

pub const COINMARKETCAP_API_URL: &str = "https://pro-api.coinmarketcap.com/v1/cryptocurrency/quotes/latest";

/// e.g. `2019-08-06T23:20:32.000Z`
pub const COINMARKETCAP_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// CoinMarketCap numeric id of every ticker we quote.
pub const COINMARKETCAP_IDS: &[(&str, u32)] = &[
    ("XBT", 1),
    ("ETH", 1027),
    ("LTC", 2),
    ("RVN", 2577),
    ("XBC", 1831),
    ("FCT", 1087),
    ("BNB", 1839),
    ("XLM", 512),
    ("ADA", 2010),
    ("XMR", 328),
    ("DASH", 131),
    ("ZEC", 1437),
    ("DCR", 1168),
];

#[derive(Debug, Deserialize)]
struct CoinMarketCapResponse {
    #[serde(default)]
    status: Option<CoinMarketCapStatus>,
    #[serde(default)]
    data: HashMap<String, CoinMarketCapCurrency>,
}

#[derive(Debug, Deserialize)]
struct CoinMarketCapStatus {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CoinMarketCapCurrency {
    quote: HashMap<String, CoinMarketCapQuote>,
}

#[derive(Debug, Deserialize)]
struct CoinMarketCapQuote {
    price: f64,
    last_updated: String,
}

fn currency_id(ticker: &str) -> Option<u32> {
    COINMARKETCAP_IDS.iter().find(|(symbol, _)| *symbol == ticker).map(|(_, id)| *id)
}

/// Extracts the supported pegs from a `quotes/latest` body. Quotes without a
/// USD price or with an unreadable timestamp are left out.
pub fn parse_prices(body: &[u8], supported: &[&str], logger: &Logger) -> PollingResult<PegAssets> {
    let response: CoinMarketCapResponse = serde_json::from_slice(body)?;
    if let Some(status) = response.status.filter(|status| status.error_code != 0) {
        return Err(PollingError::Parse(format!(
            "CoinMarketCap error {}: {}",
            status.error_code,
            status.error_message.unwrap_or_default()
        )));
    }

    let mut prices = PegAssets::new();
    for &asset in supported {
        let Some(id) = currency_id(asset) else { continue };
        let Some(quote) = response.data.get(&id.to_string()).and_then(|currency| currency.quote.get("USD")) else { continue };
        match NaiveDateTime::parse_from_str(&quote.last_updated, COINMARKETCAP_DATE_FORMAT) {
            Ok(when) => {
                prices.insert(asset.to_string(), PegItem::at(quote.price, Utc.from_utc_datetime(&when)));
            }
            Err(err) => warn!(logger, "Skipping {} quote dated {:?}: {}", asset, quote.last_updated, err),
        }
    }
    Ok(prices)
}

pub struct CoinMarketCapSource {
    api_key: String,
    client: reqwest::Client,
    backoff: ExponentialBackoff,
    logger: Logger,
}

impl CoinMarketCapSource {
    pub fn new(config: &PollingConfig, logger: Logger) -> PollingResult<Self> {
        let api_key =
            api_key(&config.coinmarketcap_key).ok_or_else(|| PollingError::Configuration("CoinMarketCap requires an api key".into()))?;
        Ok(Self { api_key, client: http_client(config)?, backoff: config.backoff.clone(), logger })
    }

    fn ids(&self) -> String {
        self.supported_pegs().into_iter().filter_map(currency_id).map(|id| id.to_string()).collect::<Vec<_>>().join(",")
    }
}

#[async_trait]
impl PegPriceSource for CoinMarketCapSource {
    fn name(&self) -> &'static str {
        "CoinMarketCap"
    }

    fn url(&self) -> &'static str {
        "https://coinmarketcap.com/"
    }

    fn supported_pegs(&self) -> Vec<&'static str> {
        CRYPTO_ASSETS.to_vec()
    }

    async fn fetch_peg_prices(&self) -> PollingResult<PegAssets> {
        let ids = self.ids();
        let supported = self.supported_pegs();
        let (this, ids, supported) = (self, ids.as_str(), supported.as_slice());
        let prices = self
            .backoff
            .retry(self.name(), &self.logger, move || async move {
                let request = this
                    .client
                    .get(COINMARKETCAP_API_URL)
                    .query(&[("id", ids), ("convert", "USD")])
                    .header("Accepts", "application/json")
                    .header("X-CMC_PRO_API_KEY", &this.api_key);
                let body = fetch_body(request).await?;
                parse_prices(&body, supported, &this.logger)
            })
            .await?;
        debug!(self.logger, "{} returned {} prices", self.name(), prices.len());
        Ok(prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prosper_core::log::Level;

    const BODY: &str = include_str!("../tests/fixtures/coinmarketcap.json");

    #[test]
    fn test_parse_prices() {
        let (logger, sink) = Logger::capture("cmc");
        let prices = parse_prices(BODY.as_bytes(), CRYPTO_ASSETS, &logger).unwrap();

        assert_eq!(prices.len(), 2);
        assert_eq!(prices["XBT"].value, 11843.82);
        assert_eq!(prices["XBT"].when_unix, 1565133632);
        assert_eq!(prices["FCT"].value, 3.12);
        // ETH has a malformed date, LTC has no USD quote
        assert!(!prices.contains_key("ETH") && !prices.contains_key("LTC"));
        assert!(sink.contains(Level::Warn, "ETH"));
    }

    #[test]
    fn test_parse_reports_api_errors() {
        let body = r#"{"status":{"error_code":1001,"error_message":"This API Key is invalid."}}"#;
        let err = parse_prices(body.as_bytes(), CRYPTO_ASSETS, &Logger::discard()).unwrap_err();
        assert!(err.to_string().contains("API Key is invalid"));
    }

    #[test]
    fn test_requires_api_key() {
        for key in [None, Some("  ".to_string())] {
            let config = PollingConfig { coinmarketcap_key: key, ..Default::default() };
            match CoinMarketCapSource::new(&config, Logger::discard()) {
                Err(PollingError::Configuration(message)) => assert!(message.contains("requires an api key")),
                _ => panic!("expected a configuration error"),
            }
        }
    }

    #[test]
    fn test_ids_follow_supported_pegs() {
        let config = PollingConfig { coinmarketcap_key: Some("key".into()), ..Default::default() };
        let source = CoinMarketCapSource::new(&config, Logger::discard()).unwrap();
        assert_eq!(source.ids(), "1,1027,2,2577,1831,1087,1839,512,2010,328,131,1437,1168");
    }
}
