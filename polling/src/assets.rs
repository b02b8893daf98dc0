use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub const CURRENCY_ASSETS: &[&str] = &["EUR", "JPY", "GBP", "CAD", "CHF", "SGD", "HKD", "MXN"];

pub const COMMODITY_ASSETS: &[&str] = &["XAU", "XAG"];

pub const V4_CURRENCY_ADDITIONS: &[&str] = &["AUD", "NZD", "SEK", "NOK", "RUB", "ZAR", "TRY"];

pub const CRYPTO_ASSETS: &[&str] = &["XBT", "ETH", "LTC", "RVN", "XBC", "FCT", "BNB", "XLM", "ADA", "XMR", "DASH", "ZEC", "DCR"];

pub const V4_CRYPTO_ADDITIONS: &[&str] = &["EOS", "LINK", "ATOM", "BAT", "XTZ"];

/// USD price of one peg asset.
#[derive(Debug, Clone, PartialEq)]
pub struct PegItem {
    pub value: f64,
    pub when_unix: i64,
    pub when: DateTime<Utc>,
}

impl PegItem {
    /// `None` if `when_unix` is out of range.
    pub fn new(value: f64, when_unix: i64) -> Option<Self> {
        Some(Self { value, when_unix, when: DateTime::from_timestamp(when_unix, 0)? })
    }

    pub fn at(value: f64, when: DateTime<Utc>) -> Self {
        Self { value, when_unix: when.timestamp(), when }
    }
}

/// Prices keyed by ticker, e.g. `XBT`.
pub type PegAssets = HashMap<String, PegItem>;

/// Concatenates `lists`, keeping the first occurrence of each ticker.
pub fn merge_lists(lists: &[&[&'static str]]) -> Vec<&'static str> {
    let mut merged: Vec<&'static str> = Vec::new();
    for asset in lists.iter().flat_map(|list| list.iter()) {
        if !merged.contains(asset) {
            merged.push(asset);
        }
    }
    merged
}
