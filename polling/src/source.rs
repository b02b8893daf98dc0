use crate::{
    assets::{PegAssets, PegItem},
    config::PollingConfig,
    error::{PollingError, PollingResult},
};
use async_trait::async_trait;

/// A feed of USD prices for peg assets.
#[async_trait]
pub trait PegPriceSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Human facing home page of the source.
    fn url(&self) -> &'static str;

    fn supported_pegs(&self) -> Vec<&'static str>;

    async fn fetch_peg_prices(&self) -> PollingResult<PegAssets>;

    async fn fetch_peg_price(&self, peg: &str) -> PollingResult<PegItem> {
        let mut prices = self.fetch_peg_prices().await?;
        prices.remove(peg).ok_or_else(|| PollingError::PegNotFound(peg.to_string()))
    }
}

pub(crate) fn http_client(config: &PollingConfig) -> PollingResult<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(config.request_timeout()).build()?)
}

/// Sends `request` and returns the body of a successful response.
pub(crate) async fn fetch_body(request: reqwest::RequestBuilder) -> PollingResult<Vec<u8>> {
    let response = request.send().await?.error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}
