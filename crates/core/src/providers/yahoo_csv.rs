use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use reqwest::Client;
use std::time::Duration;

use crate::errors::CoreError;
use super::traits::PriceFeed;

const BASE_URL: &str = "https://query1.finance.yahoo.com/v7/finance/download/";

/// Exchange suffix appended to bare NSE tickers.
const NSE_SUFFIX: &str = ".NS";

/// Yahoo Finance CSV download feed.
///
/// - **Requires**: no API key.
/// - **Rate limit**: blocks bursts of more than ~5 requests/second, so the
///   refresh pipeline downloads sequentially with a fixed delay.
/// - **Symbols**: bare ids (`INFY`) get the NSE suffix; ids that already carry
///   an exchange suffix (`0P0000XVKP.BO`) or are indices (`^BSESN`) pass through.
pub struct YahooCsvFeed {
    client: Client,
    base_url: String,
}

impl YahooCsvFeed {
    pub fn new() -> Result<Self, CoreError> {
        Self::with_base_url(BASE_URL)
    }

    /// Point the feed at a different host (mirrors, test servers).
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, CoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Map an instrument id to the provider's ticker.
    pub fn ticker_for(instrument_id: &str) -> String {
        let id = instrument_id.trim().to_uppercase();
        if id.starts_with('^') || id.contains('.') {
            id
        } else {
            format!("{id}{NSE_SUFFIX}")
        }
    }

    fn epoch_seconds(date: NaiveDate) -> i64 {
        date.and_time(NaiveTime::MIN).and_utc().timestamp()
    }
}

#[async_trait]
impl PriceFeed for YahooCsvFeed {
    fn name(&self) -> &str {
        "Yahoo Finance"
    }

    async fn download_history(
        &self,
        instrument_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<String, CoreError> {
        if from > to {
            return Err(CoreError::ValidationError(format!(
                "'from' date ({from}) must not be after 'to' date ({to})"
            )));
        }

        let url = format!("{}{}", self.base_url, Self::ticker_for(instrument_id));
        // period2 is exclusive on the provider side
        let period2 = to.succ_opt().unwrap_or(to);
        let period1 = Self::epoch_seconds(from).to_string();
        let period2 = Self::epoch_seconds(period2).to_string();

        tracing::debug!(instrument = instrument_id, %from, %to, "Downloading price history");

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("period1", period1.as_str()),
                ("period2", period2.as_str()),
                ("interval", "1d"),
                ("events", "history"),
                ("includeAdjustedClose", "true"),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::Api {
                provider: self.name().to_string(),
                message: format!("Bad status {status} for {instrument_id}"),
            });
        }

        resp.text().await.map_err(|e| CoreError::Api {
            provider: self.name().to_string(),
            message: format!("Failed to read history for {instrument_id}: {e}"),
        })
    }
}
