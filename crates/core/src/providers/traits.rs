use async_trait::async_trait;
use chrono::NaiveDate;

use crate::errors::CoreError;

/// Source of raw daily price history files.
///
/// Each market-data provider implements this trait. The refresh pipeline only
/// sees CSV text, so swapping a provider touches nothing downstream.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Human-readable name of this feed (for logs/errors).
    fn name(&self) -> &str;

    /// Download daily history for `instrument_id` between `from` and `to`
    /// (inclusive) as CSV text with at least `Date` and `Close` columns.
    async fn download_history(
        &self,
        instrument_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<String, CoreError>;
}
