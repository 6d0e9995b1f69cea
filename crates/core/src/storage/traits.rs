use async_trait::async_trait;

use crate::errors::CoreError;
use crate::models::holding::RawHoldings;
use crate::models::model_portfolio::ModelTarget;
use crate::models::price::PricePoint;

/// Persistent daily price history. The store is authoritative; caches in
/// front of it are only a read optimization.
///
/// An instrument with no rows is not an error: `get_series` returns an empty
/// vec and `get_latest` / `get_all_time_high` return `None`.
#[async_trait]
pub trait PriceHistoryStore: Send + Sync {
    /// All rows for an instrument, ordered by date.
    async fn get_series(&self, instrument_id: &str) -> Result<Vec<PricePoint>, CoreError>;

    /// Most recent row with a non-zero close.
    async fn get_latest(&self, instrument_id: &str) -> Result<Option<PricePoint>, CoreError>;

    /// Maximum close ever recorded.
    async fn get_all_time_high(&self, instrument_id: &str) -> Result<Option<f64>, CoreError>;

    /// Insert or replace rows by date. Returns the number of rows written.
    async fn upsert_prices(
        &self,
        instrument_id: &str,
        points: &[PricePoint],
    ) -> Result<usize, CoreError>;
}

/// Per-user holdings, stored with string-typed fields.
#[async_trait]
pub trait HoldingsStore: Send + Sync {
    /// Fails with `UserNotFound` for unknown users.
    async fn get_holdings(&self, user_id: &str) -> Result<RawHoldings, CoreError>;

    /// Append records to the user's holdings.
    async fn save_holdings(&self, user_id: &str, holdings: &RawHoldings) -> Result<(), CoreError>;
}

/// Per-user model portfolio and target amount.
#[async_trait]
pub trait ModelPortfolioStore: Send + Sync {
    async fn get_targets(&self, user_id: &str) -> Result<Vec<ModelTarget>, CoreError>;

    async fn get_target_amount(&self, user_id: &str) -> Result<f64, CoreError>;

    /// Replace the user's targets and target amount.
    async fn save_targets(
        &self,
        user_id: &str,
        targets: &[ModelTarget],
        target_amount: f64,
    ) -> Result<(), CoreError>;
}
