use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::errors::CoreError;
use crate::models::holding::RawHoldings;
use crate::models::model_portfolio::ModelTarget;
use crate::models::price::{PricePoint, PriceSeries};

use super::traits::{HoldingsStore, ModelPortfolioStore, PriceHistoryStore};

/// Process-local implementation of every store trait.
///
/// Useful for embedding the engine without a database and as the backing
/// store in tests. Users exist once they have holdings or a model portfolio.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    prices: RwLock<HashMap<String, Vec<PricePoint>>>,
    holdings: RwLock<HashMap<String, RawHoldings>>,
    targets: RwLock<HashMap<String, (Vec<ModelTarget>, f64)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: seed the price history of one instrument.
    pub fn with_prices(self, instrument_id: &str, points: Vec<PricePoint>) -> Self {
        self.write_prices(instrument_id, &points);
        self
    }

    /// Builder: seed a user's holdings.
    pub fn with_holdings(self, user_id: &str, holdings: RawHoldings) -> Self {
        if let Ok(mut map) = self.holdings.write() {
            map.insert(user_id.to_string(), holdings);
        }
        self
    }

    /// Builder: seed a user's model portfolio.
    pub fn with_model_portfolio(self, user_id: &str, targets: Vec<ModelTarget>, amount: f64) -> Self {
        if let Ok(mut map) = self.targets.write() {
            map.insert(user_id.to_string(), (targets, amount));
        }
        self
    }

    /// Number of stored price rows for an instrument.
    pub fn price_count(&self, instrument_id: &str) -> usize {
        self.prices
            .read()
            .map(|m| m.get(instrument_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn write_prices(&self, instrument_id: &str, points: &[PricePoint]) -> usize {
        let Ok(mut map) = self.prices.write() else {
            return 0;
        };
        let rows = map.entry(instrument_id.to_string()).or_default();
        for point in points {
            match rows.binary_search_by_key(&point.date, |p| p.date) {
                Ok(idx) => rows[idx] = *point,
                Err(idx) => rows.insert(idx, *point),
            }
        }
        points.len()
    }

    fn poisoned() -> CoreError {
        CoreError::Storage("in-memory store lock poisoned".into())
    }
}

#[async_trait]
impl PriceHistoryStore for InMemoryStore {
    async fn get_series(&self, instrument_id: &str) -> Result<Vec<PricePoint>, CoreError> {
        let map = self.prices.read().map_err(|_| Self::poisoned())?;
        Ok(map.get(instrument_id).cloned().unwrap_or_default())
    }

    async fn get_latest(&self, instrument_id: &str) -> Result<Option<PricePoint>, CoreError> {
        let map = self.prices.read().map_err(|_| Self::poisoned())?;
        Ok(map
            .get(instrument_id)
            .and_then(|rows| rows.iter().rev().find(|p| p.is_traded()).copied()))
    }

    async fn get_all_time_high(&self, instrument_id: &str) -> Result<Option<f64>, CoreError> {
        let map = self.prices.read().map_err(|_| Self::poisoned())?;
        Ok(map
            .get(instrument_id)
            .and_then(|rows| PriceSeries::new(instrument_id, rows.clone()).all_time_high()))
    }

    async fn upsert_prices(
        &self,
        instrument_id: &str,
        points: &[PricePoint],
    ) -> Result<usize, CoreError> {
        if self.prices.is_poisoned() {
            return Err(Self::poisoned());
        }
        Ok(self.write_prices(instrument_id, points))
    }
}

#[async_trait]
impl HoldingsStore for InMemoryStore {
    async fn get_holdings(&self, user_id: &str) -> Result<RawHoldings, CoreError> {
        let map = self.holdings.read().map_err(|_| Self::poisoned())?;
        map.get(user_id)
            .cloned()
            .ok_or_else(|| CoreError::UserNotFound(user_id.to_string()))
    }

    async fn save_holdings(&self, user_id: &str, holdings: &RawHoldings) -> Result<(), CoreError> {
        let mut map = self.holdings.write().map_err(|_| Self::poisoned())?;
        let entry = map.entry(user_id.to_string()).or_default();
        entry.holdings.extend(holdings.holdings.iter().cloned());
        entry.non_tracked.extend(holdings.non_tracked.iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl ModelPortfolioStore for InMemoryStore {
    async fn get_targets(&self, user_id: &str) -> Result<Vec<ModelTarget>, CoreError> {
        let map = self.targets.read().map_err(|_| Self::poisoned())?;
        map.get(user_id)
            .map(|(targets, _)| targets.clone())
            .ok_or_else(|| CoreError::UserNotFound(user_id.to_string()))
    }

    async fn get_target_amount(&self, user_id: &str) -> Result<f64, CoreError> {
        let map = self.targets.read().map_err(|_| Self::poisoned())?;
        map.get(user_id)
            .map(|(_, amount)| *amount)
            .ok_or_else(|| CoreError::UserNotFound(user_id.to_string()))
    }

    async fn save_targets(
        &self,
        user_id: &str,
        targets: &[ModelTarget],
        target_amount: f64,
    ) -> Result<(), CoreError> {
        let mut map = self.targets.write().map_err(|_| Self::poisoned())?;
        map.insert(user_id.to_string(), (targets.to_vec(), target_amount));
        Ok(())
    }
}
