use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::CoreError;
use crate::models::price::{PricePoint, PriceSeries};
use crate::storage::traits::PriceHistoryStore;

/// Immutable view of the price series one computation reads from.
pub type PriceSnapshot = HashMap<String, Arc<PriceSeries>>;

/// Read-through caches in front of the price store: full daily series,
/// latest non-zero close, and all-time high, each keyed by instrument id.
///
/// Lifetime: one per process run (or per `PortfolioTracker`). Entries are only
/// added, never updated; `reset()` drops everything at once after a bulk price
/// refresh. Store I/O happens outside the locks, and when two callers miss on
/// the same key the first insert wins, so a cached entry is never a merge of
/// two fetches.
///
/// Computations call `snapshot()` / `latest()` first (populate phase) and then
/// read only the returned values, so writes never interleave with a read phase.
pub struct MarketDataCache {
    store: Arc<dyn PriceHistoryStore>,
    series: RwLock<HashMap<String, Arc<PriceSeries>>>,
    latest: RwLock<HashMap<String, Option<PricePoint>>>,
    all_time_high: RwLock<HashMap<String, Option<f64>>>,
}

impl MarketDataCache {
    pub fn new(store: Arc<dyn PriceHistoryStore>) -> Self {
        Self {
            store,
            series: RwLock::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
            all_time_high: RwLock::new(HashMap::new()),
        }
    }

    /// Full daily series. Empty (not an error) when the store has no rows.
    pub async fn series(&self, instrument_id: &str) -> Result<Arc<PriceSeries>, CoreError> {
        let cached = read(&self.series)?.get(instrument_id).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        tracing::debug!(instrument = instrument_id, "Price series cache miss");
        let rows = self.store.get_series(instrument_id).await?;
        let fetched = Arc::new(PriceSeries::new(instrument_id, rows));

        let mut map = write(&self.series)?;
        let entry = map
            .entry(instrument_id.to_string())
            .or_insert(fetched);
        Ok(Arc::clone(entry))
    }

    /// Latest non-zero close, `None` when the instrument has never traded.
    pub async fn latest(&self, instrument_id: &str) -> Result<Option<PricePoint>, CoreError> {
        let cached = read(&self.latest)?.get(instrument_id).copied();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        tracing::debug!(instrument = instrument_id, "Latest price cache miss");
        // Guard against stores that hand back a zero row as "latest"
        let fetched = self
            .store
            .get_latest(instrument_id)
            .await?
            .filter(PricePoint::is_traded);

        let mut map = write(&self.latest)?;
        Ok(*map.entry(instrument_id.to_string()).or_insert(fetched))
    }

    /// Highest close ever recorded, `None` when there are no rows.
    pub async fn all_time_high(&self, instrument_id: &str) -> Result<Option<f64>, CoreError> {
        let cached = read(&self.all_time_high)?.get(instrument_id).copied();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        tracing::debug!(instrument = instrument_id, "All-time-high cache miss");
        let fetched = self
            .store
            .get_all_time_high(instrument_id)
            .await?
            .filter(|c| *c > 0.0);

        let mut map = write(&self.all_time_high)?;
        Ok(*map.entry(instrument_id.to_string()).or_insert(fetched))
    }

    /// Populate every requested series and return them as one immutable map.
    pub async fn snapshot<I, S>(&self, instrument_ids: I) -> Result<PriceSnapshot, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut snapshot = PriceSnapshot::new();
        for id in instrument_ids {
            let id = id.as_ref();
            if !snapshot.contains_key(id) {
                let series = self.series(id).await?;
                snapshot.insert(id.to_string(), series);
            }
        }
        Ok(snapshot)
    }

    /// Latest closes for many instruments. Instruments that never traded are absent.
    pub async fn latest_many<I, S>(&self, instrument_ids: I) -> Result<HashMap<String, PricePoint>, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut prices = HashMap::new();
        for id in instrument_ids {
            let id = id.as_ref();
            if let Some(point) = self.latest(id).await? {
                prices.insert(id.to_string(), point);
            }
        }
        Ok(prices)
    }

    /// Drop every cached entry. Called after new price data has been loaded.
    pub fn reset(&self) {
        let cleared = [
            self.series.write().map(|mut m| m.clear()).is_ok(),
            self.latest.write().map(|mut m| m.clear()).is_ok(),
            self.all_time_high.write().map(|mut m| m.clear()).is_ok(),
        ];
        if cleared.contains(&false) {
            tracing::warn!("Market data cache lock poisoned during reset");
        }
        tracing::info!("Market data cache reset");
    }

    /// Number of instruments with a cached series.
    pub fn cached_series_count(&self) -> usize {
        self.series.read().map(|m| m.len()).unwrap_or(0)
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<std::sync::RwLockReadGuard<'_, T>, CoreError> {
    lock.read()
        .map_err(|_| CoreError::Storage("market data cache lock poisoned".into()))
}

fn write<T>(lock: &RwLock<T>) -> Result<std::sync::RwLockWriteGuard<'_, T>, CoreError> {
    lock.write()
        .map_err(|_| CoreError::Storage("market data cache lock poisoned".into()))
}
