use chrono::NaiveDate;
use std::sync::Arc;

use crate::errors::CoreError;
use crate::models::holding::{Holding, Holdings, NonTrackedAsset};
use crate::models::price::PriceSeries;
use crate::models::series::NetWorthSeries;
use crate::services::market_cache::{MarketDataCache, PriceSnapshot};
use crate::utils::{days_inclusive, round2};

/// Rebuilds what a portfolio was worth on every calendar day since its first
/// transaction.
///
/// Walks each holding day by day from its own transaction date to `today`
/// (weekends and holidays included), valuing it at the close of that day or,
/// when the day has no trade, at the nearest earlier non-zero close. This is
/// O(days × holdings) and has no cancellation point; callers that need a
/// latency bound wrap the call in a timeout and treat expiry as an abort.
pub struct TimeSeriesService {
    max_lookback_days: i64,
}

impl TimeSeriesService {
    pub fn new(max_lookback_days: i64) -> Self {
        Self { max_lookback_days }
    }

    /// Populate the cache for every instrument involved, then reconstruct.
    pub async fn reconstruct(
        &self,
        holdings: &Holdings,
        benchmark_id: &str,
        cache: &MarketDataCache,
        today: NaiveDate,
    ) -> Result<NetWorthSeries, CoreError> {
        let mut ids = holdings.instrument_ids();
        if !holdings.tracked.is_empty() {
            ids.push(benchmark_id.to_string());
        }
        let snapshot = cache.snapshot(&ids).await?;
        self.reconstruct_from_snapshot(holdings, benchmark_id, &snapshot, today)
    }

    /// Reconstruct from already-loaded series. Reads `snapshot` only.
    ///
    /// Any holding whose price cannot be resolved within the lookback window
    /// fails the whole reconstruction with `PriceUnavailable`: a partial sum
    /// would silently understate net worth.
    pub fn reconstruct_from_snapshot(
        &self,
        holdings: &Holdings,
        benchmark_id: &str,
        snapshot: &PriceSnapshot,
        today: NaiveDate,
    ) -> Result<NetWorthSeries, CoreError> {
        let start = match holdings.earliest_date() {
            Some(start) if start <= today => start,
            _ => return Ok(NetWorthSeries::default()),
        };

        let mut acc = DailyAccumulator::new(start, today);
        let benchmark = lookup(snapshot, benchmark_id);

        for holding in &holdings.tracked {
            let series = lookup(snapshot, &holding.instrument_id);
            self.accumulate_holding(&mut acc, holding, &series, &benchmark, today)?;
        }
        for asset in &holdings.non_tracked {
            acc.accumulate_non_tracked(asset, today);
        }

        tracing::debug!(
            holdings = holdings.tracked.len(),
            non_tracked = holdings.non_tracked.len(),
            days = acc.len(),
            "Reconstructed net worth series"
        );
        Ok(acc.finish())
    }

    fn accumulate_holding(
        &self,
        acc: &mut DailyAccumulator,
        holding: &Holding,
        series: &PriceSeries,
        benchmark: &PriceSeries,
        today: NaiveDate,
    ) -> Result<(), CoreError> {
        if holding.transaction_date > today {
            return Ok(());
        }

        // Benchmark units are bought once, with the same capital, on the transaction date
        let bm_close = benchmark
            .resolve_close(holding.transaction_date, self.max_lookback_days)
            .ok_or_else(|| {
                CoreError::price_unavailable(&benchmark.instrument_id, holding.transaction_date)
            })?;
        let benchmark_units = holding.acquisition_value() / bm_close.close;
        let acquisition_value = holding.acquisition_value();

        let mut last_benchmark_value = 0.0;
        for day in days_inclusive(holding.transaction_date, today) {
            let idx = acc.index_of(day);

            let close = series
                .resolve_close(day, self.max_lookback_days)
                .ok_or_else(|| CoreError::price_unavailable(&holding.instrument_id, day))?;
            acc.equity[idx] = round2(acc.equity[idx] + holding.quantity * close.close);

            let benchmark_value = match benchmark.resolve_close(day, self.max_lookback_days) {
                Some(p) => round2(benchmark_units * p.close),
                None => last_benchmark_value,
            };
            acc.benchmark[idx] = round2(acc.benchmark[idx] + benchmark_value);
            last_benchmark_value = benchmark_value;

            acc.invested[idx] = round2(acc.invested[idx] + acquisition_value);
        }
        Ok(())
    }
}

fn lookup(snapshot: &PriceSnapshot, instrument_id: &str) -> Arc<PriceSeries> {
    snapshot
        .get(instrument_id)
        .cloned()
        .unwrap_or_else(|| Arc::new(PriceSeries::empty(instrument_id)))
}

/// Dense per-day buffers for one contiguous date range.
struct DailyAccumulator {
    start: NaiveDate,
    equity: Vec<f64>,
    debt: Vec<f64>,
    benchmark: Vec<f64>,
    invested: Vec<f64>,
}

impl DailyAccumulator {
    fn new(start: NaiveDate, end: NaiveDate) -> Self {
        let days = ((end - start).num_days() + 1).max(0) as usize;
        Self {
            start,
            equity: vec![0.0; days],
            debt: vec![0.0; days],
            benchmark: vec![0.0; days],
            invested: vec![0.0; days],
        }
    }

    fn len(&self) -> usize {
        self.equity.len()
    }

    fn index_of(&self, day: NaiveDate) -> usize {
        (day - self.start).num_days() as usize
    }

    fn accumulate_non_tracked(&mut self, asset: &NonTrackedAsset, today: NaiveDate) {
        for day in days_inclusive(asset.buy_date, today) {
            let idx = self.index_of(day);
            self.debt[idx] = round2(self.debt[idx] + asset.current_value);
        }
    }

    fn finish(self) -> NetWorthSeries {
        let mut out = NetWorthSeries::default();
        for (i, day) in self.start.iter_days().take(self.equity.len()).enumerate() {
            let equity = self.equity[i];
            let debt = self.debt[i];
            let net_worth = equity + debt;

            out.equity.insert(day, equity);
            out.debt.insert(day, debt);
            out.net_worth.insert(day, net_worth);
            out.benchmark.insert(day, self.benchmark[i]);
            out.invested.insert(day, self.invested[i]);
            if net_worth != 0.0 {
                out.allocation.insert(day, equity / net_worth * 100.0);
            }
        }
        out
    }
}

