// ═══════════════════════════════════════════════════════════════════
// Service Tests — MarketDataCache, ValuationService, TimeSeriesService,
// ReturnsService, RebalanceService, IngestionService
// ═══════════════════════════════════════════════════════════════════

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use networth_core::errors::CoreError;
use networth_core::models::holding::{Holding, Holdings, NonTrackedAsset};
use networth_core::models::model_portfolio::ModelTarget;
use networth_core::models::price::{PricePoint, PriceSeries};
use networth_core::models::returns::{CashFlow, SipRequest};
use networth_core::models::settings::EngineSettings;
use networth_core::providers::traits::PriceFeed;
use networth_core::services::ingestion_service::{IngestionService, InstrumentLoad};
use networth_core::services::market_cache::{MarketDataCache, PriceSnapshot};
use networth_core::services::rebalance_service::RebalanceService;
use networth_core::services::returns_service::ReturnsService;
use networth_core::services::timeseries_service::TimeSeriesService;
use networth_core::services::valuation_service::ValuationService;
use networth_core::storage::memory::InMemoryStore;
use networth_core::storage::traits::PriceHistoryStore;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn p(date: NaiveDate, close: f64) -> PricePoint {
    PricePoint::new(date, close)
}

fn cache_over(store: InMemoryStore) -> MarketDataCache {
    MarketDataCache::new(Arc::new(store))
}

fn fd(value: f64, date: NaiveDate) -> NonTrackedAsset {
    NonTrackedAsset {
        security_id: "FD".into(),
        buy_date: date,
        buy_value: value,
        current_value: value,
        interest_rate: 7.0,
    }
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

// ═══════════════════════════════════════════════════════════════════
// Mock Store / Feed
// ═══════════════════════════════════════════════════════════════════

/// Counts series reads to observe cache hits.
struct CountingStore {
    inner: InMemoryStore,
    series_calls: AtomicUsize,
}

impl CountingStore {
    fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            series_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PriceHistoryStore for CountingStore {
    async fn get_series(&self, id: &str) -> Result<Vec<PricePoint>, CoreError> {
        self.series_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_series(id).await
    }

    async fn get_latest(&self, id: &str) -> Result<Option<PricePoint>, CoreError> {
        self.inner.get_latest(id).await
    }

    async fn get_all_time_high(&self, id: &str) -> Result<Option<f64>, CoreError> {
        self.inner.get_all_time_high(id).await
    }

    async fn upsert_prices(&self, id: &str, points: &[PricePoint]) -> Result<usize, CoreError> {
        self.inner.upsert_prices(id, points).await
    }
}

/// Serves canned CSV files; unknown instruments fail.
struct MockFeed {
    files: Vec<(&'static str, &'static str)>,
    requests: AtomicUsize,
}

impl MockFeed {
    fn new(files: Vec<(&'static str, &'static str)>) -> Self {
        Self {
            files,
            requests: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PriceFeed for MockFeed {
    fn name(&self) -> &str {
        "MockFeed"
    }

    async fn download_history(
        &self,
        instrument_id: &str,
        _from: NaiveDate,
        _to: NaiveDate,
    ) -> Result<String, CoreError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.files
            .iter()
            .find(|(id, _)| *id == instrument_id)
            .map(|(_, text)| text.to_string())
            .ok_or_else(|| CoreError::Api {
                provider: "MockFeed".into(),
                message: format!("Simulated failure for {instrument_id}"),
            })
    }
}

// ═══════════════════════════════════════════════════════════════════
// MarketDataCache
// ═══════════════════════════════════════════════════════════════════

mod market_cache {
    use super::*;

    fn counting() -> Arc<CountingStore> {
        Arc::new(CountingStore::new(InMemoryStore::new().with_prices(
            "INFY",
            vec![p(d(2024, 1, 1), 100.0), p(d(2024, 1, 2), 120.0), p(d(2024, 1, 3), 0.0)],
        )))
    }

    #[tokio::test]
    async fn series_is_read_through() {
        let store = counting();
        let cache = MarketDataCache::new(store.clone());

        let first = cache.series("INFY").await.unwrap();
        let second = cache.series("INFY").await.unwrap();

        assert_eq!(first.len(), 3);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.series_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached_series_count(), 1);
    }

    #[tokio::test]
    async fn reset_forces_reload() {
        let store = counting();
        let cache = MarketDataCache::new(store.clone());

        cache.series("INFY").await.unwrap();
        cache.reset();
        assert_eq!(cache.cached_series_count(), 0);
        cache.series("INFY").await.unwrap();

        assert_eq!(store.series_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_instrument_is_empty_not_error() {
        let cache = MarketDataCache::new(counting());
        let series = cache.series("NOPE").await.unwrap();
        assert!(series.is_empty());
        assert!(cache.latest("NOPE").await.unwrap().is_none());
        assert!(cache.all_time_high("NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_skips_zero_close() {
        let cache = MarketDataCache::new(counting());
        let latest = cache.latest("INFY").await.unwrap().unwrap();
        assert_eq!(latest.date, d(2024, 1, 2));
        assert_eq!(latest.close, 120.0);
        assert_eq!(cache.all_time_high("INFY").await.unwrap(), Some(120.0));
    }

    #[tokio::test]
    async fn snapshot_holds_each_instrument_once() {
        let store = counting();
        let cache = MarketDataCache::new(store.clone());
        let snap = cache.snapshot(["INFY", "INFY", "TCS"]).await.unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(store.series_calls.load(Ordering::SeqCst), 2);
    }
}

// ═══════════════════════════════════════════════════════════════════
// ValuationService
// ═══════════════════════════════════════════════════════════════════

mod valuation {
    use super::*;

    fn store() -> InMemoryStore {
        InMemoryStore::new()
            .with_prices("INFY", vec![p(d(2024, 1, 1), 100.0), p(d(2024, 1, 10), 150.0)])
            .with_prices("TCS", vec![p(d(2024, 1, 1), 200.0), p(d(2024, 1, 2), 180.0)])
            .with_prices("DEAD", vec![p(d(2024, 1, 1), 0.0)])
    }

    #[tokio::test]
    async fn net_worth_and_allocation() {
        let cache = cache_over(store());
        let holdings = Holdings::new(
            vec![Holding::new("INFY", 10.0, d(2024, 1, 1), 100.0)],
            vec![fd(500.0, d(2024, 1, 1))],
        );
        let v = ValuationService::new().valuate(&holdings, &cache).await.unwrap();
        assert_eq!(v.equity_value, 1500.0);
        assert_eq!(v.debt_value, 500.0);
        assert_eq!(v.net_worth, 2000.0);
        assert_close(v.equity_pct, 75.0);
        assert_close(v.debt_pct, 25.0);
    }

    #[tokio::test]
    async fn empty_holdings_value_zero() {
        let cache = cache_over(store());
        let v = ValuationService::new()
            .valuate(&Holdings::default(), &cache)
            .await
            .unwrap();
        assert_eq!(v.net_worth, 0.0);
    }

    #[tokio::test]
    async fn never_traded_instrument_fails() {
        let cache = cache_over(store());
        let holdings = Holdings::new(vec![Holding::new("DEAD", 1.0, d(2024, 1, 1), 1.0)], vec![]);
        let err = ValuationService::new().valuate(&holdings, &cache).await.unwrap_err();
        assert!(matches!(err, CoreError::PriceUnavailable { .. }));
    }

    #[tokio::test]
    async fn zero_net_worth_is_division_by_zero() {
        let cache = cache_over(store());
        let holdings = Holdings::new(
            vec![
                Holding::new("INFY", 10.0, d(2024, 1, 1), 100.0),
                Holding::new("INFY", -10.0, d(2024, 1, 5), 120.0),
            ],
            vec![],
        );
        let err = ValuationService::new().valuate(&holdings, &cache).await.unwrap_err();
        assert!(matches!(err, CoreError::DivisionByZero(_)));
    }

    #[tokio::test]
    async fn aggregated_report_uses_weighted_average() {
        let cache = cache_over(store());
        let holdings = Holdings::new(
            vec![
                Holding::new("TCS", 10.0, d(2024, 1, 2), 200.0),
                Holding::new("TCS", 10.0, d(2024, 1, 1), 100.0),
            ],
            vec![],
        );
        let report = ValuationService::new()
            .holdings_report(&holdings, &cache, true)
            .await
            .unwrap();

        assert_eq!(report.holdings.len(), 1);
        let row = &report.holdings[0];
        assert_eq!(row.quantity, 20.0);
        assert_eq!(row.buy_price, 150.0);
        assert_eq!(row.reference_price, 180.0);
        assert_eq!(row.current_value, 3600.0);
        assert_eq!(row.profit_loss, 600.0);
        assert_eq!(row.net_pct, 20.0);
        assert_eq!(row.transaction_date, d(2024, 1, 2));
    }

    #[tokio::test]
    async fn sell_keeps_average_price() {
        let cache = cache_over(store());
        let holdings = Holdings::new(
            vec![
                Holding::new("TCS", 10.0, d(2024, 1, 1), 100.0),
                Holding::new("TCS", 10.0, d(2024, 1, 2), 200.0),
                Holding::new("TCS", -5.0, d(2024, 1, 3), 300.0),
            ],
            vec![],
        );
        let report = ValuationService::new()
            .holdings_report(&holdings, &cache, true)
            .await
            .unwrap();
        assert_eq!(report.holdings[0].quantity, 15.0);
        assert_eq!(report.holdings[0].buy_price, 150.0);
    }

    #[tokio::test]
    async fn unaggregated_report_has_row_per_transaction() {
        let cache = cache_over(store());
        let holdings = Holdings::new(
            vec![
                Holding::new("TCS", 10.0, d(2024, 1, 1), 100.0),
                Holding::new("INFY", 2.0, d(2024, 1, 2), 100.0),
                Holding::new("TCS", 5.0, d(2024, 1, 2), 200.0),
            ],
            vec![fd(100.0, d(2024, 1, 1))],
        );
        let report = ValuationService::new()
            .holdings_report(&holdings, &cache, false)
            .await
            .unwrap();
        assert_eq!(report.holdings.len(), 3);
        assert_eq!(report.non_tracked.len(), 1);
        assert_eq!(report.valuation.net_worth, 2700.0 + 300.0 + 100.0);
    }

    #[tokio::test]
    async fn all_time_high_report() {
        let cache = cache_over(store());
        let holdings = Holdings::new(
            vec![
                Holding::new("TCS", 10.0, d(2024, 1, 1), 150.0),
                Holding::new("INFY", 4.0, d(2024, 1, 1), 100.0),
            ],
            vec![fd(1000.0, d(2024, 1, 1))],
        );
        let report = ValuationService::new()
            .all_time_high_report(&holdings, &cache)
            .await
            .unwrap();

        // Sorted by instrument id
        assert_eq!(report.holdings[0].instrument_id, "INFY");
        assert_eq!(report.holdings[0].reference_price, 150.0);
        assert_eq!(report.holdings[1].current_value, 2000.0);
        assert_eq!(report.valuation.net_worth, 600.0 + 2000.0);
        assert_eq!(report.valuation.equity_pct, 100.0);
        assert!(report.non_tracked.is_empty());
    }
}

// ═══════════════════════════════════════════════════════════════════
// TimeSeriesService
// ═══════════════════════════════════════════════════════════════════

mod timeseries {
    use super::*;

    const BENCH: &str = "BSE-500";

    fn infy_points() -> Vec<PricePoint> {
        vec![
            p(d(2024, 1, 1), 100.0),
            p(d(2024, 1, 2), 102.0),
            // 3rd and 4th missing
            p(d(2024, 1, 5), 105.0),
            p(d(2024, 1, 8), 110.0),
            p(d(2024, 1, 9), 0.0),
            p(d(2024, 1, 10), 112.0),
        ]
    }

    fn bench_points() -> Vec<PricePoint> {
        vec![
            p(d(2024, 1, 1), 1000.0),
            p(d(2024, 1, 2), 1010.0),
            p(d(2024, 1, 5), 1020.0),
            p(d(2024, 1, 8), 1030.0),
            p(d(2024, 1, 10), 1050.0),
        ]
    }

    fn snapshot(infy: Vec<PricePoint>) -> PriceSnapshot {
        let mut snap = PriceSnapshot::new();
        snap.insert("INFY".into(), Arc::new(PriceSeries::new("INFY", infy)));
        snap.insert(BENCH.into(), Arc::new(PriceSeries::new(BENCH, bench_points())));
        snap
    }

    fn holdings() -> Holdings {
        Holdings::new(
            vec![
                Holding::new("INFY", 10.0, d(2024, 1, 1), 100.0),
                Holding::new("INFY", 5.0, d(2024, 1, 5), 105.0),
            ],
            vec![fd(1000.0, d(2024, 1, 3))],
        )
    }

    fn today() -> NaiveDate {
        d(2024, 1, 10)
    }

    #[test]
    fn covers_every_calendar_day() {
        let series = TimeSeriesService::new(365)
            .reconstruct_from_snapshot(&holdings(), BENCH, &snapshot(infy_points()), today())
            .unwrap();

        let expected: Vec<NaiveDate> = d(2024, 1, 1).iter_days().take(10).collect();
        for s in [&series.net_worth, &series.equity, &series.debt, &series.benchmark, &series.invested] {
            let dates: Vec<NaiveDate> = s.keys().copied().collect();
            assert_eq!(dates, expected);
        }
    }

    #[test]
    fn equity_is_forward_filled() {
        let series = TimeSeriesService::new(365)
            .reconstruct_from_snapshot(&holdings(), BENCH, &snapshot(infy_points()), today())
            .unwrap();

        assert_eq!(series.equity[&d(2024, 1, 1)], 1000.0);
        assert_eq!(series.equity[&d(2024, 1, 3)], 1020.0);
        assert_eq!(series.equity[&d(2024, 1, 4)], 1020.0);
        assert_eq!(series.equity[&d(2024, 1, 5)], 1575.0);
        assert_eq!(series.equity[&d(2024, 1, 7)], 1575.0);
        // Zero close on the 9th falls back to the 8th
        assert_eq!(series.equity[&d(2024, 1, 9)], 1650.0);
        assert_eq!(series.equity[&d(2024, 1, 10)], 1680.0);
    }

    #[test]
    fn net_worth_is_equity_plus_debt() {
        let series = TimeSeriesService::new(365)
            .reconstruct_from_snapshot(&holdings(), BENCH, &snapshot(infy_points()), today())
            .unwrap();

        assert_eq!(series.debt[&d(2024, 1, 2)], 0.0);
        assert_eq!(series.debt[&d(2024, 1, 3)], 1000.0);
        for (day, nw) in &series.net_worth {
            assert_eq!(*nw, series.equity[day] + series.debt[day]);
        }
        assert_eq!(series.net_worth[&d(2024, 1, 10)], 2680.0);
    }

    #[test]
    fn allocation_is_equity_share() {
        let series = TimeSeriesService::new(365)
            .reconstruct_from_snapshot(&holdings(), BENCH, &snapshot(infy_points()), today())
            .unwrap();
        assert_close(series.allocation[&d(2024, 1, 1)], 100.0);
        assert_close(series.allocation[&d(2024, 1, 3)], 1020.0 / 2020.0 * 100.0);
    }

    #[test]
    fn invested_counts_each_holding_once_per_day() {
        let series = TimeSeriesService::new(365)
            .reconstruct_from_snapshot(&holdings(), BENCH, &snapshot(infy_points()), today())
            .unwrap();
        assert_eq!(series.invested[&d(2024, 1, 1)], 1000.0);
        assert_eq!(series.invested[&d(2024, 1, 4)], 1000.0);
        assert_eq!(series.invested[&d(2024, 1, 5)], 1525.0);
        assert_eq!(series.invested[&d(2024, 1, 10)], 1525.0);
    }

    #[test]
    fn benchmark_tracks_same_capital() {
        let series = TimeSeriesService::new(365)
            .reconstruct_from_snapshot(&holdings(), BENCH, &snapshot(infy_points()), today())
            .unwrap();
        assert_eq!(series.benchmark[&d(2024, 1, 1)], 1000.0);
        assert_eq!(series.benchmark[&d(2024, 1, 5)], 1545.0);
        assert_close(series.benchmark[&d(2024, 1, 10)], 1590.44);
    }

    #[test]
    fn extra_zero_price_day_changes_nothing() {
        let service = TimeSeriesService::new(365);
        let base = service
            .reconstruct_from_snapshot(&holdings(), BENCH, &snapshot(infy_points()), today())
            .unwrap();

        let mut with_zero = infy_points();
        with_zero.push(p(d(2024, 1, 3), 0.0));
        with_zero.push(p(d(2024, 1, 6), 0.0));
        let patched = service
            .reconstruct_from_snapshot(&holdings(), BENCH, &snapshot(with_zero), today())
            .unwrap();

        assert_eq!(base.net_worth, patched.net_worth);
    }

    #[test]
    fn gap_beyond_lookback_fails() {
        let err = TimeSeriesService::new(1)
            .reconstruct_from_snapshot(&holdings(), BENCH, &snapshot(infy_points()), today())
            .unwrap_err();
        match err {
            CoreError::PriceUnavailable { instrument, date } => {
                assert_eq!(instrument, "INFY");
                assert_eq!(date, "2024-01-04");
            }
            other => panic!("expected PriceUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn huge_lookback_matches_default() {
        let settings = EngineSettings {
            max_price_lookback_days: 200_000_000,
            ..EngineSettings::default()
        };
        settings.validate().unwrap();

        let wide = TimeSeriesService::new(settings.max_price_lookback_days)
            .reconstruct_from_snapshot(&holdings(), BENCH, &snapshot(infy_points()), today())
            .unwrap();
        let base = TimeSeriesService::new(365)
            .reconstruct_from_snapshot(&holdings(), BENCH, &snapshot(infy_points()), today())
            .unwrap();
        assert_eq!(wide.net_worth, base.net_worth);
        assert_eq!(wide.benchmark, base.benchmark);
    }

    #[test]
    fn benchmark_gap_repeats_previous_value() {
        // Benchmark goes quiet after the 2nd; INFY keeps trading every day
        let infy: Vec<PricePoint> = d(2024, 1, 1)
            .iter_days()
            .take(10)
            .enumerate()
            .map(|(k, day)| p(day, 100.0 + k as f64))
            .collect();
        let mut snap = PriceSnapshot::new();
        snap.insert("INFY".into(), Arc::new(PriceSeries::new("INFY", infy)));
        snap.insert(
            BENCH.into(),
            Arc::new(PriceSeries::new(
                BENCH,
                vec![p(d(2024, 1, 1), 1000.0), p(d(2024, 1, 2), 1010.0)],
            )),
        );
        let holdings = Holdings::new(vec![Holding::new("INFY", 10.0, d(2024, 1, 1), 100.0)], vec![]);

        let series = TimeSeriesService::new(2)
            .reconstruct_from_snapshot(&holdings, BENCH, &snap, today())
            .unwrap();

        assert_eq!(series.benchmark[&d(2024, 1, 2)], 1010.0);
        // 3rd and 4th still resolve the 2nd's close within two days
        assert_eq!(series.benchmark[&d(2024, 1, 4)], 1010.0);
        // From the 5th nothing resolves; each day repeats the one before
        for day in d(2024, 1, 5).iter_days().take_while(|day| *day <= today()) {
            let prev = day.pred_opt().unwrap();
            assert_eq!(series.benchmark[&day], series.benchmark[&prev]);
        }
        assert_eq!(series.equity[&today()], 1090.0);
    }

    #[test]
    fn holding_before_listing_fails() {
        let holdings = Holdings::new(vec![Holding::new("INFY", 1.0, d(2023, 12, 31), 1.0)], vec![]);
        let mut snap = snapshot(infy_points());
        snap.insert(
            BENCH.into(),
            Arc::new(PriceSeries::new(BENCH, vec![p(d(2023, 12, 1), 900.0)])),
        );
        let err = TimeSeriesService::new(365)
            .reconstruct_from_snapshot(&holdings, BENCH, &snap, today())
            .unwrap_err();
        assert!(matches!(err, CoreError::PriceUnavailable { .. }));
    }

    #[test]
    fn missing_benchmark_fails() {
        let mut snap = snapshot(infy_points());
        snap.remove(BENCH);
        let err = TimeSeriesService::new(365)
            .reconstruct_from_snapshot(&holdings(), BENCH, &snap, today())
            .unwrap_err();
        assert!(matches!(err, CoreError::PriceUnavailable { instrument, .. } if instrument == BENCH));
    }

    #[test]
    fn non_tracked_only_needs_no_prices() {
        let holdings = Holdings::new(vec![], vec![fd(250.0, d(2024, 1, 8))]);
        let series = TimeSeriesService::new(365)
            .reconstruct_from_snapshot(&holdings, BENCH, &PriceSnapshot::new(), today())
            .unwrap();
        assert_eq!(series.net_worth.len(), 3);
        assert_eq!(series.net_worth[&d(2024, 1, 10)], 250.0);
        assert_eq!(series.allocation[&d(2024, 1, 10)], 0.0);
    }

    #[test]
    fn empty_holdings_give_empty_series() {
        let series = TimeSeriesService::new(365)
            .reconstruct_from_snapshot(&Holdings::default(), BENCH, &PriceSnapshot::new(), today())
            .unwrap();
        assert!(series.is_empty());
    }

    #[tokio::test]
    async fn reconstruct_reads_through_cache() {
        let cache = cache_over(
            InMemoryStore::new()
                .with_prices("INFY", infy_points())
                .with_prices(BENCH, bench_points()),
        );
        let series = TimeSeriesService::new(365)
            .reconstruct(&holdings(), BENCH, &cache, today())
            .await
            .unwrap();
        assert_eq!(series.first_date(), Some(d(2024, 1, 1)));
        assert_eq!(series.last_date(), Some(today()));
        assert_eq!(cache.cached_series_count(), 2);
    }
}

// ═══════════════════════════════════════════════════════════════════
// ReturnsService — XIRR
// ═══════════════════════════════════════════════════════════════════

mod xirr {
    use super::*;

    fn service() -> ReturnsService {
        ReturnsService::default()
    }

    #[test]
    fn ten_percent_over_one_year() {
        let flows = [
            CashFlow::new(-100.0, d(2023, 1, 1)),
            CashFlow::new(110.0, d(2024, 1, 1)),
        ];
        let r = service().xirr(&flows).unwrap();
        assert!((r - 0.10).abs() < 1e-4, "got {r}");
    }

    #[test]
    fn rate_of_return_with_terminal_value() {
        let r = service()
            .rate_of_return(&[CashFlow::new(-100.0, d(2023, 1, 1))], 110.0, d(2024, 1, 1))
            .unwrap();
        assert!((r - 0.10).abs() < 1e-4, "got {r}");
    }

    #[test]
    fn loss_is_negative() {
        let r = service()
            .rate_of_return(&[CashFlow::new(-100.0, d(2023, 1, 1))], 90.0, d(2024, 1, 1))
            .unwrap();
        assert!((r + 0.10).abs() < 1e-4, "got {r}");
    }

    #[test]
    fn near_total_loss_is_solved() {
        let r = service()
            .rate_of_return(&[CashFlow::new(-100.0, d(2023, 1, 1))], 0.5, d(2024, 1, 1))
            .unwrap();
        assert!((r + 0.995).abs() < 1e-6, "got {r}");
    }

    #[test]
    fn tolerance_is_relative_to_flow_size() {
        // NPV after two Newton steps is ~7e4, under 1e-3 × 2.1e9
        let flows = [
            CashFlow::new(-1.0e9, d(2023, 1, 1)),
            CashFlow::new(1.1e9, d(2024, 1, 1)),
        ];
        let settings = EngineSettings {
            xirr_tolerance: 1e-3,
            ..EngineSettings::default()
        };
        let r = ReturnsService::new(&settings).xirr(&flows).unwrap();
        assert!((r - 0.099924).abs() < 1e-5, "got {r}");
    }

    #[test]
    fn flow_order_does_not_matter() {
        let flows = [
            CashFlow::new(110.0, d(2024, 1, 1)),
            CashFlow::new(-100.0, d(2023, 1, 1)),
        ];
        let r = service().xirr(&flows).unwrap();
        assert!((r - 0.10).abs() < 1e-4);
    }

    #[test]
    fn monthly_contributions() {
        // 12 × 1000 at 1% a month, valued a year after the first
        let start = d(2023, 1, 1);
        let flows: Vec<CashFlow> = (0..12)
            .map(|k| CashFlow::new(-1000.0, start.checked_add_months(chrono::Months::new(k)).unwrap()))
            .collect();
        let r = service().rate_of_return(&flows, 12_800.0, d(2024, 1, 1)).unwrap();
        assert!(r.is_finite());
        assert!(r > 0.10 && r < 0.20, "got {r}");
    }

    #[test]
    fn same_day_flows_are_zero_return() {
        let r = service()
            .rate_of_return(&[CashFlow::new(-500.0, d(2024, 1, 1))], 500.0, d(2024, 1, 1))
            .unwrap();
        assert_eq!(r, 0.0);
    }

    #[test]
    fn single_flow_is_invalid() {
        let err = service().xirr(&[CashFlow::new(-100.0, d(2023, 1, 1))]).unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
    }

    #[test]
    fn one_signed_flows_are_invalid() {
        let flows = [
            CashFlow::new(-100.0, d(2023, 1, 1)),
            CashFlow::new(-100.0, d(2024, 1, 1)),
        ];
        assert!(matches!(service().xirr(&flows), Err(CoreError::ValidationError(_))));
    }

    #[test]
    fn unreachable_rate_fails_without_nan() {
        let flows = [
            CashFlow::new(-100.0, d(2024, 1, 1)),
            CashFlow::new(1_000_000.0, d(2024, 1, 2)),
        ];
        match service().xirr(&flows) {
            Err(CoreError::ConvergenceFailure { residual, .. }) => assert!(residual.is_finite()),
            other => panic!("expected ConvergenceFailure, got {other:?}"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// ReturnsService — SIP simulation
// ═══════════════════════════════════════════════════════════════════

mod sip {
    use super::*;

    /// Close on the 15th of every month from Jan 2022, rising 1 per month.
    fn monthly_series() -> PriceSeries {
        let points = (0..30)
            .map(|k| {
                let date = d(2022, 1, 15).checked_add_months(chrono::Months::new(k)).unwrap();
                p(date, 100.0 + k as f64)
            })
            .collect();
        PriceSeries::new("NIFTYBEES", points)
    }

    fn request(step_up: f64) -> SipRequest {
        SipRequest {
            instrument_id: "NIFTYBEES".into(),
            start_date: d(2022, 1, 15),
            end_date: d(2023, 12, 15),
            monthly_amount: 1000.0,
            annual_step_up_pct: step_up,
        }
    }

    #[test]
    fn one_sub_period_per_month() {
        let report = ReturnsService::default()
            .simulate_sip_on(&request(0.0), &monthly_series())
            .unwrap();
        assert_eq!(report.sub_periods.len(), 24);
        assert_eq!(report.sub_periods[0].date, d(2022, 1, 15));
        assert_eq!(report.sub_periods[23].date, d(2023, 12, 15));
        assert_eq!(report.sub_periods[23].total_investment, 24_000.0);
    }

    #[test]
    fn buckets_sum_to_hundred() {
        let report = ReturnsService::default()
            .simulate_sip_on(&request(10.0), &monthly_series())
            .unwrap();
        assert!((report.buckets.total() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn first_period_return_is_zero() {
        let report = ReturnsService::default()
            .simulate_sip_on(&request(0.0), &monthly_series())
            .unwrap();
        assert_eq!(report.sub_periods[0].xirr_pct, Some(0.0));
        assert!(report.buckets.less_than_zero > 0.0);
    }

    #[test]
    fn rising_prices_give_positive_overall_return() {
        let report = ReturnsService::default()
            .simulate_sip_on(&request(0.0), &monthly_series())
            .unwrap();
        assert!(report.overall_xirr_pct.unwrap() > 0.0);
        assert!(report.sub_periods[23].xirr_pct.unwrap() > 0.0);
    }

    #[test]
    fn step_up_after_twelve_instalments() {
        let report = ReturnsService::default()
            .simulate_sip_on(&request(10.0), &monthly_series())
            .unwrap();
        assert_eq!(report.sub_periods[11].instalment, 1000.0);
        assert_eq!(report.sub_periods[12].instalment, 1100.0);
        assert_eq!(report.sub_periods[23].total_investment, 25_200.0);
    }

    #[test]
    fn units_accumulate() {
        let report = ReturnsService::default()
            .simulate_sip_on(&request(0.0), &monthly_series())
            .unwrap();
        let expected = 1000.0 / 100.0 + 1000.0 / 101.0;
        assert_close(report.sub_periods[1].units, expected);
        assert_close(report.sub_periods[1].end_value, (expected * 101.0 * 100.0).round() / 100.0);
    }

    #[test]
    fn zero_close_uses_previous_trade() {
        let series = PriceSeries::new(
            "X",
            vec![
                p(d(2024, 1, 15), 100.0),
                p(d(2024, 2, 14), 110.0),
                p(d(2024, 2, 15), 0.0),
            ],
        );
        let req = SipRequest {
            instrument_id: "X".into(),
            start_date: d(2024, 1, 15),
            end_date: d(2024, 2, 15),
            monthly_amount: 1100.0,
            annual_step_up_pct: 0.0,
        };
        let report = ReturnsService::default().simulate_sip_on(&req, &series).unwrap();
        assert_eq!(report.sub_periods[1].buy_price, 110.0);
        assert_close(report.sub_periods[1].units, 11.0 + 10.0);
    }

    #[test]
    fn start_after_end_is_invalid() {
        let mut req = request(0.0);
        req.start_date = d(2024, 1, 1);
        let err = ReturnsService::default()
            .simulate_sip_on(&req, &monthly_series())
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
    }

    #[test]
    fn non_positive_amount_is_invalid() {
        let mut req = request(0.0);
        req.monthly_amount = 0.0;
        assert!(ReturnsService::default()
            .simulate_sip_on(&req, &monthly_series())
            .is_err());
    }

    #[tokio::test]
    async fn unknown_instrument_fails() {
        let cache = cache_over(InMemoryStore::new());
        let err = ReturnsService::default()
            .simulate_sip(&request(0.0), &cache)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PriceUnavailable { .. }));
    }
}

// ═══════════════════════════════════════════════════════════════════
// ReturnsService — return series
// ═══════════════════════════════════════════════════════════════════

mod return_series {
    use super::*;

    const BENCH: &str = "BSE-500";

    fn cache() -> MarketDataCache {
        cache_over(
            InMemoryStore::new()
                .with_prices("INFY", vec![p(d(2023, 1, 1), 100.0), p(d(2024, 1, 1), 110.0)])
                .with_prices(BENCH, vec![p(d(2023, 1, 1), 1000.0), p(d(2024, 1, 1), 1200.0)]),
        )
    }

    fn holdings() -> Holdings {
        Holdings::new(vec![Holding::new("INFY", 10.0, d(2023, 1, 1), 100.0)], vec![])
    }

    #[tokio::test]
    async fn skips_warm_up_window() {
        let series = ReturnsService::default()
            .return_series(&holdings(), BENCH, &cache(), d(2024, 1, 1))
            .await
            .unwrap();
        assert_eq!(series.portfolio.keys().next(), Some(&d(2023, 7, 1)));
        assert_eq!(series.portfolio[&d(2023, 7, 1)], 0.0);
    }

    #[tokio::test]
    async fn compares_against_benchmark() {
        let series = ReturnsService::default()
            .return_series(&holdings(), BENCH, &cache(), d(2024, 1, 1))
            .await
            .unwrap();
        assert_close(series.portfolio[&d(2024, 1, 1)], 10.0);
        assert_close(series.benchmark[&d(2024, 1, 1)], 20.0);
        assert_eq!(series.portfolio.len(), series.benchmark.len());
    }

    #[tokio::test]
    async fn no_tracked_holdings_is_empty() {
        let series = ReturnsService::default()
            .return_series(&Holdings::default(), BENCH, &cache(), d(2024, 1, 1))
            .await
            .unwrap();
        assert!(series.portfolio.is_empty());
    }

    #[tokio::test]
    async fn warm_up_longer_than_history_is_empty() {
        let settings = EngineSettings {
            return_warmup_months: 24,
            ..EngineSettings::default()
        };
        let series = ReturnsService::new(&settings)
            .return_series(&holdings(), BENCH, &cache(), d(2024, 1, 1))
            .await
            .unwrap();
        assert!(series.portfolio.is_empty());
    }
}

// ═══════════════════════════════════════════════════════════════════
// RebalanceService
// ═══════════════════════════════════════════════════════════════════

mod rebalance {
    use super::*;

    fn cache() -> MarketDataCache {
        cache_over(InMemoryStore::new().with_prices("INFY", vec![p(d(2024, 1, 1), 120.0)]))
    }

    #[tokio::test]
    async fn nothing_invested_wants_full_target() {
        let targets = [ModelTarget::new("INFY", 20.0, 150.0)];
        let adj = RebalanceService::new()
            .rebalance(&targets, &Holdings::default(), 100_000.0, &cache())
            .await
            .unwrap();
        assert_eq!(adj[0].desired_amount, 20_000.0);
        assert_eq!(adj[0].invested_amount, 0.0);
        assert_eq!(adj[0].adjusted_amount, 20_000.0);
    }

    #[tokio::test]
    async fn partly_invested_wants_remainder() {
        let targets = [ModelTarget::new("INFY", 20.0, 150.0)];
        let holdings = Holdings::new(vec![Holding::new("INFY", 150.0, d(2024, 1, 1), 100.0)], vec![]);
        let adj = RebalanceService::new()
            .rebalance(&targets, &holdings, 100_000.0, &cache())
            .await
            .unwrap();
        assert_eq!(adj[0].invested_amount, 15_000.0);
        assert_eq!(adj[0].adjusted_amount, 5_000.0);
    }

    #[tokio::test]
    async fn sells_reduce_invested() {
        let targets = [ModelTarget::new("INFY", 20.0, 150.0)];
        let holdings = Holdings::new(
            vec![
                Holding::new("INFY", 200.0, d(2024, 1, 1), 100.0),
                Holding::new("INFY", -50.0, d(2024, 1, 2), 100.0),
            ],
            vec![],
        );
        let adj = RebalanceService::new()
            .rebalance(&targets, &holdings, 100_000.0, &cache())
            .await
            .unwrap();
        assert_eq!(adj[0].adjusted_amount, 5_000.0);
    }

    #[tokio::test]
    async fn over_invested_is_negative() {
        let targets = [ModelTarget::new("INFY", 10.0, 100.0)];
        let holdings = Holdings::new(vec![Holding::new("INFY", 150.0, d(2024, 1, 1), 100.0)], vec![]);
        let adj = RebalanceService::new()
            .rebalance(&targets, &holdings, 100_000.0, &cache())
            .await
            .unwrap();
        assert_eq!(adj[0].adjusted_amount, -5_000.0);
        assert!(!adj[0].below_reasonable_price);
        assert_eq!(adj[0].percent_below_reasonable, -20.0);
    }

    #[tokio::test]
    async fn flags_price_below_reasonable() {
        let targets = [ModelTarget::new("INFY", 20.0, 150.0)];
        let adj = RebalanceService::new()
            .rebalance(&targets, &Holdings::default(), 100_000.0, &cache())
            .await
            .unwrap();
        assert_eq!(adj[0].latest_price, 120.0);
        assert_eq!(adj[0].percent_below_reasonable, 20.0);
        assert!(adj[0].below_reasonable_price);
    }

    #[tokio::test]
    async fn zero_reasonable_price_is_division_by_zero() {
        let targets = [ModelTarget::new("INFY", 20.0, 0.0)];
        let err = RebalanceService::new()
            .rebalance(&targets, &Holdings::default(), 100_000.0, &cache())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DivisionByZero(_)));
    }

    #[tokio::test]
    async fn missing_latest_price_fails() {
        let targets = [ModelTarget::new("TCS", 20.0, 100.0)];
        let err = RebalanceService::new()
            .rebalance(&targets, &Holdings::default(), 100_000.0, &cache())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PriceUnavailable { .. }));
    }
}

// ═══════════════════════════════════════════════════════════════════
// IngestionService
// ═══════════════════════════════════════════════════════════════════

mod ingestion {
    use super::*;

    const INFY_CSV: &str = "\
Date,Open,High,Low,Close,Adj Close,Volume
2024-01-01,1,1,1,100,100,10
2024-01-02,1,1,1,101,101,10
";

    const TCS_CSV: &str = "\
Date,Open,High,Low,Close,Adj Close,Volume
2024-01-01,1,1,1,200,200,10
2024-01-02,null,null,null,null,null,null
";

    fn requests() -> Vec<InstrumentLoad> {
        vec![
            InstrumentLoad::new("INFY", d(2024, 1, 1)),
            InstrumentLoad::new("TCS", d(2024, 1, 1)),
            InstrumentLoad::new("GONE", d(2024, 1, 1)),
        ]
    }

    #[tokio::test]
    async fn loads_files_and_reports_failures() {
        let store = Arc::new(InMemoryStore::new());
        let cache = MarketDataCache::new(store.clone());
        let feed = MockFeed::new(vec![("INFY", INFY_CSV), ("TCS", TCS_CSV)]);

        let summary = IngestionService::new(Duration::ZERO)
            .refresh(&feed, store.clone(), &cache, &requests(), d(2024, 1, 2))
            .await
            .unwrap();

        assert_eq!(summary.loaded, vec!["INFY".to_string(), "TCS".to_string()]);
        assert_eq!(summary.failed, vec!["GONE".to_string()]);
        assert_eq!(summary.records_loaded, 3);
        assert_eq!(summary.rows_skipped, 1);
        assert_eq!(store.price_count("INFY"), 2);
        assert_eq!(feed.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn refresh_resets_cache() {
        let store = Arc::new(InMemoryStore::new().with_prices("INFY", vec![p(d(2023, 12, 29), 90.0)]));
        let cache = MarketDataCache::new(store.clone());
        assert_eq!(cache.latest("INFY").await.unwrap().unwrap().close, 90.0);

        let feed = MockFeed::new(vec![("INFY", INFY_CSV)]);
        IngestionService::new(Duration::ZERO)
            .refresh(&feed, store.clone(), &cache, &requests()[..1], d(2024, 1, 2))
            .await
            .unwrap();

        assert_eq!(cache.cached_series_count(), 0);
        assert_eq!(cache.latest("INFY").await.unwrap().unwrap().close, 101.0);
    }

    /// Panics while writing one instrument; everything else goes through.
    struct CrashingStore {
        inner: Arc<InMemoryStore>,
        crash_on: &'static str,
    }

    #[async_trait]
    impl PriceHistoryStore for CrashingStore {
        async fn get_series(&self, id: &str) -> Result<Vec<PricePoint>, CoreError> {
            self.inner.get_series(id).await
        }

        async fn get_latest(&self, id: &str) -> Result<Option<PricePoint>, CoreError> {
            self.inner.get_latest(id).await
        }

        async fn get_all_time_high(&self, id: &str) -> Result<Option<f64>, CoreError> {
            self.inner.get_all_time_high(id).await
        }

        async fn upsert_prices(&self, id: &str, points: &[PricePoint]) -> Result<usize, CoreError> {
            if id == self.crash_on {
                panic!("driver crash");
            }
            self.inner.upsert_prices(id, points).await
        }
    }

    #[tokio::test]
    async fn panicking_load_does_not_abort_batch() {
        let inner = Arc::new(InMemoryStore::new().with_prices("INFY", vec![p(d(2023, 12, 29), 90.0)]));
        let cache = MarketDataCache::new(inner.clone());
        assert_eq!(cache.latest("INFY").await.unwrap().unwrap().close, 90.0);

        let store = Arc::new(CrashingStore {
            inner: inner.clone(),
            crash_on: "TCS",
        });
        let feed = MockFeed::new(vec![("INFY", INFY_CSV), ("TCS", TCS_CSV)]);
        let summary = IngestionService::new(Duration::ZERO)
            .refresh(&feed, store, &cache, &requests()[..2], d(2024, 1, 2))
            .await
            .unwrap();

        assert_eq!(summary.loaded, vec!["INFY".to_string()]);
        assert_eq!(summary.failed, vec!["TCS".to_string()]);
        assert_eq!(inner.price_count("INFY"), 3);
        assert_eq!(cache.latest("INFY").await.unwrap().unwrap().close, 101.0);
    }

    #[tokio::test]
    async fn downloads_are_spaced_out() {
        let store = Arc::new(InMemoryStore::new());
        let cache = MarketDataCache::new(store.clone());
        let feed = MockFeed::new(vec![("INFY", INFY_CSV), ("TCS", TCS_CSV)]);

        let started = std::time::Instant::now();
        IngestionService::new(Duration::from_millis(20))
            .refresh(&feed, store, &cache, &requests()[..2], d(2024, 1, 2))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
