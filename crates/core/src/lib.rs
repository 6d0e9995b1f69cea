pub mod errors;
pub mod models;
pub mod providers;
pub mod services;
pub mod storage;
pub mod utils;

use chrono::NaiveDate;
use models::{
    analytics::HoldingsReport,
    holding::{Holdings, RawHoldings},
    model_portfolio::{ModelPortfolio, RebalanceAdjustment},
    returns::{CashFlow, ReturnSeries, SipReport, SipRequest},
    series::NetWorthSeries,
    settings::EngineSettings,
};
use providers::traits::PriceFeed;
use services::{
    ingestion_service::{IngestionService, InstrumentLoad, RefreshSummary},
    market_cache::MarketDataCache,
    rebalance_service::RebalanceService,
    returns_service::ReturnsService,
    timeseries_service::TimeSeriesService,
    valuation_service::ValuationService,
};
use std::sync::Arc;
use std::time::Duration;
use storage::traits::{HoldingsStore, ModelPortfolioStore, PriceHistoryStore};

use errors::CoreError;

/// Main entry point of the engine.
///
/// Wires the stores, the market data cache and every service for one process
/// run. Holds no per-user state: each call loads what it needs from the
/// stores, populates the cache, then computes from an immutable snapshot.
#[must_use]
pub struct PortfolioTracker {
    prices: Arc<dyn PriceHistoryStore>,
    holdings: Arc<dyn HoldingsStore>,
    model_portfolios: Arc<dyn ModelPortfolioStore>,
    settings: EngineSettings,
    cache: MarketDataCache,
    valuation_service: ValuationService,
    timeseries_service: TimeSeriesService,
    returns_service: ReturnsService,
    rebalance_service: RebalanceService,
    ingestion_service: IngestionService,
    /// Fixed "today"; `None` means the current UTC date.
    as_of: Option<NaiveDate>,
}

impl std::fmt::Debug for PortfolioTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortfolioTracker")
            .field("settings", &self.settings)
            .field("cached_series", &self.cache.cached_series_count())
            .field("as_of", &self.as_of)
            .finish()
    }
}

impl PortfolioTracker {
    /// Build a tracker over the given stores. Fails on invalid settings.
    pub fn new(
        prices: Arc<dyn PriceHistoryStore>,
        holdings: Arc<dyn HoldingsStore>,
        model_portfolios: Arc<dyn ModelPortfolioStore>,
        settings: EngineSettings,
    ) -> Result<Self, CoreError> {
        settings.validate()?;
        tracing::info!(benchmark = %settings.benchmark_id, "Portfolio tracker initialized");
        Ok(Self {
            cache: MarketDataCache::new(Arc::clone(&prices)),
            valuation_service: ValuationService::new(),
            timeseries_service: TimeSeriesService::new(settings.max_price_lookback_days),
            returns_service: ReturnsService::new(&settings),
            rebalance_service: RebalanceService::new(),
            ingestion_service: IngestionService::new(Duration::from_millis(
                settings.download_delay_ms,
            )),
            prices,
            holdings,
            model_portfolios,
            settings,
            as_of: None,
        })
    }

    /// Builder: pin "today" to a fixed date (replays, tests).
    pub fn with_as_of(mut self, date: NaiveDate) -> Self {
        self.as_of = Some(date);
        self
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[must_use]
    pub fn cache(&self) -> &MarketDataCache {
        &self.cache
    }

    fn today(&self) -> NaiveDate {
        self.as_of.unwrap_or_else(|| chrono::Utc::now().date_naive())
    }

    async fn load_holdings(&self, user_id: &str) -> Result<Holdings, CoreError> {
        let raw = self.holdings.get_holdings(user_id).await?;
        Holdings::from_raw(&raw)
    }

    // ── Holdings ────────────────────────────────────────────────────

    /// Parse and append holdings for a user.
    ///
    /// Every sell is stored together with a CASH non-tracked asset worth the
    /// sale proceeds, so the capital stays accounted for in net worth. Nothing
    /// is saved if any record fails to parse.
    pub async fn add_holdings(
        &self,
        user_id: &str,
        raw: &RawHoldings,
    ) -> Result<Holdings, CoreError> {
        let mut holdings = Holdings::from_raw(raw)?;
        let cash = holdings.convert_sells_to_cash();
        self.holdings
            .save_holdings(user_id, &RawHoldings::from(&holdings))
            .await?;
        tracing::info!(
            user = user_id,
            tracked = holdings.tracked.len(),
            non_tracked = holdings.non_tracked.len(),
            sells_converted = cash,
            "Holdings added"
        );
        Ok(holdings)
    }

    /// Holdings valued at the latest prices, optionally one row per instrument.
    pub async fn holdings_report(
        &self,
        user_id: &str,
        aggregate: bool,
    ) -> Result<HoldingsReport, CoreError> {
        let holdings = self.load_holdings(user_id).await?;
        self.valuation_service
            .holdings_report(&holdings, &self.cache, aggregate)
            .await
    }

    /// Aggregated holdings valued at each instrument's all-time high.
    pub async fn all_time_high_report(&self, user_id: &str) -> Result<HoldingsReport, CoreError> {
        let holdings = self.load_holdings(user_id).await?;
        self.valuation_service
            .all_time_high_report(&holdings, &self.cache)
            .await
    }

    // ── Series & returns ────────────────────────────────────────────

    /// Daily net worth, equity, debt, benchmark, invested and allocation from
    /// the first transaction to today.
    pub async fn net_worth_over_periods(&self, user_id: &str) -> Result<NetWorthSeries, CoreError> {
        let holdings = self.load_holdings(user_id).await?;
        self.timeseries_service
            .reconstruct(&holdings, &self.settings.benchmark_id, &self.cache, self.today())
            .await
    }

    /// Daily since-inception return of the portfolio and of the benchmark.
    pub async fn return_series(&self, user_id: &str) -> Result<ReturnSeries, CoreError> {
        let holdings = self.load_holdings(user_id).await?;
        self.returns_service
            .return_series(&holdings, &self.settings.benchmark_id, &self.cache, self.today())
            .await
    }

    pub async fn simulate_sip(&self, request: &SipRequest) -> Result<SipReport, CoreError> {
        self.returns_service.simulate_sip(request, &self.cache).await
    }

    /// Annualized return of `cash_flows` plus a terminal value.
    pub fn rate_of_return(
        &self,
        cash_flows: &[CashFlow],
        terminal_value: f64,
        terminal_date: NaiveDate,
    ) -> Result<f64, CoreError> {
        self.returns_service
            .rate_of_return(cash_flows, terminal_value, terminal_date)
    }

    // ── Model portfolio ─────────────────────────────────────────────

    /// Validate and store a user's model portfolio, replacing the previous one.
    pub async fn add_model_portfolio(
        &self,
        user_id: &str,
        portfolio: &ModelPortfolio,
    ) -> Result<(), CoreError> {
        portfolio.validate()?;
        self.model_portfolios
            .save_targets(user_id, &portfolio.targets, portfolio.target_amount)
            .await
    }

    pub async fn model_portfolio(&self, user_id: &str) -> Result<ModelPortfolio, CoreError> {
        let targets = self.model_portfolios.get_targets(user_id).await?;
        let target_amount = self.model_portfolios.get_target_amount(user_id).await?;
        Ok(ModelPortfolio {
            targets,
            target_amount,
        })
    }

    /// Compare the model portfolio with the user's holdings.
    ///
    /// A user with a model portfolio but no holdings yet gets adjustments
    /// against zero invested.
    pub async fn sync_model_portfolio(
        &self,
        user_id: &str,
    ) -> Result<Vec<RebalanceAdjustment>, CoreError> {
        let model = self.model_portfolio(user_id).await?;
        let holdings = match self.load_holdings(user_id).await {
            Ok(holdings) => holdings,
            Err(CoreError::UserNotFound(_)) => Holdings::default(),
            Err(e) => return Err(e),
        };
        self.rebalance_service
            .rebalance(&model.targets, &holdings, model.target_amount, &self.cache)
            .await
    }

    // ── Price data ──────────────────────────────────────────────────

    /// Download, store and publish new price history up to today.
    pub async fn refresh_prices(
        &self,
        feed: &dyn PriceFeed,
        requests: &[InstrumentLoad],
    ) -> Result<RefreshSummary, CoreError> {
        self.ingestion_service
            .refresh(feed, Arc::clone(&self.prices), &self.cache, requests, self.today())
            .await
    }

    /// Drop every cached price. Call after writing to the price store directly.
    pub fn reset_caches(&self) {
        self.cache.reset();
    }
}
