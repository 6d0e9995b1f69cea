use chrono::NaiveDate;
use std::sync::Arc;

use crate::errors::CoreError;
use crate::models::holding::{Holding, Holdings};
use crate::models::price::PriceSeries;
use crate::models::returns::{
    CashFlow, ReturnBuckets, ReturnSeries, SipReport, SipRequest, SipSubPeriod,
};
use crate::models::settings::EngineSettings;
use crate::services::market_cache::{MarketDataCache, PriceSnapshot};
use crate::utils::{add_months, days_inclusive, round2};

/// Rates outside this range are clamped during Newton steps.
const MIN_RATE: f64 = -0.999999;
const MAX_RATE: f64 = 100.0;

/// Bisection gives up once the bracket is narrower than this.
const MIN_BRACKET_WIDTH: f64 = 1e-12;

const DAYS_PER_YEAR: f64 = 365.0;

/// Annualized returns from dated cash flows: plain XIRR, the monthly SIP
/// simulation and the daily since-inception return series.
pub struct ReturnsService {
    max_iterations: u32,
    tolerance: f64,
    max_lookback_days: i64,
    warmup_months: u32,
}

impl ReturnsService {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            max_iterations: settings.xirr_max_iterations,
            tolerance: settings.xirr_tolerance,
            max_lookback_days: settings.max_price_lookback_days,
            warmup_months: settings.return_warmup_months,
        }
    }

    // ── XIRR ─────────────────────────────────────────────────────────

    /// Annualized rate `r` such that Σ amount / (1 + r)^(days / 365) = 0,
    /// with days counted from the earliest flow.
    ///
    /// Newton–Raphson from `r = 0`, falling back to bisection over
    /// [-0.999999, 100] when Newton stalls or leaves the domain. The result is
    /// always finite; anything else is a `ConvergenceFailure`.
    pub fn xirr(&self, flows: &[CashFlow]) -> Result<f64, CoreError> {
        validate_flows(flows)?;

        let base = flows.iter().map(|f| f.date).min().unwrap_or(flows[0].date);
        let points: Vec<(f64, f64)> = flows
            .iter()
            .map(|f| ((f.date - base).num_days() as f64 / DAYS_PER_YEAR, f.amount))
            .collect();
        // NPV is compared against a tolerance relative to the flow sizes
        let scale = points.iter().map(|(_, a)| a.abs()).sum::<f64>().max(1.0);
        let tolerance = self.tolerance * scale;

        if let Some(rate) = self.newton(&points, tolerance) {
            return Ok(rate);
        }
        tracing::debug!(flows = flows.len(), "Newton did not converge, bisecting");
        self.bisect(&points, tolerance)
    }

    /// XIRR of `cash_flows` plus `terminal_value` received on `terminal_date`.
    pub fn rate_of_return(
        &self,
        cash_flows: &[CashFlow],
        terminal_value: f64,
        terminal_date: NaiveDate,
    ) -> Result<f64, CoreError> {
        let mut flows = Vec::with_capacity(cash_flows.len() + 1);
        flows.extend_from_slice(cash_flows);
        flows.push(CashFlow::new(terminal_value, terminal_date));
        self.xirr(&flows)
    }

    fn newton(&self, points: &[(f64, f64)], tolerance: f64) -> Option<f64> {
        let mut rate = 0.0;
        for _ in 0..self.max_iterations {
            let (value, derivative) = npv_with_derivative(points, rate)?;
            if value.abs() < tolerance {
                return Some(rate);
            }
            if derivative == 0.0 || !derivative.is_finite() {
                return None;
            }
            let next = (rate - value / derivative).clamp(MIN_RATE, MAX_RATE);
            if !next.is_finite() {
                return None;
            }
            rate = next;
        }
        None
    }

    fn bisect(&self, points: &[(f64, f64)], tolerance: f64) -> Result<f64, CoreError> {
        let failure = |iterations: u32, residual: f64| CoreError::ConvergenceFailure {
            iterations,
            residual: if residual.is_finite() { residual } else { f64::MAX },
        };

        let (mut low, mut high) = (MIN_RATE, MAX_RATE);
        let mut npv_low = npv(points, low);
        let npv_high = npv(points, high);
        if !npv_low.is_finite() || !npv_high.is_finite() || npv_low.signum() == npv_high.signum() {
            return Err(failure(self.max_iterations, npv_low.abs().min(npv_high.abs())));
        }

        // Bisection halves the bracket each step; 200 steps exhaust f64 precision
        let max_steps = self.max_iterations.max(200);
        let mut residual = f64::MAX;
        for _ in 0..max_steps {
            let mid = (low + high) / 2.0;
            let value = npv(points, mid);
            residual = value.abs();
            if residual < tolerance || (high - low) < MIN_BRACKET_WIDTH {
                return Ok(mid);
            }
            if value.signum() == npv_low.signum() {
                low = mid;
                npv_low = value;
            } else {
                high = mid;
            }
        }
        Err(failure(max_steps, residual))
    }

    // ── SIP simulation ───────────────────────────────────────────────

    /// Simulate a monthly investment plan in one instrument.
    pub async fn simulate_sip(
        &self,
        request: &SipRequest,
        cache: &MarketDataCache,
    ) -> Result<SipReport, CoreError> {
        validate_sip(request)?;
        let series = cache.series(&request.instrument_id).await?;
        self.simulate_sip_on(request, &series)
    }

    /// `simulate_sip` against an already-loaded series.
    ///
    /// Instalment `k` falls on `start + k months` (day clamped to month end)
    /// and the amount grows by `annual_step_up_pct` after every 12
    /// instalments. Each sub-period's XIRR uses every instalment so far as an
    /// outflow and the current holding value as the terminal inflow; a
    /// sub-period where the solver fails keeps `xirr_pct = None` and stays
    /// out of the bucket distribution.
    pub fn simulate_sip_on(
        &self,
        request: &SipRequest,
        series: &PriceSeries,
    ) -> Result<SipReport, CoreError> {
        validate_sip(request)?;

        let mut sub_periods = Vec::new();
        let mut flows: Vec<CashFlow> = Vec::new();
        let mut amount = request.monthly_amount;
        let mut units = 0.0;
        let mut total_investment = 0.0;

        let mut k = 0u32;
        while let Some(date) = add_months(request.start_date, k) {
            if date > request.end_date {
                break;
            }
            if k > 0 && k % 12 == 0 {
                amount *= 1.0 + request.annual_step_up_pct / 100.0;
            }

            let close = series
                .resolve_close(date, self.max_lookback_days)
                .ok_or_else(|| CoreError::price_unavailable(&request.instrument_id, date))?
                .close;
            units += amount / close;
            total_investment += amount;
            flows.push(CashFlow::new(-amount, date));

            let end_value = units * close;
            let xirr_pct = match self.rate_of_return(&flows, end_value, date) {
                Ok(rate) => Some(round2(rate * 100.0)),
                Err(e) => {
                    tracing::warn!(instrument = %request.instrument_id, %date, error = %e, "SIP sub-period return undefined");
                    None
                }
            };

            sub_periods.push(SipSubPeriod {
                date,
                buy_price: close,
                instalment: round2(amount),
                units,
                total_investment: round2(total_investment),
                end_value: round2(end_value),
                xirr_pct,
            });
            k += 1;
        }

        let end_close = series
            .resolve_close(request.end_date, self.max_lookback_days)
            .ok_or_else(|| CoreError::price_unavailable(&request.instrument_id, request.end_date))?
            .close;
        let overall_xirr_pct = self
            .rate_of_return(&flows, units * end_close, request.end_date)
            .ok()
            .map(|rate| round2(rate * 100.0));

        tracing::info!(
            instrument = %request.instrument_id,
            periods = sub_periods.len(),
            "SIP simulation complete"
        );

        Ok(SipReport {
            buckets: bucket_distribution(&sub_periods),
            sub_periods,
            overall_xirr_pct,
        })
    }

    // ── Return series ────────────────────────────────────────────────

    /// Daily since-inception XIRR of the tracked holdings and of the same
    /// capital put into the benchmark.
    pub async fn return_series(
        &self,
        holdings: &Holdings,
        benchmark_id: &str,
        cache: &MarketDataCache,
        today: NaiveDate,
    ) -> Result<ReturnSeries, CoreError> {
        if holdings.tracked.is_empty() {
            return Ok(ReturnSeries::default());
        }
        let mut ids = holdings.instrument_ids();
        ids.push(benchmark_id.to_string());
        let snapshot = cache.snapshot(&ids).await?;
        self.return_series_from_snapshot(holdings, benchmark_id, &snapshot, today)
    }

    /// `return_series` against already-loaded series.
    ///
    /// On each day, holdings bought so far contribute an outflow at their
    /// transaction date; the terminal inflow is their forward-filled value
    /// that day. Days within `warmup_months` of the first buy, and days where
    /// either solve fails, are left out.
    pub fn return_series_from_snapshot(
        &self,
        holdings: &Holdings,
        benchmark_id: &str,
        snapshot: &PriceSnapshot,
        today: NaiveDate,
    ) -> Result<ReturnSeries, CoreError> {
        let mut ordered: Vec<&Holding> = holdings.tracked.iter().collect();
        ordered.sort_by_key(|h| h.transaction_date);

        let Some(first) = ordered.first().map(|h| h.transaction_date) else {
            return Ok(ReturnSeries::default());
        };
        let Some(from) = add_months(first, self.warmup_months) else {
            return Ok(ReturnSeries::default());
        };

        let benchmark = lookup(snapshot, benchmark_id);
        let mut positions = Vec::with_capacity(ordered.len());
        for &h in &ordered {
            if h.transaction_date > today {
                continue;
            }
            let bm_close = benchmark
                .resolve_close(h.transaction_date, self.max_lookback_days)
                .ok_or_else(|| CoreError::price_unavailable(benchmark_id, h.transaction_date))?;
            positions.push(TrackedPosition {
                holding: h,
                series: lookup(snapshot, &h.instrument_id),
                benchmark_units: h.acquisition_value() / bm_close.close,
            });
        }

        let mut out = ReturnSeries::default();
        let mut flows: Vec<CashFlow> = Vec::with_capacity(positions.len() + 1);
        let mut active = 0;
        let mut last_benchmark_close = 0.0;

        for day in days_inclusive(first, today) {
            while active < positions.len() && positions[active].holding.transaction_date <= day {
                let h = positions[active].holding;
                flows.push(CashFlow::new(-h.acquisition_value(), h.transaction_date));
                active += 1;
            }
            if let Some(p) = benchmark.resolve_close(day, self.max_lookback_days) {
                last_benchmark_close = p.close;
            }
            if day < from {
                continue;
            }

            let mut market_value = 0.0;
            let mut benchmark_value = 0.0;
            for position in &positions[..active] {
                let close = position
                    .series
                    .resolve_close(day, self.max_lookback_days)
                    .ok_or_else(|| CoreError::price_unavailable(&position.holding.instrument_id, day))?;
                market_value += position.holding.quantity * close.close;
                benchmark_value += position.benchmark_units * last_benchmark_close;
            }

            let portfolio = self.rate_of_return(&flows, market_value, day);
            let relative = self.rate_of_return(&flows, benchmark_value, day);
            if let (Ok(p), Ok(b)) = (portfolio, relative) {
                out.portfolio.insert(day, round2(p * 100.0));
                out.benchmark.insert(day, round2(b * 100.0));
            }
        }

        tracing::debug!(days = out.portfolio.len(), "Computed daily return series");
        Ok(out)
    }
}

impl Default for ReturnsService {
    fn default() -> Self {
        Self::new(&EngineSettings::default())
    }
}

struct TrackedPosition<'a> {
    holding: &'a Holding,
    series: Arc<PriceSeries>,
    benchmark_units: f64,
}

fn lookup(snapshot: &PriceSnapshot, instrument_id: &str) -> Arc<PriceSeries> {
    snapshot
        .get(instrument_id)
        .cloned()
        .unwrap_or_else(|| Arc::new(PriceSeries::empty(instrument_id)))
}

fn validate_flows(flows: &[CashFlow]) -> Result<(), CoreError> {
    if flows.len() < 2 {
        return Err(CoreError::ValidationError(
            "Rate of return needs at least two cash flows".into(),
        ));
    }
    if flows.iter().any(|f| !f.amount.is_finite()) {
        return Err(CoreError::ValidationError("Cash flow amounts must be finite".into()));
    }
    let has_outflow = flows.iter().any(|f| f.amount < 0.0);
    let has_inflow = flows.iter().any(|f| f.amount > 0.0);
    if !(has_outflow && has_inflow) {
        return Err(CoreError::ValidationError(
            "Rate of return needs both a negative and a positive cash flow".into(),
        ));
    }
    Ok(())
}

fn validate_sip(request: &SipRequest) -> Result<(), CoreError> {
    if request.start_date > request.end_date {
        return Err(CoreError::ValidationError(format!(
            "SIP start date ({}) must not be after end date ({})",
            request.start_date, request.end_date
        )));
    }
    if !(request.monthly_amount.is_finite() && request.monthly_amount > 0.0) {
        return Err(CoreError::ValidationError(format!(
            "SIP monthly amount must be positive, got {}",
            request.monthly_amount
        )));
    }
    if !request.annual_step_up_pct.is_finite() || request.annual_step_up_pct < 0.0 {
        return Err(CoreError::ValidationError(format!(
            "SIP step-up must be non-negative, got {}",
            request.annual_step_up_pct
        )));
    }
    Ok(())
}

fn npv(points: &[(f64, f64)], rate: f64) -> f64 {
    let base = 1.0 + rate;
    points.iter().map(|(years, amount)| amount / base.powf(*years)).sum()
}

/// NPV and its derivative with respect to the rate. `None` outside the domain.
fn npv_with_derivative(points: &[(f64, f64)], rate: f64) -> Option<(f64, f64)> {
    let base = 1.0 + rate;
    if base <= 0.0 {
        return None;
    }
    let mut value = 0.0;
    let mut derivative = 0.0;
    for (years, amount) in points {
        let discount = base.powf(*years);
        value += amount / discount;
        derivative -= years * amount / (discount * base);
    }
    value.is_finite().then_some((value, derivative))
}

/// Share of sub-periods per return range, over periods with a defined XIRR.
fn bucket_distribution(sub_periods: &[SipSubPeriod]) -> ReturnBuckets {
    let rates: Vec<f64> = sub_periods.iter().filter_map(|p| p.xirr_pct).collect();
    let mut buckets = ReturnBuckets::default();
    if rates.is_empty() {
        return buckets;
    }

    let share = 100.0 / rates.len() as f64;
    for rate in rates {
        let slot = match rate {
            r if r <= 0.0 => &mut buckets.less_than_zero,
            r if r <= 2.5 => &mut buckets.zero_to_two_and_half,
            r if r <= 5.0 => &mut buckets.two_and_half_to_five,
            r if r <= 7.5 => &mut buckets.five_to_seven_and_half,
            r if r <= 10.0 => &mut buckets.seven_and_half_to_ten,
            _ => &mut buckets.greater_than_ten,
        };
        *slot += share;
    }
    buckets
}
