use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};

use crate::errors::CoreError;
use crate::models::analytics::{HoldingReport, HoldingsReport, Valuation};
use crate::models::holding::{Holding, Holdings};
use crate::models::price::PricePoint;
use crate::services::market_cache::MarketDataCache;
use crate::utils::round2;

/// Values a holdings set at current prices: net worth, equity/debt split,
/// and per-position reports.
///
/// Tracked holdings are valued at the latest non-zero close; non-tracked
/// assets at their manually supplied current value.
pub struct ValuationService;

impl ValuationService {
    pub fn new() -> Self {
        Self
    }

    /// Current net worth and equity/debt allocation.
    ///
    /// Fails with `PriceUnavailable` if any tracked instrument has never traded
    /// and with `DivisionByZero` if a non-empty portfolio is worth exactly zero.
    pub async fn valuate(
        &self,
        holdings: &Holdings,
        cache: &MarketDataCache,
    ) -> Result<Valuation, CoreError> {
        let latest = cache.latest_many(holdings.instrument_ids()).await?;
        self.valuate_with_prices(holdings, &latest)
    }

    /// Same as `valuate`, against already-resolved latest prices.
    pub fn valuate_with_prices(
        &self,
        holdings: &Holdings,
        latest: &HashMap<String, PricePoint>,
    ) -> Result<Valuation, CoreError> {
        if holdings.is_empty() {
            return Ok(Valuation::default());
        }

        let mut equity_value = 0.0;
        for holding in &holdings.tracked {
            let close = latest_close(latest, &holding.instrument_id)?;
            equity_value += holding.quantity * close;
        }
        let debt_value: f64 = holdings.non_tracked.iter().map(|a| a.current_value).sum();
        let net_worth = equity_value + debt_value;

        if net_worth == 0.0 {
            return Err(CoreError::DivisionByZero("allocation of a zero net worth".into()));
        }

        Ok(Valuation {
            net_worth: round2(net_worth),
            equity_value: round2(equity_value),
            debt_value: round2(debt_value),
            equity_pct: equity_value / net_worth * 100.0,
            debt_pct: debt_value / net_worth * 100.0,
        })
    }

    /// Holdings valued at the latest traded price.
    ///
    /// With `aggregate`, transactions of the same instrument are folded into a
    /// single position (see `aggregate_positions`); otherwise one row per transaction.
    pub async fn holdings_report(
        &self,
        holdings: &Holdings,
        cache: &MarketDataCache,
        aggregate: bool,
    ) -> Result<HoldingsReport, CoreError> {
        let latest = cache.latest_many(holdings.instrument_ids()).await?;
        let valuation = self.valuate_with_prices(holdings, &latest)?;

        let positions = if aggregate {
            aggregate_positions(&holdings.tracked)
        } else {
            holdings.tracked.iter().map(Position::from_holding).collect()
        };

        let mut rows = Vec::with_capacity(positions.len());
        for position in positions {
            let close = latest_close(&latest, &position.instrument_id)?;
            rows.push(position.report(close));
        }

        Ok(HoldingsReport {
            holdings: rows,
            non_tracked: holdings.non_tracked.clone(),
            valuation,
        })
    }

    /// "What if": aggregated holdings valued at each instrument's all-time high.
    ///
    /// Only tracked holdings take part; net worth is Σ quantity × ATH and
    /// non-tracked assets are left out of the valuation.
    pub async fn all_time_high_report(
        &self,
        holdings: &Holdings,
        cache: &MarketDataCache,
    ) -> Result<HoldingsReport, CoreError> {
        let mut rows = Vec::new();
        let mut net_worth = 0.0;

        for position in aggregate_positions(&holdings.tracked) {
            let ath = cache
                .all_time_high(&position.instrument_id)
                .await?
                .ok_or_else(|| CoreError::PriceUnavailable {
                    instrument: position.instrument_id.clone(),
                    date: "all time".into(),
                })?;
            let row = position.report(ath);
            net_worth += row.current_value;
            rows.push(row);
        }

        let valuation = if rows.is_empty() {
            Valuation::default()
        } else {
            Valuation {
                net_worth: round2(net_worth),
                equity_value: round2(net_worth),
                debt_value: 0.0,
                equity_pct: 100.0,
                debt_pct: 0.0,
            }
        };

        Ok(HoldingsReport {
            holdings: rows,
            non_tracked: Vec::new(),
            valuation,
        })
    }
}

impl Default for ValuationService {
    fn default() -> Self {
        Self::new()
    }
}

fn latest_close(latest: &HashMap<String, PricePoint>, instrument_id: &str) -> Result<f64, CoreError> {
    latest
        .get(instrument_id)
        .filter(|p| p.is_traded())
        .map(|p| p.close)
        .ok_or_else(|| CoreError::PriceUnavailable {
            instrument: instrument_id.to_string(),
            date: "latest".into(),
        })
}

/// Net position in one instrument, before pricing.
#[derive(Debug, Clone, PartialEq)]
struct Position {
    instrument_id: String,
    quantity: f64,
    buy_price: f64,
    last_transaction: NaiveDate,
}

impl Position {
    fn from_holding(h: &Holding) -> Self {
        Self {
            instrument_id: h.instrument_id.clone(),
            quantity: h.quantity,
            buy_price: h.transaction_price,
            last_transaction: h.transaction_date,
        }
    }

    fn report(&self, reference_price: f64) -> HoldingReport {
        let cost = self.quantity * self.buy_price;
        let current_value = self.quantity * reference_price;
        let profit_loss = current_value - cost;
        let net_pct = if cost != 0.0 {
            profit_loss / cost * 100.0
        } else {
            0.0
        };
        HoldingReport {
            instrument_id: self.instrument_id.clone(),
            quantity: self.quantity,
            buy_price: round2(self.buy_price),
            transaction_date: self.last_transaction,
            reference_price: round2(reference_price),
            current_value: round2(current_value),
            profit_loss: round2(profit_loss),
            net_pct: round2(net_pct),
        }
    }
}

/// Fold transactions per instrument, in date order.
///
/// A buy moves the average buy price to the quantity-weighted average; a sell
/// reduces quantity at the unchanged average price. Output is sorted by id.
fn aggregate_positions(tracked: &[Holding]) -> Vec<Position> {
    let mut ordered: Vec<&Holding> = tracked.iter().collect();
    ordered.sort_by_key(|h| h.transaction_date);

    let mut positions: BTreeMap<&str, Position> = BTreeMap::new();
    for h in ordered {
        match positions.get_mut(h.instrument_id.as_str()) {
            None => {
                positions.insert(h.instrument_id.as_str(), Position::from_holding(h));
            }
            Some(pos) => {
                let quantity = pos.quantity + h.quantity;
                if h.quantity > 0.0 && quantity != 0.0 {
                    let cost = pos.quantity * pos.buy_price + h.quantity * h.transaction_price;
                    pos.buy_price = cost / quantity;
                }
                pos.quantity = quantity;
                pos.last_transaction = h.transaction_date;
            }
        }
    }
    positions.into_values().collect()
}
