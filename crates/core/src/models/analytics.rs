use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::holding::NonTrackedAsset;

/// Net worth of a holdings set and its equity/debt split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Valuation {
    /// equity_value + debt_value
    pub net_worth: f64,

    /// Σ quantity × latest close over tracked holdings
    pub equity_value: f64,

    /// Σ current value over non-tracked assets
    pub debt_value: f64,

    /// equity_value / net_worth × 100
    pub equity_pct: f64,

    /// debt_value / net_worth × 100
    pub debt_pct: f64,
}

/// One tracked position (a single transaction, or all transactions of an
/// instrument when aggregated) valued at a reference price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingReport {
    pub instrument_id: String,

    /// Net quantity held
    pub quantity: f64,

    /// Transaction price, or weighted average buy price when aggregated
    pub buy_price: f64,

    /// Date of the (last) transaction
    pub transaction_date: NaiveDate,

    /// Reference price: latest traded price, or the all-time high for ATH reports
    pub reference_price: f64,

    /// quantity × reference_price
    pub current_value: f64,

    /// current_value − quantity × buy_price
    pub profit_loss: f64,

    /// profit_loss / (quantity × buy_price) × 100, zero when nothing is invested
    pub net_pct: f64,
}

/// Caller-facing holdings view: per-position valuation plus totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HoldingsReport {
    pub holdings: Vec<HoldingReport>,
    pub non_tracked: Vec<NonTrackedAsset>,
    pub valuation: Valuation,
}
