use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// Target weight and valuation threshold for one instrument in the user's
/// model portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTarget {
    pub instrument_id: String,
    /// Share of the target amount this instrument should hold, in percent
    pub target_allocation_pct: f64,
    /// Price below which the instrument counts as attractively valued
    pub reasonable_price: f64,
}

impl ModelTarget {
    pub fn new(
        instrument_id: impl Into<String>,
        target_allocation_pct: f64,
        reasonable_price: f64,
    ) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            target_allocation_pct,
            reasonable_price,
        }
    }
}

/// A user's full model portfolio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPortfolio {
    pub targets: Vec<ModelTarget>,
    /// Total amount the allocations are computed against
    pub target_amount: f64,
}

impl ModelPortfolio {
    /// Reject negative weights, non-positive reasonable prices and weights
    /// summing above 100%.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.target_amount.is_finite() || self.target_amount < 0.0 {
            return Err(CoreError::ValidationError(format!(
                "Target amount must be non-negative, got {}",
                self.target_amount
            )));
        }
        let mut total = 0.0;
        for target in &self.targets {
            if !(0.0..=100.0).contains(&target.target_allocation_pct) {
                return Err(CoreError::ValidationError(format!(
                    "Allocation for {} must be between 0 and 100, got {}",
                    target.instrument_id, target.target_allocation_pct
                )));
            }
            if target.reasonable_price <= 0.0 {
                return Err(CoreError::ValidationError(format!(
                    "Reasonable price for {} must be positive",
                    target.instrument_id
                )));
            }
            total += target.target_allocation_pct;
        }
        // Small slack for weights like 33.33 + 33.33 + 33.34 typed by hand
        if total > 100.0 + 1e-6 {
            return Err(CoreError::ValidationError(format!(
                "Target allocations sum to {total:.2}%, more than 100%"
            )));
        }
        Ok(())
    }
}

/// How far actual investment in one instrument is from its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceAdjustment {
    pub instrument_id: String,

    /// target_allocation_pct / 100 × total target amount
    pub desired_amount: f64,

    /// Σ quantity × transaction price over the instrument's transactions
    pub invested_amount: f64,

    /// desired − invested. Positive means buy more, negative means reduce.
    pub adjusted_amount: f64,

    pub latest_price: f64,

    pub reasonable_price: f64,

    /// (reasonable − latest) / reasonable × 100
    pub percent_below_reasonable: f64,

    pub below_reasonable_price: bool,
}
