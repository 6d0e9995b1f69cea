use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Date-indexed values. Serializes as a JSON object keyed by `YYYY-MM-DD`.
pub type DailySeries = BTreeMap<NaiveDate, f64>;

/// Day-by-day reconstruction of a portfolio.
///
/// All series cover the same contiguous calendar range, except `allocation`,
/// which skips days where net worth is zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetWorthSeries {
    /// equity + debt
    #[serde(rename = "networth")]
    pub net_worth: DailySeries,

    /// Market value of tracked holdings
    pub equity: DailySeries,

    /// Value of non-tracked assets
    pub debt: DailySeries,

    /// Value the same capital would have if it had bought the benchmark
    pub benchmark: DailySeries,

    /// Acquisition value of the tracked holdings held on each day
    pub invested: DailySeries,

    /// equity / net worth × 100
    pub allocation: DailySeries,
}

impl NetWorthSeries {
    pub fn is_empty(&self) -> bool {
        self.net_worth.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.net_worth.keys().next().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.net_worth.keys().next_back().copied()
    }

    /// Net worth on a given day, if the day is covered.
    pub fn net_worth_on(&self, date: NaiveDate) -> Option<f64> {
        self.net_worth.get(&date).copied()
    }
}
