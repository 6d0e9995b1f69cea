use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::series::DailySeries;

/// A dated cash flow. Negative = money in (investment), positive = money out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CashFlow {
    pub amount: f64,
    pub date: NaiveDate,
}

impl CashFlow {
    pub fn new(amount: f64, date: NaiveDate) -> Self {
        Self { amount, date }
    }
}

/// Parameters of a systematic monthly investment simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipRequest {
    pub instrument_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub monthly_amount: f64,
    /// Increase of the monthly amount applied after every 12 instalments, in percent
    #[serde(default)]
    pub annual_step_up_pct: f64,
}

/// State of the simulation right after one monthly instalment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipSubPeriod {
    /// Instalment date
    pub date: NaiveDate,

    /// Close the instalment bought at (forward-filled on non-trading days)
    pub buy_price: f64,

    /// Amount invested in this instalment
    pub instalment: f64,

    /// Cumulative units held
    pub units: f64,

    /// Cumulative amount invested
    pub total_investment: f64,

    /// units × buy_price
    pub end_value: f64,

    /// Annualized return to this date in percent, `None` if the solver failed
    pub xirr_pct: Option<f64>,
}

/// Share of sub-periods falling into each annualized-return range, in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReturnBuckets {
    /// xirr ≤ 0%
    pub less_than_zero: f64,
    /// 0% < xirr ≤ 2.5%
    pub zero_to_two_and_half: f64,
    /// 2.5% < xirr ≤ 5%
    pub two_and_half_to_five: f64,
    /// 5% < xirr ≤ 7.5%
    pub five_to_seven_and_half: f64,
    /// 7.5% < xirr ≤ 10%
    pub seven_and_half_to_ten: f64,
    /// xirr > 10%
    pub greater_than_ten: f64,
}

impl ReturnBuckets {
    pub fn total(&self) -> f64 {
        self.less_than_zero
            + self.zero_to_two_and_half
            + self.two_and_half_to_five
            + self.five_to_seven_and_half
            + self.seven_and_half_to_ten
            + self.greater_than_ten
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipReport {
    pub sub_periods: Vec<SipSubPeriod>,
    pub buckets: ReturnBuckets,
    /// XIRR of the whole plan valued at the end date, in percent
    pub overall_xirr_pct: Option<f64>,
}

/// Annualized return since inception, day by day, in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReturnSeries {
    #[serde(rename = "portfolioReturn")]
    pub portfolio: DailySeries,
    #[serde(rename = "benchmarkReturn")]
    pub benchmark: DailySeries,
}
