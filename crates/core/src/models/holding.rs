use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::utils::{parse_amount, parse_date};

/// Security id given to the synthetic non-tracked entry created by a sell.
pub const CASH_SECURITY_ID: &str = "CASH";

/// A single buy (positive quantity) or sell (negative quantity) transaction
/// in a tracked instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub instrument_id: String,
    pub quantity: f64,
    pub transaction_date: NaiveDate,
    pub transaction_price: f64,
}

impl Holding {
    pub fn new(
        instrument_id: impl Into<String>,
        quantity: f64,
        transaction_date: NaiveDate,
        transaction_price: f64,
    ) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            quantity,
            transaction_date,
            transaction_price,
        }
    }

    /// Capital put in (or, for a sell, taken out) by this transaction.
    pub fn acquisition_value(&self) -> f64 {
        self.quantity * self.transaction_price
    }

    pub fn is_sell(&self) -> bool {
        self.quantity < 0.0
    }

    /// The synthetic CASH asset a sell turns into, or `None` for a buy.
    pub fn cash_from_sell(&self) -> Option<NonTrackedAsset> {
        if !self.is_sell() {
            return None;
        }
        let value = -self.quantity * self.transaction_price;
        Some(NonTrackedAsset {
            security_id: CASH_SECURITY_ID.to_string(),
            buy_date: self.transaction_date,
            buy_value: value,
            current_value: value,
            interest_rate: 0.0,
        })
    }
}

/// An asset with no price series (deposits, bonds, cash). Valued at the
/// manually supplied `current_value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonTrackedAsset {
    pub security_id: String,
    pub buy_date: NaiveDate,
    pub buy_value: f64,
    pub current_value: f64,
    pub interest_rate: f64,
}

/// A user's typed holdings: tracked transactions plus non-tracked assets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Holdings {
    pub tracked: Vec<Holding>,
    pub non_tracked: Vec<NonTrackedAsset>,
}

impl Holdings {
    pub fn new(tracked: Vec<Holding>, non_tracked: Vec<NonTrackedAsset>) -> Self {
        Self {
            tracked,
            non_tracked,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty() && self.non_tracked.is_empty()
    }

    /// Parse string-typed store records. Any malformed field fails the whole set:
    /// a partially parsed portfolio would silently corrupt every series built on it.
    pub fn from_raw(raw: &RawHoldings) -> Result<Self, CoreError> {
        let tracked = raw
            .holdings
            .iter()
            .map(RawHolding::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let non_tracked = raw
            .non_tracked
            .iter()
            .map(RawNonTrackedAsset::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(tracked, non_tracked))
    }

    /// Append a CASH asset for every sell. Call once, when the sells are recorded.
    /// Returns how many were added.
    pub fn convert_sells_to_cash(&mut self) -> usize {
        let cash: Vec<NonTrackedAsset> = self
            .tracked
            .iter()
            .filter_map(Holding::cash_from_sell)
            .collect();
        let added = cash.len();
        self.non_tracked.extend(cash);
        added
    }

    /// Σ tracked acquisition value (sells count negative).
    pub fn invested_in_tracked(&self) -> f64 {
        self.tracked.iter().map(Holding::acquisition_value).sum()
    }

    /// Tracked invested capital plus non-tracked buy value.
    ///
    /// A sell followed by `convert_sells_to_cash` leaves this where it was
    /// before the sell: the tracked side drops by the proceeds and the CASH
    /// asset adds them back.
    pub fn total_accounted_capital(&self) -> f64 {
        self.invested_in_tracked() + self.non_tracked.iter().map(|a| a.buy_value).sum::<f64>()
    }

    /// Tracked transactions for one instrument.
    pub fn for_instrument<'a>(&'a self, instrument_id: &'a str) -> impl Iterator<Item = &'a Holding> {
        self.tracked
            .iter()
            .filter(move |h| h.instrument_id == instrument_id)
    }

    /// Distinct tracked instrument ids, sorted.
    pub fn instrument_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tracked.iter().map(|h| h.instrument_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Earliest transaction or buy date across both kinds of holding.
    pub fn earliest_date(&self) -> Option<NaiveDate> {
        let tracked = self.tracked.iter().map(|h| h.transaction_date);
        let non_tracked = self.non_tracked.iter().map(|a| a.buy_date);
        tracked.chain(non_tracked).min()
    }
}

// ── Raw store records ───────────────────────────────────────────────

/// Tracked holding as stored: every numeric/date field is text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawHolding {
    #[serde(rename = "companyid")]
    pub instrument_id: String,
    pub quantity: String,
    #[serde(rename = "buyDate")]
    pub transaction_date: String,
    #[serde(rename = "buyPrice")]
    pub transaction_price: String,
}

impl RawHolding {
    pub fn parse(&self) -> Result<Holding, CoreError> {
        let instrument_id = self.instrument_id.trim();
        if instrument_id.is_empty() {
            return Err(CoreError::parse("instrument id", &self.instrument_id));
        }
        Ok(Holding {
            instrument_id: instrument_id.to_string(),
            quantity: parse_amount("quantity", &self.quantity)?,
            transaction_date: parse_date("transaction date", &self.transaction_date)?,
            transaction_price: parse_amount("transaction price", &self.transaction_price)?,
        })
    }
}

impl From<&Holding> for RawHolding {
    fn from(h: &Holding) -> Self {
        Self {
            instrument_id: h.instrument_id.clone(),
            quantity: h.quantity.to_string(),
            transaction_date: h.transaction_date.format("%Y-%m-%d").to_string(),
            transaction_price: h.transaction_price.to_string(),
        }
    }
}

/// Non-tracked asset as stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawNonTrackedAsset {
    #[serde(rename = "securityid")]
    pub security_id: String,
    #[serde(rename = "buyDate")]
    pub buy_date: String,
    #[serde(rename = "buyValue")]
    pub buy_value: String,
    #[serde(rename = "currentValue")]
    pub current_value: String,
    #[serde(rename = "interestRate", default)]
    pub interest_rate: String,
}

impl RawNonTrackedAsset {
    pub fn parse(&self) -> Result<NonTrackedAsset, CoreError> {
        // Interest rate is informational; an empty field means none.
        let interest_rate = if self.interest_rate.trim().is_empty() {
            0.0
        } else {
            parse_amount("interest rate", &self.interest_rate)?
        };
        Ok(NonTrackedAsset {
            security_id: self.security_id.trim().to_string(),
            buy_date: parse_date("buy date", &self.buy_date)?,
            buy_value: parse_amount("buy value", &self.buy_value)?,
            current_value: parse_amount("current value", &self.current_value)?,
            interest_rate,
        })
    }
}

impl From<&NonTrackedAsset> for RawNonTrackedAsset {
    fn from(a: &NonTrackedAsset) -> Self {
        Self {
            security_id: a.security_id.clone(),
            buy_date: a.buy_date.format("%Y-%m-%d").to_string(),
            buy_value: format!("{:.2}", a.buy_value),
            current_value: format!("{:.2}", a.current_value),
            interest_rate: a.interest_rate.to_string(),
        }
    }
}

/// Everything the holdings store returns for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawHoldings {
    #[serde(rename = "Holdings", default)]
    pub holdings: Vec<RawHolding>,
    #[serde(rename = "HoldingsNonTracked", default)]
    pub non_tracked: Vec<RawNonTrackedAsset>,
}

impl From<&Holdings> for RawHoldings {
    fn from(h: &Holdings) -> Self {
        Self {
            holdings: h.tracked.iter().map(RawHolding::from).collect(),
            non_tracked: h.non_tracked.iter().map(RawNonTrackedAsset::from).collect(),
        }
    }
}
