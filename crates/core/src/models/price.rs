use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// A single daily close (date → price).
///
/// `close == 0.0` marks a day without a valid trade and is never used as a value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: f64,
}

impl PricePoint {
    pub fn new(date: NaiveDate, close: f64) -> Self {
        Self { date, close }
    }

    /// True if this point carries a real trade price.
    pub fn is_traded(&self) -> bool {
        self.close > 0.0 && self.close.is_finite()
    }
}

/// Complete daily close history of one instrument, sorted by date.
///
/// Built once per cache fill and then shared read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub instrument_id: String,
    points: Vec<PricePoint>,
}

impl PriceSeries {
    /// Build a series from unordered points. Duplicate dates keep the last point given.
    pub fn new(instrument_id: impl Into<String>, mut points: Vec<PricePoint>) -> Self {
        points.sort_by_key(|p| p.date);
        let mut deduped: Vec<PricePoint> = Vec::with_capacity(points.len());
        for point in points {
            match deduped.last_mut() {
                Some(last) if last.date == point.date => *last = point,
                _ => deduped.push(point),
            }
        }
        Self {
            instrument_id: instrument_id.into(),
            points: deduped,
        }
    }

    pub fn empty(instrument_id: impl Into<String>) -> Self {
        Self::new(instrument_id, Vec::new())
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// First date the instrument has any row (its listing date as far as we know).
    pub fn first_date(&self) -> Option<NaiveDate> {
        self.points.first().map(|p| p.date)
    }

    /// Exact close recorded on `date`, zero included. O(log n).
    pub fn close_on(&self, date: NaiveDate) -> Option<f64> {
        self.points
            .binary_search_by_key(&date, |p| p.date)
            .ok()
            .map(|idx| self.points[idx].close)
    }

    /// Nearest non-zero close on or before `date`, looking back at most
    /// `max_lookback_days` calendar days and never before the first listed date.
    ///
    /// Returns the date the close was actually recorded on together with the close.
    pub fn resolve_close(&self, date: NaiveDate, max_lookback_days: i64) -> Option<PricePoint> {
        let listed = self.first_date()?;
        // A horizon reaching past the calendar's start is bounded by the listing date
        let floor = u64::try_from(max_lookback_days.max(0))
            .ok()
            .and_then(|days| date.checked_sub_days(Days::new(days)))
            .map_or(listed, |horizon| horizon.max(listed));

        // Index of the first point strictly after `date`
        let end = self.points.partition_point(|p| p.date <= date);
        self.points[..end]
            .iter()
            .rev()
            .take_while(|p| p.date >= floor)
            .find(|p| p.is_traded())
            .copied()
    }

    /// Most recent non-zero close.
    pub fn latest(&self) -> Option<PricePoint> {
        self.points.iter().rev().find(|p| p.is_traded()).copied()
    }

    /// Maximum close ever recorded.
    pub fn all_time_high(&self) -> Option<f64> {
        self.points
            .iter()
            .filter(|p| p.is_traded())
            .map(|p| p.close)
            .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.max(c))))
    }
}
