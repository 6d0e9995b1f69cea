use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// Engine tunables. Loaded by the caller (env, file, flags) and handed to
/// `PortfolioTracker`; every field has a default so partial JSON works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Instrument id of the index every holding is compared against.
    pub benchmark_id: String,

    /// How far back (calendar days) a missing close may be forward-filled from.
    pub max_price_lookback_days: i64,

    /// Months after the first buy excluded from the daily return series
    /// (returns over a few weeks annualize to meaningless numbers).
    pub return_warmup_months: u32,

    /// Pause between two price downloads, in milliseconds.
    pub download_delay_ms: u64,

    /// Iteration cap for the rate-of-return solver.
    pub xirr_max_iterations: u32,

    /// Convergence threshold relative to the flow sizes: the solver stops once
    /// |NPV| < `xirr_tolerance` × max(1, Σ|amount|).
    pub xirr_tolerance: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            benchmark_id: "BSE-500".to_string(),
            max_price_lookback_days: 365,
            return_warmup_months: 6,
            download_delay_ms: 2000,
            xirr_max_iterations: 100,
            xirr_tolerance: 1e-7,
        }
    }
}

impl EngineSettings {
    /// Parse settings from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.benchmark_id.trim().is_empty() {
            return Err(CoreError::InvalidConfig("benchmark_id must not be empty".into()));
        }
        if self.max_price_lookback_days < 0 {
            return Err(CoreError::InvalidConfig(format!(
                "max_price_lookback_days must be >= 0, got {}",
                self.max_price_lookback_days
            )));
        }
        if self.xirr_max_iterations == 0 {
            return Err(CoreError::InvalidConfig("xirr_max_iterations must be > 0".into()));
        }
        if !(self.xirr_tolerance.is_finite() && self.xirr_tolerance > 0.0) {
            return Err(CoreError::InvalidConfig(format!(
                "xirr_tolerance must be a positive number, got {}",
                self.xirr_tolerance
            )));
        }
        Ok(())
    }
}
