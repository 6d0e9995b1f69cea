use thiserror::Error;

/// Unified error type for the entire networth-core library.
/// Every public function returns `Result<T, CoreError>`.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Parsing ─────────────────────────────────────────────────────
    #[error("Cannot parse {field} from '{value}'")]
    ParseError { field: String, value: String },

    #[error("CSV error: {0}")]
    Csv(String),

    // ── Pricing / Math ──────────────────────────────────────────────
    #[error("No price available for {instrument} on or before {date}")]
    PriceUnavailable { instrument: String, date: String },

    #[error("Division by zero while computing {0}")]
    DivisionByZero(String),

    #[error("Rate of return did not converge after {iterations} iterations (residual {residual:e})")]
    ConvergenceFailure { iterations: u32, residual: f64 },

    // ── Business Logic ──────────────────────────────────────────────
    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Collaborators ───────────────────────────────────────────────
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("API error ({provider}): {message}")]
    Api {
        provider: String,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(String),
}

impl CoreError {
    /// Coarse message safe to show to an end user.
    /// The full error stays available through `Display` for diagnostics.
    pub fn user_message(&self) -> &'static str {
        match self {
            CoreError::ParseError { .. } | CoreError::Csv(_) => {
                "Holding or price data is malformed"
            }
            CoreError::PriceUnavailable { .. } => "Price data is not available for a holding",
            CoreError::DivisionByZero(_) => "Portfolio value is zero, percentages are undefined",
            CoreError::ConvergenceFailure { .. } => "Return could not be calculated",
            CoreError::ValidationError(_) => "Request is invalid",
            CoreError::UserNotFound(_) => "Please provide a valid user id",
            CoreError::InvalidConfig(_) => "Engine is misconfigured",
            CoreError::Storage(_) => "Portfolio data could not be loaded",
            CoreError::Api { .. } | CoreError::Network(_) => "Price provider is unavailable",
        }
    }

    pub(crate) fn parse(field: &str, value: &str) -> Self {
        CoreError::ParseError {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub(crate) fn price_unavailable(instrument: &str, date: chrono::NaiveDate) -> Self {
        CoreError::PriceUnavailable {
            instrument: instrument.to_string(),
            date: date.to_string(),
        }
    }
}

// ── Conversion helpers (From impls) ─────────────────────────────────

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::InvalidConfig(e.to_string())
    }
}

impl From<csv::Error> for CoreError {
    fn from(e: csv::Error) -> Self {
        CoreError::Csv(e.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        // Strip query parameters from URLs: they carry the requested time window
        // and occasionally credentials.
        let msg = e.to_string();
        let sanitized = if let Some(idx) = msg.find('?') {
            format!("{}?<query redacted>", &msg[..idx])
        } else {
            msg
        };
        CoreError::Network(sanitized)
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        CoreError::Storage(format!("Background task failed: {e}"))
    }
}
