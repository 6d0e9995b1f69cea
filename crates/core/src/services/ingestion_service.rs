use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinSet};

use crate::errors::CoreError;
use crate::models::price::PricePoint;
use crate::providers::traits::PriceFeed;
use crate::services::market_cache::MarketDataCache;
use crate::storage::traits::PriceHistoryStore;
use crate::utils::{parse_amount, parse_date};

/// Width of the provider's daily history file: Date, Open, High, Low, Close,
/// Adj Close, Volume. Used to locate columns when the header row is unusable.
const HISTORY_COLUMNS: usize = 7;

/// One instrument to refresh, with the first date to download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentLoad {
    pub instrument_id: String,
    pub from: NaiveDate,
}

impl InstrumentLoad {
    pub fn new(instrument_id: impl Into<String>, from: NaiveDate) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            from,
        }
    }
}

/// Outcome of one `refresh` run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshSummary {
    /// Instruments whose file was downloaded and stored
    pub loaded: Vec<String>,
    /// Instruments that failed at download, parse or upsert
    pub failed: Vec<String>,
    /// Rows written to the store across all instruments
    pub records_loaded: usize,
    /// Malformed or empty rows dropped while parsing
    pub rows_skipped: usize,
}

/// Rows parsed from one history file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPrices {
    pub points: Vec<PricePoint>,
    pub skipped: usize,
}

/// Parse a daily history CSV into price points.
///
/// Columns are found by their `Date` / `Close` headers. A malformed row
/// (provider writes `null` on halted days) is skipped and counted, never
/// fatal; only an unreadable file fails.
pub fn parse_price_csv(instrument_id: &str, text: &str) -> Result<ParsedPrices, CoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();
    let (date_idx, close_idx) = locate_columns(&headers)?;

    let mut parsed = ParsedPrices::default();
    for result in reader.records() {
        let record = result?;
        let date = record.get(date_idx).unwrap_or("");
        let close = record.get(close_idx).unwrap_or("");

        match (parse_date("Date", date), parse_amount("Close", close)) {
            (Ok(date), Ok(close)) => parsed.points.push(PricePoint::new(date, close)),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(instrument = instrument_id, error = %e, "Skipping price row");
                parsed.skipped += 1;
            }
        }
    }
    Ok(parsed)
}

fn locate_columns(headers: &csv::StringRecord) -> Result<(usize, usize), CoreError> {
    let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    match (find("Date"), find("Close")) {
        (Some(date), Some(close)) => Ok((date, close)),
        _ if headers.len() >= HISTORY_COLUMNS => {
            let n = headers.len();
            Ok((n - HISTORY_COLUMNS, n - 3))
        }
        _ => Err(CoreError::Csv(
            "price file has no Date/Close columns".to_string(),
        )),
    }
}

/// Bulk price refresh: throttled downloads, concurrent load, cache reset.
pub struct IngestionService {
    download_delay: Duration,
}

impl IngestionService {
    pub fn new(download_delay: Duration) -> Self {
        Self { download_delay }
    }

    /// Download and store history for every request, up to `to`.
    ///
    /// 1. Downloads run one at a time with `download_delay` between them
    ///    (the provider rejects bursts).
    /// 2. Each downloaded file is parsed and upserted on its own task; all
    ///    tasks are joined before moving on.
    /// 3. The cache is reset so the next read sees the new rows.
    ///
    /// A failing instrument is logged and reported in `failed`; it does not
    /// stop the others, even when its load task panics.
    pub async fn refresh(
        &self,
        feed: &dyn PriceFeed,
        store: Arc<dyn PriceHistoryStore>,
        cache: &MarketDataCache,
        requests: &[InstrumentLoad],
        to: NaiveDate,
    ) -> Result<RefreshSummary, CoreError> {
        let mut summary = RefreshSummary::default();

        // Stage 1: sequential downloads
        let mut files = Vec::with_capacity(requests.len());
        for (i, request) in requests.iter().enumerate() {
            if i > 0 && !self.download_delay.is_zero() {
                tokio::time::sleep(self.download_delay).await;
            }
            match feed.download_history(&request.instrument_id, request.from, to).await {
                Ok(text) => files.push((request.instrument_id.clone(), text)),
                Err(e) => {
                    tracing::warn!(
                        instrument = %request.instrument_id,
                        feed = feed.name(),
                        error = %e,
                        "Price download failed"
                    );
                    summary.failed.push(request.instrument_id.clone());
                }
            }
        }
        tracing::info!(files = files.len(), failed = summary.failed.len(), "Price downloads finished");

        // Stage 2: parse and upsert per instrument
        let mut tasks = JoinSet::new();
        let mut task_instruments: HashMap<task::Id, String> = HashMap::new();
        for (instrument_id, text) in files {
            let store = Arc::clone(&store);
            let id = instrument_id.clone();
            let handle = tasks.spawn(async move {
                load_file(store.as_ref(), &instrument_id, &text).await
            });
            task_instruments.insert(handle.id(), id);
        }
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((task_id, Ok((written, skipped)))) => {
                    summary.records_loaded += written;
                    summary.rows_skipped += skipped;
                    if let Some(instrument_id) = task_instruments.remove(&task_id) {
                        summary.loaded.push(instrument_id);
                    }
                }
                Ok((task_id, Err(e))) => {
                    let instrument_id = task_instruments.remove(&task_id).unwrap_or_default();
                    tracing::warn!(instrument = %instrument_id, error = %e, "Price load failed");
                    summary.failed.push(instrument_id);
                }
                Err(join_error) => {
                    let instrument_id =
                        task_instruments.remove(&join_error.id()).unwrap_or_default();
                    tracing::error!(instrument = %instrument_id, error = %join_error, "Price load task died");
                    summary.failed.push(instrument_id);
                }
            }
        }
        summary.loaded.sort();
        summary.failed.sort();

        // Stage 3
        cache.reset();
        tracing::info!(
            loaded = summary.loaded.len(),
            failed = summary.failed.len(),
            records = summary.records_loaded,
            "Price refresh complete"
        );
        Ok(summary)
    }
}

impl Default for IngestionService {
    fn default() -> Self {
        Self::new(Duration::from_millis(2000))
    }
}

async fn load_file(
    store: &dyn PriceHistoryStore,
    instrument_id: &str,
    text: &str,
) -> Result<(usize, usize), CoreError> {
    let parsed = parse_price_csv(instrument_id, text)?;
    let written = store.upsert_prices(instrument_id, &parsed.points).await?;
    Ok((written, parsed.skipped))
}
