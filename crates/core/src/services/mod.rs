pub mod ingestion_service;
pub mod market_cache;
pub mod rebalance_service;
pub mod returns_service;
pub mod timeseries_service;
pub mod valuation_service;
