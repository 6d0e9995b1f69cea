pub mod traits;

// Feed implementations
pub mod yahoo_csv;
