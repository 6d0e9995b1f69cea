pub mod analytics;
pub mod holding;
pub mod model_portfolio;
pub mod price;
pub mod returns;
pub mod series;
pub mod settings;
