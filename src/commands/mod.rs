pub mod backtest;
pub mod catalog;
pub mod export_market_data;
pub mod history;
pub mod score;
