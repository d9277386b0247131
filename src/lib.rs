pub mod backtester;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod context;
pub mod data_context;
pub mod database;
pub mod engine;
pub mod error;
pub mod models;
pub mod performance;
mod retry;
pub mod scorer;
pub mod signals;
pub mod store;
