pub mod analysis;
pub mod backtest;
pub mod calibration;
pub mod config;
pub mod consensus;
pub mod ensemble;
pub mod error;
pub mod export;
pub mod feature_table;
pub mod gbdt;
pub mod reports;
pub mod season;
pub mod seasonal_accuracy;
pub mod simulation;
pub mod training;
