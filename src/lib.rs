//! Optiforge Library
//!
//! Multi-stage in-sample / out-of-sample optimisation driver for
//! MetaTrader 5 expert advisors

pub mod config;
pub mod error;
pub mod indicators;
pub mod persistence;
pub mod render;
pub mod reports;
pub mod results;
pub mod run_config;
pub mod scaling;
pub mod stage;
pub mod terminal;
pub mod types;
pub mod upstream;

pub use error::PipelineError;
