//! Post-processing of a stage's results directory
//!
//! - `extract`: best pass of one candidate run
//! - `summary`: IS/OOS comparison table of every candidate
//! - `top`: best inputs of the top-N candidates

pub mod extract;
pub mod summary;
pub mod top;

pub use extract::{best_pass, extract, extract_mode};
pub use summary::{update as update_summary, StageSummaryRow, SummaryTable};
pub use top::{extract_top, TopParameterSet};
