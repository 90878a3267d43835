//! Token metering and per-phase budget discipline.
//!
//! [`meter::TokenMeter`] estimates token counts with an optional tokenizer
//! seam; [`monitor::BudgetMonitor`] turns budget profiles into absolute
//! allocations and classifies usage into the smart/dumb/critical zones.

pub mod meter;
pub mod monitor;

pub use meter::{Estimator, TokenCount, TokenMeter, Tokenizer};
pub use monitor::{BudgetCheck, BudgetMonitor, BudgetZone};
