//! Sizing logic: indicators, candidate generation, and risk-bounded share counts.

mod config;
mod error;
pub mod indicators;
mod position_sizer;

pub use config::SizerConfig;
pub use error::SizingError;
pub use position_sizer::PositionSizer;
