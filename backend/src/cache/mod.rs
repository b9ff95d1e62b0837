//! In-memory stores

pub mod build_logs;
pub mod status;
