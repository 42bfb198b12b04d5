//! Pricefeed Library
//!
//! Exchange price ingestion, authoritative median cache and submission guard
//! for an oracle reporter node

pub mod app;
pub mod config;
pub mod health;
pub mod median;
pub mod pricefeed;
pub mod reporter;
pub mod server;
pub mod time;
pub mod types;
