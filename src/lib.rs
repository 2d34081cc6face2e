//! Payment orchestration core for a multi-seller marketplace: the
//! transaction ledger, provider adapters, webhook reconciliation,
//! subscription billing and seller payouts.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
