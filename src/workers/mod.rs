//! Background workers. Each one loops until its shutdown channel flips to
//! `true`.

pub mod billing_cycle;
pub mod reconciliation_sweep;

pub use billing_cycle::BillingCycleWorker;
pub use reconciliation_sweep::ReconciliationSweepWorker;
