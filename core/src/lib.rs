//! Money Pulse transaction and loan processing core.

pub mod aml_scorer;
pub mod amortization;
pub mod clock;
pub mod command;
pub mod component;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod ledger;
pub mod loan_amortizer;
pub mod money;
pub mod position_keeper;
pub mod retry;
pub mod rng;
pub mod store;
pub mod transaction_engine;
pub mod types;
