pub mod app;
pub mod clients;
pub mod config;
pub mod ledger;
pub mod rollout;
pub mod runtime;
pub mod shared;
