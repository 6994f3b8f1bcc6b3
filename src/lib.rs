pub mod adapter;
pub mod audit;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod operation;
pub mod reconcile;
pub mod response;
pub mod status;
pub mod store;
pub mod types;
pub mod utils;
