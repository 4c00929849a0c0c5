//! Strata operator: wiring for the DataCluster controller binary

pub mod config;
pub mod controller_runner;
