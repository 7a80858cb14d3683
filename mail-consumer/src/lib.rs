pub mod broker;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod mail;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod report;
pub mod service;
pub mod shutdown;
pub mod test_utils;
pub mod transport;
