//! Validator watch: snapshot cache, lookup and delta alerting for a
//! validator set.
//!
//! The binary wires these together; the modules are public so command
//! front-ends can reuse the cache, resolver and store.

pub mod config;
pub mod dashboard;
pub mod detector;
pub mod engine;
pub mod lookup;
pub mod metrics;
pub mod notify;
pub mod resolver;
pub mod snapshot;
pub mod store;
