//! Common test utilities for qualer-dl integration tests

#[allow(dead_code)]
pub mod config;
#[allow(dead_code)]
pub mod tenant;

#[allow(unused_imports)]
pub use config::*;
#[allow(unused_imports)]
pub use tenant::*;
