//! swapcycle: custodial swap-cycle service.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod wallet;
pub mod chain;
pub mod swap;
pub mod market;
pub mod storage;
pub mod engine;
pub mod api;
