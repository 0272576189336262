//! OFFERSCAN: rate-governed featured-offer scanning and repricing engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod error;
pub mod types;
pub mod platforms;
pub mod strategy;
pub mod engine;
pub mod storage;
pub mod admin;
