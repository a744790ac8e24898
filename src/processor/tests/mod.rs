//! Integration tests for the processor module
//!
//! Runs the complete pipeline over temporary station directories holding
//! small minute-resolution CSV exports.

pub mod fixtures;
