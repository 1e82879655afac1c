//! Isolation Integration Tests
//!
//! Serializability of the three transaction kinds through the public
//! `Database` API.

#[path = "../common/mod.rs"]
mod common;

mod long_transactions;
mod read_only;
mod short_transactions;
mod stress;
