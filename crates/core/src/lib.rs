//! Orderflow Core - Shared order types.
//!
//! This crate provides the order domain model used across all Orderflow components:
//! - `server` - Stream consumer, order store, cache and HTTP API
//! - `cli` - Migrations and stream publishing tools
//!
//! # Architecture
//!
//! The core crate contains only types and pure functions - no I/O, no database
//! access, no message transport. The JSON shape defined here is shared by the
//! HTTP API and the ingestion stream payload.
//!
//! # Modules
//!
//! - [`types`] - The `Order` aggregate, its owned records, and identifier helpers

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
