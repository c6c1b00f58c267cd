//! Orderflow server library.
//!
//! Ingests orders from a durable message stream, persists them transactionally
//! in `PostgreSQL` and serves them over HTTP from a read-through cache.
//!
//! # Architecture
//!
//! - [`stream`] - Durable message log with consumer-group offsets
//! - [`consumer`] - Long-running ingestion worker
//! - [`db`] - Order store trait and its `PostgreSQL` implementation
//! - [`cache`] - In-memory order cache
//! - [`service`] - Read-through/write-through policy over store and cache
//! - [`routes`] - Axum HTTP API

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod cache;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod routes;
pub mod service;
pub mod state;
pub mod stream;
