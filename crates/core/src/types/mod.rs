//! Core types for Orderflow.
//!
//! This module provides the order aggregate and the identifier rules that
//! tie its owned records together.

pub mod id;
pub mod order;

pub use id::{OrderUidError, derive_record_id, generate_order_uid, validate_order_uid};
pub use order::{Delivery, DecodeError, Item, Order, Payment};
