//! Order identifiers and derived record identifiers.
//!
//! An order is keyed by its `order_uid`. Owned records (delivery, payment,
//! items) are keyed by `<natural-id>_<order_uid>` so that two orders reusing
//! the same natural sub-identifier never collide in the store.

use uuid::Uuid;

/// Errors that can occur when validating an order identifier.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderUidError {
    /// The identifier is empty.
    #[error("order_uid cannot be empty")]
    Empty,
    /// The identifier is too long.
    #[error("order_uid must be at most {max} characters")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
    },
    /// The identifier contains whitespace or control characters.
    #[error("order_uid must not contain whitespace or control characters")]
    InvalidCharacter,
}

/// Maximum length of an order identifier.
pub const MAX_ORDER_UID_LENGTH: usize = 128;

/// Validate an order identifier.
///
/// # Errors
///
/// Returns an error if the identifier:
/// - Is empty
/// - Is longer than 128 characters
/// - Contains whitespace or control characters
///
/// # Examples
///
/// ```
/// use orderflow_core::validate_order_uid;
///
/// assert!(validate_order_uid("b563feb7b2b84b6test").is_ok());
/// assert!(validate_order_uid("").is_err());
/// assert!(validate_order_uid("has space").is_err());
/// ```
pub fn validate_order_uid(uid: &str) -> Result<(), OrderUidError> {
    if uid.is_empty() {
        return Err(OrderUidError::Empty);
    }

    if uid.len() > MAX_ORDER_UID_LENGTH {
        return Err(OrderUidError::TooLong {
            max: MAX_ORDER_UID_LENGTH,
        });
    }

    if uid.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(OrderUidError::InvalidCharacter);
    }

    Ok(())
}

/// Generate a fresh order identifier (32 lowercase hex characters).
#[must_use]
pub fn generate_order_uid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Derive the stored identifier of an owned record.
///
/// Uses `natural` when present, otherwise `fallback`, and appends the owning
/// order's identifier. An identifier that already carries the `_<order_uid>`
/// suffix is returned unchanged, so re-submitting a previously read order
/// yields the same record identifiers.
///
/// # Examples
///
/// ```
/// use orderflow_core::derive_record_id;
///
/// assert_eq!(derive_record_id("it1", "0", "order123"), "it1_order123");
/// assert_eq!(derive_record_id("", "0", "order123"), "0_order123");
/// assert_eq!(derive_record_id("it1_order123", "0", "order123"), "it1_order123");
/// ```
#[must_use]
pub fn derive_record_id(natural: &str, fallback: &str, order_uid: &str) -> String {
    let base = if natural.is_empty() { fallback } else { natural };

    if let Some(prefix) = base.strip_suffix(order_uid)
        && prefix.len() > 1
        && prefix.ends_with('_')
    {
        return base.to_owned();
    }

    format!("{base}_{order_uid}")
}
