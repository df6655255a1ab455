//! Value representation and heap object model.

/// Minimal bignum digit codec for overflow promotion.
pub mod bignum;
/// The tagged machine-word [`cell::Cell`].
pub mod cell;
/// Object headers: live / forwarded / free-block union.
pub mod header;
/// Concrete object kinds, size/slot tables, and structural equality.
pub mod kinds;
