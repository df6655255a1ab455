//! Minimal bignum support for fixnum overflow promotion.
//!
//! Fixnum `+`, `-`, `*` and `shift` can overflow the 60-bit immediate
//! range; the interpreter then boxes the exact result as a heap bignum.
//! Only what the handlers and `equal?` need is implemented: conversion
//! from a 128-bit intermediate, conversion back when the value fits,
//! and digit comparison.

/// Sign/magnitude split of an `i128` into machine-word digits,
/// least-significant first.  Zero has no digits and a positive sign.
pub fn digits_of(n: i128) -> (bool, Vec<usize>) {
    let negative = n < 0;
    let mut magnitude = n.unsigned_abs();
    let mut digits = Vec::new();
    while magnitude != 0 {
        digits.push(magnitude as usize);
        magnitude >>= usize::BITS;
    }
    (negative, digits)
}

/// Reassemble a sign/digit pair into an `i128`, if it fits.
pub fn to_i128(negative: bool, digits: &[usize]) -> Option<i128> {
    let mut magnitude: u128 = 0;
    for (i, &d) in digits.iter().enumerate() {
        let shift = (i as u32).checked_mul(usize::BITS)?;
        if shift >= u128::BITS {
            return None;
        }
        magnitude |= (d as u128) << shift;
    }
    if negative {
        if magnitude > i128::MIN.unsigned_abs() {
            return None;
        }
        Some((magnitude as i128).wrapping_neg())
    } else {
        if magnitude > i128::MAX as u128 {
            return None;
        }
        Some(magnitude as i128)
    }
}
