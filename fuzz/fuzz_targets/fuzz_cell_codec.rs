#![no_main]

use libfuzzer_sys::fuzz_target;
use rotor_core::objects::cell::{Cell, TypeCode, DATA_ALIGNMENT, FIXNUM_MAX, FIXNUM_MIN};

fuzz_target!(|data: &[u8]| {
    // We need at least 1 byte to drive the test.
    if data.is_empty() {
        return;
    }

    // First byte picks the operation; the rest is a raw word payload.
    let op = data[0];
    let mut raw = [0u8; 8];
    let payload = &data[1..];
    let copy_len = payload.len().min(8);
    raw[..copy_len].copy_from_slice(&payload[..copy_len]);
    let bits = u64::from_le_bytes(raw);

    if op & 1 == 0 {
        // Fixnum round-trip over the whole representable range.
        let n = (bits as isize).clamp(FIXNUM_MIN, FIXNUM_MAX);
        let cell = Cell::from_fixnum(n);
        assert!(cell.is_fixnum(), "expected a fixnum tag");
        assert!(cell.is_immediate());
        assert!(cell.to_boolean(), "no fixnum is false");
        assert_eq!(cell.to_fixnum(), n, "fixnum round-trip mismatch");
    } else {
        // Typed pointer encoding: manufacture an aligned, non-null
        // address and verify the tag/mask logic without dereferencing.
        let addr = (bits as usize & !(DATA_ALIGNMENT - 1)).max(DATA_ALIGNMENT);
        let type_code = match op >> 1 & 3 {
            0 => TypeCode::Array,
            1 => TypeCode::String,
            2 => TypeCode::Word,
            _ => TypeCode::Tuple,
        };
        // SAFETY: the cell is only inspected, never dereferenced.
        let cell = unsafe { Cell::from_object(addr as *mut _, type_code) };
        assert!(!cell.is_immediate());
        assert_eq!(cell.type_code(), type_code);
        assert_eq!(cell.untagged() as usize, addr, "address must round-trip");
        assert_eq!(cell.retag(cell.untagged()), cell);
    }
});
