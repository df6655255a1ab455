//! Criterion benchmarks for core VM operations.
//!
//! Run with: `cargo bench --package rotor_core`

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use rotor_core::objects::cell::Cell;
use rotor_core::vm::{SpecialObject, Vm, VmConfig};

// ---------------------------------------------------------------------------
// Tagged cell codec
// ---------------------------------------------------------------------------

fn bench_cell_fixnum_round_trip(c: &mut Criterion) {
    c.bench_function("cell_fixnum_round_trip", |b| {
        b.iter(|| {
            let cell = Cell::from_fixnum(black_box(42));
            black_box(cell.is_fixnum());
            black_box(cell.to_fixnum());
        });
    });
}

// ---------------------------------------------------------------------------
// Allocation throughput
// ---------------------------------------------------------------------------

const BURST_ALLOC_COUNT: usize = 1000;

fn bench_nursery_allot_burst(c: &mut Criterion) {
    c.bench_function("nursery_allot_burst_1000", |b| {
        // The VM lives across iterations; implicit minor collections
        // reclaim the dead bursts.
        let mut vm = Vm::new(VmConfig::default());
        b.iter(|| {
            for _ in 0..BURST_ALLOC_COUNT {
                black_box(vm.allot_array(8, Cell::FALSE));
            }
        });
    });
}

// ---------------------------------------------------------------------------
// Trampoline dispatch
// ---------------------------------------------------------------------------

fn bench_trampoline_fixnum_add(c: &mut Criterion) {
    c.bench_function("trampoline_fixnum_add", |b| {
        let mut vm = Vm::new(VmConfig::default());
        // Minimal boot: the arithmetic handlers only need `t`.
        let name = vm.allot_string_from("t");
        let t = vm.allot_word(name);
        vm.set_special(SpecialObject::CanonicalTrue, t);
        let name = vm.allot_string_from("+");
        let plus = vm.allot_word(name);

        vm.dpush(Cell::from_fixnum(0)).unwrap();
        b.iter(|| {
            vm.dpush(Cell::from_fixnum(1)).unwrap();
            vm.call_callable(black_box(plus));
        });
    });
}

criterion_group!(
    benches,
    bench_cell_fixnum_round_trip,
    bench_nursery_allot_burst,
    bench_trampoline_fixnum_add,
);
criterion_main!(benches);
