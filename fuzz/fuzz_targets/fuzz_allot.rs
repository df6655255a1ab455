#![no_main]

use libfuzzer_sys::fuzz_target;
use rotor_core::gc::GcOp;
use rotor_core::objects::cell::{Cell, DATA_ALIGNMENT};
use rotor_core::vm::{Vm, VmConfig};

fuzz_target!(|data: &[u8]| {
    // Each pair of bytes encodes one array allocation request; sizes
    // are capped so single requests cannot dwarf the test heap.
    const MAX_ELEMENTS: usize = 4096;

    if data.len() < 2 {
        return;
    }

    let mut vm = Vm::new(VmConfig {
        young_size: 64 << 10,
        aging_size: 64 << 10,
        tenured_size: 4 << 20,
        code_size: 64 << 10,
        datastack_size: 64 << 10,
        retainstack_size: 64 << 10,
        callstack_size: 64 << 10,
    });

    let mut chunk = data;
    let mut alloc_count = 0usize;
    while chunk.len() >= 2 {
        let requested = ((chunk[0] as usize) << 8) | chunk[1] as usize;
        let elements = requested % MAX_ELEMENTS;
        chunk = &chunk[2..];

        let array = vm.allot_array(elements, Cell::FALSE);
        assert_eq!(
            array.untagged() as usize % DATA_ALIGNMENT,
            0,
            "allocated object must be data-aligned"
        );
        alloc_count += 1;

        // Periodically force explicit collections so escalation paths
        // run, not just the bump allocator.
        if alloc_count % 64 == 0 {
            vm.gc(GcOp::Nursery, 0);
            assert_eq!(
                vm.data.nursery.occupied_space(),
                0,
                "nursery must be empty after a minor collection"
            );
        }
    }

    // Final full collection leaves a consistent heap.
    vm.gc(GcOp::Full, 0);
    assert_eq!(vm.data.nursery.occupied_space(), 0);
    assert_eq!(vm.data.aging.allocator.occupied_space(), 0);
});
