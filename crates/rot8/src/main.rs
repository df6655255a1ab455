//! `rot8` — Rotor VM shell.
//!
//! Builds a VM from command-line switches and hands control to
//! `start_standalone`.  Loading a boot image is the job of an external
//! loader; until one is wired in, `rot8` starts an empty VM, which
//! reports the missing boot contract and exits non-zero.
//!
//! Recognized switches (sizes in bytes):
//!
//! ```text
//! -young=N -aging=N -tenured=N -codeheap=N
//! -datastack=N -retainstack=N -callstack=N
//! -e=EXPR   evaluate EXPR after startup (needs an eval callback)
//! -v        verbose collector logging
//! ```

use rotor_core::vm::{Vm, VmConfig};

fn parse_size(value: &str, out: &mut usize) {
    if let Ok(parsed) = value.parse::<usize>() {
        *out = parsed;
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let level = if args.iter().any(|a| a == "-v") {
        log::Level::Debug
    } else {
        log::Level::Warn
    };
    simple_logger::init_with_level(level).expect("logger init");

    let mut config = VmConfig::default();
    for arg in &args {
        if let Some((switch, value)) = arg.split_once('=') {
            match switch {
                "-young" => parse_size(value, &mut config.young_size),
                "-aging" => parse_size(value, &mut config.aging_size),
                "-tenured" => parse_size(value, &mut config.tenured_size),
                "-codeheap" => parse_size(value, &mut config.code_size),
                "-datastack" => parse_size(value, &mut config.datastack_size),
                "-retainstack" => parse_size(value, &mut config.retainstack_size),
                "-callstack" => parse_size(value, &mut config.callstack_size),
                _ => {}
            }
        }
    }

    let mut vm = Vm::new(config);
    match vm.start_standalone(&args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("rot8: {err}");
            std::process::exit(1);
        }
    }
}
