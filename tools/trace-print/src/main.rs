use std::process::ExitCode;

use fpspy_trace::{Trace, code_mnemonic};

fn main() -> ExitCode {
    let Some(path) = std::env::args().nth(1) else {
        eprintln!("trace_print <individual trace file>");
        return ExitCode::FAILURE;
    };

    let trace = match Trace::attach(&path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to read {path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    if trace.truncated() {
        eprintln!("warning: {path} ends mid-record; final record dropped");
    }

    for r in trace.records() {
        print!(
            "{:<16}\t{}\t{:016x}\t{:016x}\t{:08x}\t{:08x}\t",
            { r.time },
            code_mnemonic(r.code),
            { r.rip },
            { r.rsp },
            { r.code },
            { r.mxcsr },
        );
        for b in { r.instruction } {
            print!("{b:02x}");
        }
        println!();
    }

    ExitCode::SUCCESS
}
