use std::io::Write;

use fpspy_trace::{RECORD_SIZE, Trace, TraceRecord};

fn sample_record(n: u64) -> TraceRecord {
    let mut r = TraceRecord::abort_marker(0);
    r.time = n * 100;
    r.rip = 0x401000 + n;
    r.rsp = 0x7ffd_0000;
    r.code = 3; // FPE_FLTDIV
    r.mxcsr = 0x1f80;
    let mut instr = [0u8; 15];
    instr[..3].copy_from_slice(&[0xf2, 0x0f, 0x5e]); // divsd prefix+opcode
    r.instruction = instr;
    r.pad = 0;
    r
}

#[test]
fn empty_file_yields_empty_trace() {
    let f = tempfile::NamedTempFile::new().unwrap();
    let t = Trace::attach(f.path()).unwrap();
    assert!(t.records().is_empty());
    assert!(!t.truncated());
}

#[test]
fn whole_records_then_abort_marker() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(sample_record(1).as_bytes()).unwrap();
    f.write_all(sample_record(2).as_bytes()).unwrap();
    f.write_all(TraceRecord::abort_marker(777).as_bytes()).unwrap();
    f.flush().unwrap();

    let t = Trace::attach(f.path()).unwrap();
    assert_eq!(t.records().len(), 3);
    assert!(!t.records()[0].is_abort());
    assert_eq!({ t.records()[1].rip }, 0x401002);
    assert!(t.records()[2].is_abort());
    assert_eq!({ t.records()[2].time }, 777);
}

#[test]
fn truncated_final_record_is_dropped() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(sample_record(1).as_bytes()).unwrap();
    f.write_all(&sample_record(2).as_bytes()[..RECORD_SIZE / 2]).unwrap();
    f.flush().unwrap();

    let t = Trace::attach(f.path()).unwrap();
    assert_eq!(t.records().len(), 1);
    assert!(t.truncated());
    assert_eq!({ t.records()[0].time }, 100);
}
