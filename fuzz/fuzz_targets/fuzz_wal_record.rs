#![no_main]

use bucketdb_wal::{Frame, WalRecord};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 1_000_000 {
        return;
    }

    // Walk the input frame by frame; decoding must never panic
    let mut rest = data;
    while let Ok(Frame::Complete(_, used)) = WalRecord::decode(rest) {
        if used == 0 || used > rest.len() {
            break;
        }
        rest = &rest[used..];
    }
});
