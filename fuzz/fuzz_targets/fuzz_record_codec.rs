#![no_main]

use bucketdb_core::record;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 1_000_000 {
        return;
    }

    // Decoding never panics, and whatever decodes re-encodes to the same bytes
    if let Ok(view) = record::decode(data) {
        assert_eq!(record::encode(&view.meta, view.value), data);
    }
});
