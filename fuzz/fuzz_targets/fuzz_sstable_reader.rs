#![no_main]

use bucketdb_engine::sstable::TableReader;
use libfuzzer_sys::fuzz_target;
use std::io::Write;

fuzz_target!(|data: &[u8]| {
    if data.len() > 10_000_000 {
        return;
    }

    if let Ok(mut temp_file) = tempfile::NamedTempFile::new() {
        if temp_file.write_all(data).is_ok() {
            if let Ok(mut reader) = TableReader::open(temp_file.path()) {
                let _ = reader.get(b"key");
            }
        }
    }
});
