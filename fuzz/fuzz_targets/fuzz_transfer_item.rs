#![no_main]

use bucketdb_core::TransferItem;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 1_000_000 {
        return;
    }

    if let Ok(items) = TransferItem::decode_all(data) {
        let mut buf = Vec::with_capacity(data.len());
        for item in &items {
            item.encode_into(&mut buf);
        }
        assert_eq!(buf, data);
    }
});
