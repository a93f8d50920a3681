#![no_main]

use arbitrary::Arbitrary;
use bucketdb::{DataKey, EngineKind, InstanceManager, StoreConfig};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum StoreOp {
    Put { bucket: u8, area: u8, key: Vec<u8>, value: Vec<u8>, version: u8, care: bool },
    Get { bucket: u8, area: u8, key: Vec<u8> },
    Remove { bucket: u8, area: u8, key: Vec<u8>, care: bool },
    Clear { area: u8 },
    Scan { bucket: u8 },
}

fuzz_target!(|ops: Vec<StoreOp>| {
    let Ok(dir) = tempfile::TempDir::new() else {
        return;
    };
    let mut config = StoreConfig::new(dir.path(), EngineKind::Lsm);
    config.instance_count = 2;
    let Ok(manager) = InstanceManager::open(config) else {
        return;
    };
    if manager.init_buckets(&[0, 1, 2, 3]).is_err() {
        return;
    }

    for op in ops.iter().take(100) {
        match op {
            StoreOp::Put { bucket, area, key, value, version, care } => {
                if key.len() <= 1024 && value.len() <= 1024 {
                    let key = DataKey::new(*area as u16, key.clone()).with_version(*version as u32);
                    let _ = manager.put(*bucket as u32 % 5, &key, value, *care, 0);
                }
            }
            StoreOp::Get { bucket, area, key } => {
                let _ = manager.get(*bucket as u32 % 5, &DataKey::new(*area as u16, key.clone()));
            }
            StoreOp::Remove { bucket, area, key, care } => {
                let key = DataKey::new(*area as u16, key.clone());
                let _ = manager.remove(*bucket as u32 % 5, &key, *care);
            }
            StoreOp::Clear { area } => {
                let _ = manager.clear(*area as u16);
            }
            StoreOp::Scan { bucket } => {
                if manager.begin_scan(*bucket as u32 % 5).is_ok() {
                    let mut buf = Vec::new();
                    let _ = manager.get_next_items(&mut buf, 16);
                    let _ = manager.end_scan();
                }
            }
        }
    }
    let _ = manager.close();
});
