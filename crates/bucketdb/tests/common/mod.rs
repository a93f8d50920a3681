// Common test utilities for store integration tests

use bucketdb::{DataKey, EngineKind, InstanceManager, RecordMeta, StoreConfig};
use tempfile::TempDir;

/// Test fixture owning a temporary data directory
pub struct StoreFixture {
    pub temp_dir: TempDir,
    pub engine: EngineKind,
}

impl StoreFixture {
    pub fn new(engine: EngineKind) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        Self { temp_dir, engine }
    }

    pub fn config(&self) -> StoreConfig {
        StoreConfig::new(self.temp_dir.path(), self.engine)
    }

    /// Opens a manager over the fixture directory serving `buckets`.
    pub fn open(&self, buckets: &[u32]) -> InstanceManager {
        self.open_with(self.config(), buckets)
    }

    pub fn open_with(&self, config: StoreConfig, buckets: &[u32]) -> InstanceManager {
        let manager = InstanceManager::open(config).expect("Failed to open manager");
        manager
            .init_buckets(buckets)
            .expect("Failed to init buckets");
        manager
    }
}

/// Both engines, for tests whose behaviour must not depend on the backend
pub fn all_engines() -> [EngineKind; 2] {
    [EngineKind::Hash, EngineKind::Lsm]
}

/// Key carrying metadata that expired long ago; stored verbatim by a put
/// without version care.
#[allow(dead_code)]
pub fn expired_key(area: u16, key: &str) -> DataKey {
    DataKey::new(area, key).with_meta(RecordMeta {
        version: 5,
        create_time: 100,
        modify_time: 100,
        expire_time: 200,
    })
}
