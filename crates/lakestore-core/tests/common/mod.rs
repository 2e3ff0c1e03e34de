use lakestore_core::{EngineConfig, Store};
use tokio_util::sync::CancellationToken;

pub fn temp_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().to_str().unwrap()).unwrap();
    (store, dir)
}

#[allow(dead_code)]
pub fn temp_store_with(config: EngineConfig) -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::with_config(dir.path().to_str().unwrap(), config).unwrap();
    (store, dir)
}

pub fn cx() -> CancellationToken {
    CancellationToken::new()
}
