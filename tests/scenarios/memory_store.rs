use std::sync::Arc;
use std::time::Duration;

use kv_structure::ConfigurationError;
use kv_structure::Error;
use kv_structure::MemoryStore;
use kv_structure::Pipeline;
use kv_structure::PipelineState;
use kv_structure::TreeDecoder;
use kv_structure::WatchConfig;
use kv_structure::Watcher;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::commons::enable_logger;
use crate::commons::recv;
use crate::commons::RECV_TIMEOUT;

#[derive(Debug, Deserialize, PartialEq, Default)]
struct Database {
    host: String,
    port: u16,
    #[serde(rename = "max-connections")]
    max_connections: u32,
}

#[derive(Debug, Deserialize, PartialEq, Default)]
struct ServiceConfig {
    name: String,
    debug: bool,
    database: Database,
    replica: Option<Database>,
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.put("service/web/name", "web");
    store.put("service/web/debug", "true");
    store.put("service/web/database/host", "db.internal");
    store.put("service/web/database/port", "5432");
    store.put("service/web/database/max-connections", "20");
    store
}

#[tokio::test]
async fn test_service_config_follows_store_updates() {
    enable_logger();
    let store = seeded_store();

    let (tx, mut rx) = mpsc::channel::<ServiceConfig>(1);
    let (err_tx, mut err_rx) = mpsc::channel(4);
    let mut pipeline = Pipeline::builder(store.clone(), tx)
        .config(WatchConfig::default().with_prefix("service/web/"))
        .errors(err_tx)
        .build();
    pipeline.start().unwrap();

    let initial = recv(&mut rx).await;
    assert_eq!(
        initial,
        ServiceConfig {
            name: "web".into(),
            debug: true,
            database: Database {
                host: "db.internal".into(),
                port: 5432,
                max_connections: 20,
            },
            replica: None,
        }
    );

    store.put("service/web/replica/host", "replica.internal");
    let updated = recv(&mut rx).await;
    assert_eq!(updated.replica.unwrap().host, "replica.internal");

    store.put("service/web/database/port", "not-a-port");
    assert!(matches!(recv(&mut err_rx).await, Error::Decode(_)));

    store.put("service/web/database/port", "6432");
    assert_eq!(recv(&mut rx).await.database.port, 6432);

    pipeline.stop().await;
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    store.put("service/web/name", "after-stop");
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_prefix_is_reported_once() {
    enable_logger();
    let (tx, mut rx) = mpsc::channel::<ServiceConfig>(1);
    let (err_tx, mut err_rx) = mpsc::channel(1);
    let mut pipeline = Pipeline::builder(seeded_store(), tx).errors(err_tx).build();

    assert!(pipeline.start().is_err());
    assert!(matches!(
        recv(&mut err_rx).await,
        Error::Configuration(ConfigurationError::EmptyPrefix)
    ));
    assert!(timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_watcher_and_decoder_compose_without_pipeline() {
    enable_logger();
    let store = seeded_store();
    let cancel = CancellationToken::new();
    let mut watcher = Watcher::new(
        store.clone(),
        "service/web/database",
        WatchConfig::default().backoff,
        cancel.clone(),
    );
    let decoder = TreeDecoder::new("service/web/database").unwrap();

    let snapshot = watcher.next().await.unwrap().unwrap();
    let database: Database = decoder.decode(&snapshot).unwrap();
    assert_eq!(database.host, "db.internal");
    assert_eq!(snapshot.index, store.index("service/web/database"));

    cancel.cancel();
    assert!(watcher.next().await.is_none());
}
