use std::time::Duration;

use kv_structure::ConsulStore;
use kv_structure::ConsulStoreConfig;
use kv_structure::Pipeline;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::matchers::query_param;
use wiremock::matchers::query_param_is_missing;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

use crate::commons::enable_logger;
use crate::commons::recv;

#[derive(Debug, Deserialize, PartialEq)]
struct Child {
    data: String,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Nested {
    addr: String,
    child: Child,
}

fn kv_response(
    index: u64,
    body: serde_json::Value,
) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("X-Consul-Index", index.to_string().as_str())
        .set_body_json(body)
}

#[tokio::test]
async fn test_pipeline_decodes_consul_subtree_and_follows_index() {
    enable_logger();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/kv/test/"))
        .and(query_param_is_missing("index"))
        .respond_with(kv_response(
            5,
            json!([
                {"Key": "test/", "Value": null},
                {"Key": "test/addr", "Value": "Zm9v"},
                {"Key": "test/child/data", "Value": "YmFy"}
            ]),
        ))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/kv/test/"))
        .and(query_param("index", "5"))
        .respond_with(kv_response(
            6,
            json!([
                {"Key": "test/addr", "Value": "YmF6"},
                {"Key": "test/child/data", "Value": "YmFy"}
            ]),
        ))
        .expect(1)
        .mount(&server)
        .await;

    // Long-poll that times out without a change.
    Mock::given(method("GET"))
        .and(path("/v1/kv/test/"))
        .and(query_param("index", "6"))
        .respond_with(
            kv_response(6, json!([{"Key": "test/addr", "Value": "YmF6"}])).set_delay(Duration::from_millis(50)),
        )
        .mount(&server)
        .await;

    let store = ConsulStore::new(ConsulStoreConfig {
        address: server.uri(),
        wait_time_ms: 1000,
        ..Default::default()
    })
    .unwrap();

    let (tx, mut rx) = mpsc::channel::<Nested>(1);
    let mut pipeline = Pipeline::builder(store, tx).prefix("test/").build();
    pipeline.start().unwrap();

    assert_eq!(
        recv(&mut rx).await,
        Nested {
            addr: "foo".into(),
            child: Child { data: "bar".into() },
        }
    );
    assert_eq!(recv(&mut rx).await.addr, "baz");
    assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.is_err());

    pipeline.stop().await;
}
