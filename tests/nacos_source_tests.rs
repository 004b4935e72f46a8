//! Nacos config source tests with mock server

use flowguard::config::SourceConfig;
use flowguard::error::SourceError;
use flowguard::source::{ConfigSource, NacosConfigSource, SubscriptionHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CONFIG_PATH: &str = "/nacos/v1/cs/configs";
const TIMEOUT: Duration = Duration::from_secs(5);

fn create_test_source(server: &MockServer, namespace: Option<&str>) -> NacosConfigSource {
    let config = SourceConfig {
        server_addr: server.uri(),
        namespace: namespace.map(str::to_string),
        poll_interval_ms: 50,
        ..SourceConfig::default()
    };
    NacosConfigSource::new(&config).unwrap()
}

#[tokio::test]
async fn test_fetch_returns_content() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .and(query_param("dataId", "flow-rules.json"))
        .and(query_param("group", "ali-user"))
        .and(query_param("tenant", "dev"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"resource":"GET#/a"}]"#))
        .mount(&mock_server)
        .await;

    let source = create_test_source(&mock_server, Some("dev"));
    let content = source
        .fetch("flow-rules.json", "ali-user", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(content.as_deref(), Some(r#"[{"resource":"GET#/a"}]"#));
}

#[tokio::test]
async fn test_fetch_missing_config_is_none() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(ResponseTemplate::new(404).set_body_string("config data not exist"))
        .mount(&mock_server)
        .await;

    let source = create_test_source(&mock_server, None);
    let content = source
        .fetch("degrade-rules.json", "ali-user", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(content, None);
}

#[tokio::test]
async fn test_fetch_server_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&mock_server)
        .await;

    let source = create_test_source(&mock_server, None);
    let err = source
        .fetch("flow-rules.json", "ali-user", TIMEOUT)
        .await
        .unwrap_err();
    match err {
        SourceError::Api { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "boom");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fetch_timeout() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&mock_server)
        .await;

    let source = create_test_source(&mock_server, None);
    let err = source
        .fetch("flow-rules.json", "ali-user", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Timeout { timeout_ms: 50, .. }));
}

#[tokio::test]
async fn test_fetch_unreachable_server() {
    let config = SourceConfig {
        server_addr: "http://127.0.0.1:1".to_string(),
        ..SourceConfig::default()
    };
    let source = NacosConfigSource::new(&config).unwrap();
    let err = source
        .fetch("flow-rules.json", "ali-user", TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Unavailable { .. }));
}

#[tokio::test]
async fn test_poller_reports_changes_once() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("v1"))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("v2"))
        .mount(&mock_server)
        .await;

    let source = create_test_source(&mock_server, None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = source
        .subscribe(
            "flow-rules.json",
            "ali-user",
            Arc::new(move |content: Option<String>| {
                let _ = tx.send(content);
            }),
        )
        .await
        .unwrap();
    assert_eq!(source.active_pollers(), 1);

    let first = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap();
    assert_eq!(first, Some(Some("v1".to_string())));
    let second = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap();
    assert_eq!(second, Some(Some("v2".to_string())));

    // Unchanged content is not reported again
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    source.unsubscribe(handle).await.unwrap();
    assert_eq!(source.active_pollers(), 0);
}

#[tokio::test]
async fn test_unsubscribe_unknown_handle() {
    let mock_server = MockServer::start().await;
    let source = create_test_source(&mock_server, None);
    let err = source
        .unsubscribe(SubscriptionHandle::new(99))
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::UnknownHandle(99)));
}
