//! Integration Tests for Sync Module
//!
//! HTTP-level tests against a mockito server:
//! - Re-authentication on 401/403 (exactly one retry)
//! - Listing pagination and content batches
//! - Delivery assembly download and result push
//! - End-to-end runs through the built-in adapters and the local database

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::cache::TokenCache;
    use crate::config::{Credentials, SyncConfig};
    use crate::db::Database;
    use mockito::{Matcher, Mock, Server};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TOKEN_PATH: &str = "/api/v1/auth/token";
    const IDS_PATH: &str = "/api/v1/sync/entity-ids";
    const CONTENT_PATH: &str = "/api/v1/sync/entity-content";
    const ASSEMBLY_PATH: &str = "/api/v1/sync/delivery-assembly";
    const RESULTS_PATH: &str = "/api/v1/sync/results";

    fn client(server: &Server) -> SyncApiClient {
        let config = SyncConfig::new(server.url(), Credentials::new("client", "secret"));
        SyncApiClient::from_config(&config, TokenCache::new()).unwrap()
    }

    /// Token endpoint handing out `tokens` in order (the last one repeats)
    async fn token_mock(server: &mut Server, tokens: &'static [&'static str], hits: usize) -> Mock {
        let counter = Arc::new(AtomicUsize::new(0));
        server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let token = tokens[n.min(tokens.len() - 1)];
                json!({
                    "access_token": token,
                    "expires": chrono::Utc::now().timestamp() + 3600,
                })
                .to_string()
                .into_bytes()
            })
            .expect(hits)
            .create_async()
            .await
    }

    fn listing(entities: serde_json::Value, next: Option<&str>) -> String {
        let mut data = json!({ "entities": entities });
        if let Some(next) = next {
            data["nextCallUrl"] = json!(next);
        }
        json!({ "success": true, "data": data }).to_string()
    }

    fn bearer(token: &str) -> Matcher {
        Matcher::Exact(format!("Bearer {}", token))
    }

    // ========================================================================
    // Re-authentication
    // ========================================================================

    #[tokio::test]
    async fn test_unauthorized_call_is_retried_with_fresh_token() {
        let mut server = Server::new_async().await;
        let tokens = token_mock(&mut server, &["t1", "t2"], 2).await;
        let _head = server.mock("HEAD", "/").with_status(200).create_async().await;

        let stale = server
            .mock("GET", IDS_PATH)
            .match_query(Matcher::Any)
            .match_header("authorization", bearer("t1"))
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("GET", IDS_PATH)
            .match_query(Matcher::Any)
            .match_header("authorization", bearer("t2"))
            .with_status(200)
            .with_body(listing(json!({"a": {"id": "a", "checksum": "1"}}), None))
            .expect(1)
            .create_async()
            .await;

        let ids = client(&server).get_entity_ids("test-taker", None).await.unwrap();

        assert_eq!(ids.keys().cloned().collect::<Vec<_>>(), vec!["a".to_string()]);
        tokens.assert_async().await;
        stale.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_not_retried_again() {
        let mut server = Server::new_async().await;
        let tokens = token_mock(&mut server, &["t1", "t2"], 2).await;
        let _head = server.mock("HEAD", "/").with_status(200).create_async().await;

        let denied = server
            .mock("GET", IDS_PATH)
            .match_query(Matcher::Any)
            .with_status(401)
            .expect(2)
            .create_async()
            .await;

        let err = client(&server).get_entity_ids("test-taker", None).await.unwrap_err();

        assert!(matches!(err, SyncApiError::Transport(TransportError::Unauthorized { status: 401 })));
        assert_eq!(err.code(), Some(401));
        tokens.assert_async().await;
        denied.assert_async().await;
    }

    #[tokio::test]
    async fn test_forbidden_is_retried_once() {
        let mut server = Server::new_async().await;
        let tokens = token_mock(&mut server, &["t1", "t2"], 2).await;

        let _stale = server
            .mock("POST", CONTENT_PATH)
            .match_header("authorization", bearer("t1"))
            .with_status(403)
            .create_async()
            .await;
        let fresh = server
            .mock("POST", CONTENT_PATH)
            .match_header("authorization", bearer("t2"))
            .with_status(200)
            .with_body(json!({"success": true, "data": {"d1": {"id": "d1", "checksum": "x"}}}).to_string())
            .expect(1)
            .create_async()
            .await;

        let records = client(&server)
            .get_entities_content("delivery", &["d1".to_string()])
            .await
            .unwrap();

        assert_eq!(records["d1"].checksum(), "x");
        tokens.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let mut server = Server::new_async().await;
        let tokens = token_mock(&mut server, &["t1"], 1).await;

        let failing = server
            .mock("GET", IDS_PATH)
            .match_query(Matcher::Any)
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let err = client(&server).get_entity_ids("test-taker", None).await.unwrap_err();

        assert_eq!(err.code(), Some(500));
        tokens.assert_async().await;
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_failure_aborts_call() {
        let mut server = Server::new_async().await;
        let _token = server
            .mock("POST", TOKEN_PATH)
            .with_status(500)
            .create_async()
            .await;
        let untouched = server
            .mock("GET", IDS_PATH)
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let err = client(&server).get_entity_ids("test-taker", None).await.unwrap_err();

        assert!(matches!(err, SyncApiError::Token(_)));
        untouched.assert_async().await;
    }

    // ========================================================================
    // Resource Calls
    // ========================================================================

    #[tokio::test]
    async fn test_listing_follows_next_call_url() {
        let mut server = Server::new_async().await;
        let _tokens = token_mock(&mut server, &["t1"], 1).await;

        let first = server
            .mock("GET", IDS_PATH)
            .match_query(Matcher::UrlEncoded("type".into(), "test-taker".into()))
            .with_status(200)
            .with_body(listing(
                json!({"a": {"id": "a", "checksum": "1"}, "b": {"id": "b", "checksum": "2"}}),
                Some("/ids/page2"),
            ))
            .expect(1)
            .create_async()
            .await;
        // Repeats its own cursor, which must end the loop
        let second = server
            .mock("GET", "/ids/page2")
            .with_status(200)
            .with_body(listing(json!({"c": {"id": "c", "checksum": "3"}}), Some("/ids/page2")))
            .expect(1)
            .create_async()
            .await;

        let ids = client(&server).get_entity_ids("test-taker", None).await.unwrap();

        assert_eq!(ids.keys().cloned().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(ids["c"].checksum(), "3");
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_listing_follows_absolute_cursor_on_same_server() {
        let mut server = Server::new_async().await;
        let _tokens = token_mock(&mut server, &["t1"], 1).await;
        let next = format!("{}/ids/page2", server.url());

        let _first = server
            .mock("GET", IDS_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(listing(json!({"a": {"id": "a", "checksum": "1"}}), Some(next.as_str())))
            .create_async()
            .await;
        let second = server
            .mock("GET", "/ids/page2")
            .match_header("authorization", bearer("t1"))
            .with_status(200)
            .with_body(listing(json!({"b": {"id": "b", "checksum": "2"}}), None))
            .expect(1)
            .create_async()
            .await;

        let ids = client(&server).get_entity_ids("test-taker", None).await.unwrap();

        assert_eq!(ids.keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_listing_rejects_cursor_to_another_server() {
        let mut server = Server::new_async().await;
        let _tokens = token_mock(&mut server, &["t1"], 1).await;

        let first = server
            .mock("GET", IDS_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(listing(
                json!({"a": {"id": "a", "checksum": "1"}}),
                Some("http://127.0.0.1:9/ids/page2"),
            ))
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/ids/page2")
            .with_status(200)
            .with_body(listing(json!({}), None))
            .expect(0)
            .create_async()
            .await;

        let err = client(&server).get_entity_ids("test-taker", None).await.unwrap_err();

        assert!(matches!(err, SyncApiError::InvalidResponse(_)));
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_content_is_limited_to_requested_ids() {
        let mut server = Server::new_async().await;
        let _tokens = token_mock(&mut server, &["t1"], 1).await;

        let content = server
            .mock("POST", CONTENT_PATH)
            .match_body(Matcher::PartialJson(json!({"type": "delivery", "entityIds": ["d1", "d2"]})))
            .with_status(200)
            .with_body(
                json!({"success": true, "data": {
                    "d1": {"id": "d1", "checksum": "1", "label": "First"},
                    "d2": {"id": "d2", "checksum": "2"},
                    "d3": {"id": "d3", "checksum": "3"}
                }})
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let records = client(&server)
            .get_entities_content("delivery", &["d1".to_string(), "d2".to_string()])
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records["d1"].payload["label"], json!("First"));
        assert!(!records.contains_key("d3"));
        content.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_content_request_makes_no_call() {
        let mut server = Server::new_async().await;
        let tokens = token_mock(&mut server, &["t1"], 0).await;

        let records = client(&server).get_entities_content("delivery", &[]).await.unwrap();

        assert!(records.is_empty());
        tokens.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_delivery_assembly() {
        let mut server = Server::new_async().await;
        let _tokens = token_mock(&mut server, &["t1"], 1).await;

        let assembly = server
            .mock("GET", ASSEMBLY_PATH)
            .match_query(Matcher::UrlEncoded("deliveryId".into(), "d1".into()))
            .match_header("authorization", bearer("t1"))
            .with_status(200)
            .with_body(vec![0x50, 0x4b, 0x03, 0x04])
            .expect(1)
            .create_async()
            .await;

        let bytes = client(&server).download_delivery_assembly("d1").await.unwrap();

        assert_eq!(bytes, vec![0x50, 0x4b, 0x03, 0x04]);
        assembly.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_resource_accepted_and_rejected() {
        let mut server = Server::new_async().await;
        let _tokens = token_mock(&mut server, &["t1"], 1).await;

        let _accepted = server
            .mock("POST", RESULTS_PATH)
            .match_body(Matcher::PartialJson(json!({"type": "result", "resource": {"id": "r1"}})))
            .with_status(200)
            .with_body(r#"{"success": true, "data": null}"#)
            .create_async()
            .await;
        let _rejected = server
            .mock("POST", RESULTS_PATH)
            .match_body(Matcher::PartialJson(json!({"type": "result", "resource": {"id": "r2"}})))
            .with_status(200)
            .with_body(r#"{"success": false, "errorMessage": "delivery closed"}"#)
            .create_async()
            .await;

        let client = client(&server);
        assert!(client.send_resource("result", &ResourceRecord::local("r1")).await.unwrap());
        assert!(!client.send_resource("result", &ResourceRecord::local("r2")).await.unwrap());
    }

    // ========================================================================
    // End-to-End Through the Adapters
    // ========================================================================

    fn engine(server: &Server) -> (Arc<Database>, SyncManager, HistoryManager) {
        let db = Arc::new(Database::in_memory().unwrap());
        let api = Arc::new(client(server));

        let mut registry = ProviderRegistry::new();
        register_default_providers(&mut registry, db.clone(), api).unwrap();

        let history = HistoryManager::new(db.clone());
        let manager = SyncManager::new(&registry, SynchronizerOptions::default(), None)
            .with_history(history.clone());

        (db, manager, history)
    }

    #[tokio::test]
    async fn test_test_taker_fetch_end_to_end() {
        let mut server = Server::new_async().await;
        let _tokens = token_mock(&mut server, &["t1"], 1).await;
        let (db, manager, history) = engine(&server);

        for (id, checksum) in [("n1", "1"), ("n2", "2"), ("n3", "3")] {
            db.upsert_resource("test-taker", &ResourceRecord::new(id, checksum)).unwrap();
        }

        let _ids = server
            .mock("GET", IDS_PATH)
            .match_query(Matcher::UrlEncoded("type".into(), "test-taker".into()))
            .with_status(200)
            .with_body(listing(
                json!({
                    "n1": {"id": "n1", "checksum": "1b"},
                    "n2": {"id": "n2", "checksum": "2"},
                    "n4": {"id": "n4", "checksum": "4"}
                }),
                None,
            ))
            .create_async()
            .await;
        // One request for the update chunk, one for the add chunk
        let content = server
            .mock("POST", CONTENT_PATH)
            .match_body(Matcher::PartialJson(json!({"type": "test-taker"})))
            .with_status(200)
            .with_body(
                json!({"success": true, "data": {
                    "n1": {"id": "n1", "checksum": "1b", "login": "updated"},
                    "n4": {"id": "n4", "checksum": "4", "login": "new"}
                }})
                .to_string(),
            )
            .expect(2)
            .create_async()
            .await;

        let report = manager.synchronize("test-taker").await.unwrap();

        assert_eq!(
            report,
            SyncReport::Fetch(FetchOperations {
                add: vec!["n4".into()],
                update: vec!["n1".into()],
                remove: vec!["n3".into()],
            })
        );
        content.assert_async().await;

        let local = db.list_resources("test-taker").unwrap();
        assert_eq!(local.keys().cloned().collect::<Vec<_>>(), vec!["n1", "n2", "n4"]);
        assert_eq!(local["n1"].checksum(), "1b");
        assert_eq!(local["n1"].payload["login"], json!("updated"));
        assert_eq!(local["n4"].payload["login"], json!("new"));

        let last = history.last_successful("test-taker").unwrap().unwrap();
        assert_eq!((last.added, last.updated, last.removed), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_delivery_add_stores_assembly() {
        let mut server = Server::new_async().await;
        let _tokens = token_mock(&mut server, &["t1"], 1).await;
        let (db, manager, _) = engine(&server);

        let _ids = server
            .mock("GET", IDS_PATH)
            .match_query(Matcher::UrlEncoded("type".into(), "delivery".into()))
            .with_status(200)
            .with_body(listing(json!({"d1": {"id": "d1", "checksum": "v1"}}), None))
            .create_async()
            .await;
        let _content = server
            .mock("POST", CONTENT_PATH)
            .with_status(200)
            .with_body(json!({"success": true, "data": {"d1": {"id": "d1", "checksum": "v1", "label": "Math"}}}).to_string())
            .create_async()
            .await;
        let assembly = server
            .mock("GET", ASSEMBLY_PATH)
            .match_query(Matcher::UrlEncoded("deliveryId".into(), "d1".into()))
            .with_status(200)
            .with_body("package-bytes")
            .expect(1)
            .create_async()
            .await;

        manager.synchronize("delivery").await.unwrap();

        assembly.assert_async().await;
        assert_eq!(db.get_assembly("d1").unwrap(), Some(b"package-bytes".to_vec()));
        assert_eq!(db.get_resource("delivery", "d1").unwrap().unwrap().payload["label"], json!("Math"));
    }

    #[tokio::test]
    async fn test_result_send_end_to_end() {
        let mut server = Server::new_async().await;
        let _tokens = token_mock(&mut server, &["t1"], 1).await;
        let (db, manager, _) = engine(&server);

        db.upsert_resource("result", &ResourceRecord::local("r1").with_field("score", json!(7))).unwrap();
        db.upsert_resource("result", &ResourceRecord::local("r2")).unwrap();

        let _accepted = server
            .mock("POST", RESULTS_PATH)
            .match_body(Matcher::PartialJson(json!({"resource": {"id": "r1", "score": 7}})))
            .with_status(200)
            .with_body(r#"{"success": true}"#)
            .create_async()
            .await;
        let _rejected = server
            .mock("POST", RESULTS_PATH)
            .match_body(Matcher::PartialJson(json!({"resource": {"id": "r2"}})))
            .with_status(200)
            .with_body(r#"{"success": false, "message": "not accepted"}"#)
            .create_async()
            .await;

        let report = manager.synchronize("result").await.unwrap();

        assert_eq!(
            report,
            SyncReport::Send(SendOperations {
                send: vec!["r1".into()],
                remove: vec!["r1".into()],
            })
        );
        let left = db.list_resources("result").unwrap();
        assert_eq!(left.keys().cloned().collect::<Vec<_>>(), vec!["r2"]);
    }

    #[tokio::test]
    async fn test_sync_all_keeps_going_after_a_failure() {
        let mut server = Server::new_async().await;
        let _tokens = token_mock(&mut server, &["t1"], 1).await;
        let (_db, manager, history) = engine(&server);

        // Only eligibilities list successfully; every other listing fails
        let _eligibility = server
            .mock("GET", IDS_PATH)
            .match_query(Matcher::UrlEncoded("type".into(), "eligibility".into()))
            .with_status(200)
            .with_body(listing(json!({}), None))
            .create_async()
            .await;
        let _others = server
            .mock("GET", IDS_PATH)
            .match_query(Matcher::Regex("type=(test-taker|delivery)".into()))
            .with_status(500)
            .create_async()
            .await;

        let result = manager.sync_all().await;

        let completed: Vec<&str> = result.reports.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(completed, vec!["eligibility", "result"]);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(history.get_stats().unwrap().total_runs, 4);
        assert_eq!(history.get_stats().unwrap().failed_runs, 2);
    }
}
