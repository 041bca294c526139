mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{client_for, linked_engine, open_store, unlinked_engine, INSTALLATION_ID};
use gatekeep_core::client::{ENTITLEMENT_PATH, LINK_PATH, VALIDATE_PATH};
use gatekeep_core::clock::ManualClock;
use gatekeep_core::events::{EventBus, GateEvent};
use gatekeep_core::{GateError, LinkEngine};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const T0: i64 = 1_700_000_000_000;

fn valid() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"valid": true, "message": "ok"}))
}

fn with_clock(engine: LinkEngine) -> (LinkEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    (engine.with_clock(clock.clone()), clock)
}

// ── TTL cache ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_verdict_skips_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(VALIDATE_PATH))
        .respond_with(valid())
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (engine, clock) = with_clock(linked_engine(&server.uri(), &dir));

    assert!(engine.validate_server_link().await.unwrap());
    for _ in 0..5 {
        clock.advance(Duration::from_secs(59));
        assert!(engine.validate_server_link().await.unwrap());
    }
    // 295s elapsed, still inside the default 300s window.
}

#[tokio::test]
async fn stale_verdict_costs_exactly_one_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(VALIDATE_PATH))
        .respond_with(valid())
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (engine, clock) = with_clock(linked_engine(&server.uri(), &dir));

    assert!(engine.validate_server_link().await.unwrap());
    clock.advance(Duration::from_secs(300));
    assert!(engine.validate_server_link().await.unwrap());
    assert_eq!(
        engine.cache().verified_at(INSTALLATION_ID),
        Some(T0 + 300_000)
    );
    // Re-stamped at T0+300s, so the next call is cached again.
    clock.advance(Duration::from_secs(1));
    assert!(engine.validate_server_link().await.unwrap());
}

#[tokio::test]
async fn shorter_ttl_is_honoured_and_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(VALIDATE_PATH))
        .respond_with(valid())
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    {
        let (engine, clock) = with_clock(linked_engine(&server.uri(), &dir));
        engine.set_validation_ttl(Duration::from_secs(10)).unwrap();

        assert!(engine.validate_server_link().await.unwrap());
        clock.advance(Duration::from_secs(10));
        assert!(engine.validate_server_link().await.unwrap());
    }

    let reopened = LinkEngine::new(client_for(&server.uri()), open_store(&dir)).unwrap();
    assert_eq!(reopened.validation_ttl(), Duration::from_secs(10));
}

// ── Short circuits ───────────────────────────────────────────────────────────

#[tokio::test]
async fn unlink_then_validate_is_false_without_a_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(valid())
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = linked_engine(&server.uri(), &dir);
    engine.cache().mark_verified(INSTALLATION_ID, T0);

    engine.unlink().unwrap();

    assert!(!engine.validate_server_link().await.unwrap());
    assert!(engine.cache().is_empty());
    let state = engine.get_current_link_state();
    assert!(!state.linked);
    assert!(state.owner_identity.is_none());
    assert!(state.verification_token.is_none());
    assert_eq!(state.installation_id.as_deref(), Some(INSTALLATION_ID));
}

#[tokio::test]
async fn unlinked_entitlement_checks_make_no_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENTITLEMENT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"purchased": true})))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = unlinked_engine(&server.uri(), &dir);

    let full = "0f".repeat(32);
    for identity in ["", "aa", full.as_str()] {
        assert!(!engine.is_plugin_authorized(identity).await);
    }
}

#[tokio::test]
async fn entitlement_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENTITLEMENT_PATH))
        .and(body_partial_json(json!({"installationId": INSTALLATION_ID})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"purchased": true})))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = linked_engine(&server.uri(), &dir);

    assert!(engine.is_plugin_authorized("cafe").await);
    assert!(engine.is_plugin_authorized("cafe").await);
}

// ── Link ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn link_with_token_abc_links_and_stamps_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LINK_PATH))
        .and(body_partial_json(json!({"token": "ABC", "serverName": "lobby"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "message": "Server linked successfully",
            "ownerUuid": "owner-7",
            "verificationToken": "vt-abc",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let (engine, _clock) = with_clock(unlinked_engine(&server.uri(), &dir).with_events(events));
    assert!(engine.installation_id().is_none());

    let outcome = engine.link_server("ABC", "lobby", "1.21.4").await.unwrap();
    assert!(outcome.ok());

    let state = engine.get_current_link_state();
    assert!(state.linked);
    assert_eq!(state.owner_identity.as_deref(), Some("owner-7"));
    let u1 = state.installation_id.expect("installation id generated");
    assert_eq!(engine.cache().verified_at(&u1), Some(T0));
    assert_eq!(state.last_validated_at, Some(T0));

    assert_eq!(
        rx.try_recv().unwrap(),
        GateEvent::ServerLinked {
            installation_id: u1.clone(),
            owner_identity: Some("owner-7".into()),
        }
    );

    // Link survives a restart with the same installation id.
    drop(engine);
    let reopened = LinkEngine::new(client_for(&server.uri()), open_store(&dir)).unwrap();
    let state = reopened.get_current_link_state();
    assert!(state.linked);
    assert_eq!(state.installation_id.as_deref(), Some(u1.as_str()));
    assert_eq!(state.verification_token.as_deref(), Some("vt-abc"));
}

#[tokio::test]
async fn failed_link_keeps_state_but_keeps_the_installation_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LINK_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "Invalid token"})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = unlinked_engine(&server.uri(), &dir);

    let outcome = engine.link_server("nope", "lobby", "1.21.4").await.unwrap();
    assert!(!outcome.ok());
    assert_eq!(outcome.message, "Invalid token");
    assert!(!engine.is_linked());
    assert!(engine.cache().is_empty());

    let first = engine.installation_id().expect("id persisted before the call");
    engine.link_server("nope", "lobby", "1.21.4").await.unwrap();
    assert_eq!(engine.installation_id(), Some(first));
}

// ── Validate ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn validate_false_demotes_and_purges_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(VALIDATE_PATH))
        .respond_with(valid())
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(VALIDATE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "valid": false,
            "message": "Server not linked",
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (engine, clock) = with_clock(linked_engine(&server.uri(), &dir));

    assert!(engine.validate_server_link().await.unwrap());
    assert!(engine.cache().verified_at(INSTALLATION_ID).is_some());

    clock.advance(Duration::from_secs(301));
    assert!(!engine.validate_server_link().await.unwrap());

    assert!(!engine.is_linked());
    assert!(engine.cache().verified_at(INSTALLATION_ID).is_none());
    let state = engine.get_current_link_state();
    assert!(state.owner_identity.is_none());
    assert!(state.verification_token.is_none());

    drop(engine);
    let reopened = LinkEngine::new(client_for(&server.uri()), open_store(&dir)).unwrap();
    assert!(!reopened.is_linked());
}

#[tokio::test]
async fn transport_failure_leaves_link_intact() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(VALIDATE_PATH))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = linked_engine(&server.uri(), &dir);

    let err = engine.validate_server_link().await.unwrap_err();
    assert!(matches!(err, GateError::Transport(_)), "{err:?}");
    let state = engine.get_current_link_state();
    assert!(state.linked);
    assert_eq!(state.owner_identity.as_deref(), Some("owner-1"));
    assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn rate_limited_validate_leaves_link_intact() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(VALIDATE_PATH))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({"error": "rate limited"})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = linked_engine(&server.uri(), &dir);

    let err = engine.validate_server_link().await.unwrap_err();
    assert!(matches!(err, GateError::Transport(_)), "{err:?}");
    let state = engine.get_current_link_state();
    assert!(state.linked);
    assert_eq!(state.owner_identity.as_deref(), Some("owner-1"));
    assert_eq!(state.verification_token.as_deref(), Some("vt-1"));

    drop(engine);
    let reopened = LinkEngine::new(client_for(&server.uri()), open_store(&dir)).unwrap();
    assert!(reopened.is_linked());
}

#[tokio::test]
async fn late_denial_does_not_undo_a_relink() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(VALIDATE_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"valid": false, "message": "Server not linked"}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(LINK_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "ownerUuid": "owner-2",
            "verificationToken": "vt-2",
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = linked_engine(&server.uri(), &dir);

    let (verdict, relinked) = tokio::join!(engine.validate_server_link(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.link_server("NEW", "lobby", "1.21.4").await
    });
    assert!(relinked.unwrap().ok());
    assert!(!verdict.unwrap());

    let state = engine.get_current_link_state();
    assert!(state.linked);
    assert_eq!(state.owner_identity.as_deref(), Some("owner-2"));
    assert_eq!(state.verification_token.as_deref(), Some("vt-2"));
    assert!(engine.cache().verified_at(INSTALLATION_ID).is_some());
}

#[tokio::test]
async fn validate_records_purchased_plugins() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(VALIDATE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "valid": true,
            "message": "ok",
            "purchasedPlugins": ["aa11"],
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = linked_engine(&server.uri(), &dir);
    assert!(engine.get_current_link_state().entitlement_set.is_none());

    engine.validate_server_link().await.unwrap();
    let set = engine.get_current_link_state().entitlement_set.unwrap();
    assert!(set.contains("aa11"));
}

// ── Blocking variants ────────────────────────────────────────────────────────

/// The mock server lives on its own runtime so the blocking calls below run
/// on a thread with no runtime entered.
fn blocking_fixture(response: ResponseTemplate, route: &str) -> (tokio::runtime::Runtime, MockServer) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(response)
            .mount(&server)
            .await;
        server
    });
    (rt, server)
}

#[test]
fn sync_validate_works_before_any_runtime() {
    let (_rt, server) = blocking_fixture(valid(), VALIDATE_PATH);
    let dir = tempfile::tempdir().unwrap();
    let engine = linked_engine(&server.uri(), &dir);

    assert!(engine.validate_server_link_sync().unwrap());
    // Second call is served from the cache.
    assert!(engine.validate_server_link_sync().unwrap());
}

#[test]
fn sync_entitlement_check_works_before_any_runtime() {
    let (_rt, server) = blocking_fixture(
        ResponseTemplate::new(200).set_body_json(json!({"purchased": true})),
        ENTITLEMENT_PATH,
    );
    let dir = tempfile::tempdir().unwrap();
    let engine = linked_engine(&server.uri(), &dir);

    assert!(engine.is_plugin_authorized_sync("cafe").unwrap());
}

#[test]
fn sync_call_gives_up_after_boot_wait() {
    let (_rt, server) = blocking_fixture(
        valid().set_delay(Duration::from_secs(1)),
        VALIDATE_PATH,
    );
    let dir = tempfile::tempdir().unwrap();
    let engine = linked_engine(&server.uri(), &dir).with_boot_wait(Duration::from_millis(200));

    let err = engine.validate_server_link_sync().unwrap_err();
    assert!(matches!(err, GateError::Timeout(_)), "{err:?}");
    assert!(engine.is_linked());
}

#[tokio::test]
async fn sync_call_refuses_inside_a_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let engine = linked_engine("http://127.0.0.1:9", &dir);

    let err = engine.validate_server_link_sync().unwrap_err();
    assert!(matches!(err, GateError::Runtime(_)), "{err:?}");
    assert!(engine.is_linked());
}
