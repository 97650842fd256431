use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use onezone_common::mutation::PageMutation;
use onezone_common::types::{empty_document, PageContent, PageVersion, WorkspaceRole};
use onezone_relay::auth::jwt::JwtAccessTokenService;
use onezone_relay::auth::policy::PageAccessPolicy;
use onezone_relay::metrics::RelayMetrics;
use onezone_relay::ownership::PageOwnership;
use onezone_relay::rate_limit::RateLimiter;
use onezone_relay::server::{build_router, RelayState};
use onezone_relay::session::{SessionConfig, SessionError, SessionRegistry};
use onezone_relay::store::{NewPage, PageStore};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const TEST_SECRET: &str = "onezone_gateway_test_secret_long_enough_for_hs256";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    addr: SocketAddr,
    jwt: Arc<JwtAccessTokenService>,
    policy: PageAccessPolicy,
    registry: SessionRegistry,
    store: PageStore,
    workspace_id: Uuid,
    page_id: Uuid,
}

impl Relay {
    async fn start() -> Self {
        let store = PageStore::memory();
        let policy = PageAccessPolicy::memory();
        let workspace_id = Uuid::new_v4();
        let page_id = Uuid::new_v4();
        let creator = Uuid::new_v4();
        store
            .create_page(NewPage {
                page_id,
                workspace_id,
                created_by: creator,
                content: PageContent::new("Standup notes"),
                is_private: false,
            })
            .await
            .expect("page should be created");
        policy.register_page(page_id, workspace_id, creator, false).await;

        let registry = SessionRegistry::new(
            SessionConfig::default(),
            store.clone(),
            policy.clone(),
            PageOwnership::local(Uuid::new_v4()),
        );
        let jwt = Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("jwt service"));
        let app = build_router(
            RelayState::new(registry.clone(), Arc::new(RateLimiter::per_minute(100, 100))),
            Arc::clone(&jwt),
            Arc::new(RelayMetrics::default()),
            None,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("relay should serve");
        });

        Self { addr, jwt, policy, registry, store, workspace_id, page_id }
    }

    async fn member(&self) -> Uuid {
        let user_id = Uuid::new_v4();
        self.policy.grant(self.workspace_id, user_id, WorkspaceRole::Member).await;
        user_id
    }

    async fn connect(&self, user_id: Uuid) -> Client {
        let token = self.jwt.issue_access_token(user_id).expect("token should issue");
        let url = format!("ws://{}/v1/ws?access_token={token}", self.addr);
        let (mut client, _) = connect_async(url).await.expect("websocket should connect");

        let connect = next_of_type(&mut client, "connect").await;
        assert_eq!(connect["user_id"], json!(user_id));
        assert_eq!(connect["protocol"], "onezone-page.v1");
        client
    }
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::text(frame.to_string())).await.expect("frame should send");
}

/// Next server message with the given `type`, skipping everything else.
async fn next_of_type(client: &mut Client, kind: &str) -> Value {
    timeout(Duration::from_secs(3), async {
        loop {
            let frame = client
                .next()
                .await
                .expect("socket should stay open")
                .expect("frame should be readable");
            let Message::Text(text) = frame else {
                continue;
            };
            let message: Value =
                serde_json::from_str(text.as_str()).expect("server frames are json");
            if message["type"] == kind {
                return message;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for `{kind}`"))
}

async fn join(client: &mut Client, page_id: Uuid) -> Value {
    send(client, json!({ "type": "join", "page_id": page_id })).await;
    next_of_type(client, "page_state").await
}

#[tokio::test]
async fn join_returns_live_page_state() {
    let relay = Relay::start().await;
    let alice = relay.member().await;
    let mut client = relay.connect(alice).await;

    let state = join(&mut client, relay.page_id).await;
    assert_eq!(state["page_id"], json!(relay.page_id));
    assert_eq!(state["page"]["name"], "Standup notes");
    assert_eq!(state["seq"], 0);
}

#[tokio::test]
async fn mutation_is_acked_and_fanned_out() {
    let relay = Relay::start().await;
    let (alice, bob) = (relay.member().await, relay.member().await);
    let mut alice_ws = relay.connect(alice).await;
    let mut bob_ws = relay.connect(bob).await;
    join(&mut alice_ws, relay.page_id).await;
    join(&mut bob_ws, relay.page_id).await;

    send(
        &mut alice_ws,
        json!({
            "type": "mutate",
            "page_id": relay.page_id,
            "request_id": "rename-1",
            "op": { "kind": "rename", "name": "Retro notes" }
        }),
    )
    .await;

    let ack = next_of_type(&mut alice_ws, "ack").await;
    assert_eq!(ack["command"], "mutate");
    assert_eq!(ack["request_id"], "rename-1");
    assert_eq!(ack["seq"], 1);

    let update = next_of_type(&mut bob_ws, "page_update").await;
    assert_eq!(update["seq"], 1);
    assert_eq!(update["actor_id"], json!(alice));
    assert_eq!(update["op"], json!({ "kind": "rename", "name": "Retro notes" }));
}

#[tokio::test]
async fn locked_page_rejects_other_editors() {
    let relay = Relay::start().await;
    let (alice, bob) = (relay.member().await, relay.member().await);
    let mut alice_ws = relay.connect(alice).await;
    let mut bob_ws = relay.connect(bob).await;
    join(&mut alice_ws, relay.page_id).await;
    join(&mut bob_ws, relay.page_id).await;

    send(&mut alice_ws, json!({ "type": "acquire_lock", "page_id": relay.page_id })).await;
    let ack = next_of_type(&mut alice_ws, "ack").await;
    assert_eq!(ack["command"], "acquire_lock");

    let lock = next_of_type(&mut bob_ws, "lock_page").await;
    assert_eq!(lock["locked_by"], json!(alice));

    send(
        &mut bob_ws,
        json!({
            "type": "mutate",
            "page_id": relay.page_id,
            "op": { "kind": "rename", "name": "Hijacked" }
        }),
    )
    .await;
    let error = next_of_type(&mut bob_ws, "error").await;
    assert_eq!(error["code"], "LOCK_HELD");
    assert_eq!(error["page_id"], json!(relay.page_id));
    assert_eq!(error["details"]["locked_by"], json!(alice));
}

#[tokio::test]
async fn joining_a_page_outside_the_workspace_is_forbidden() {
    let relay = Relay::start().await;
    let stranger = Uuid::new_v4();
    let mut client = relay.connect(stranger).await;

    send(&mut client, json!({ "type": "join", "page_id": relay.page_id })).await;
    let error = next_of_type(&mut client, "error").await;
    assert_eq!(error["code"], "AUTH_FORBIDDEN");
}

#[tokio::test]
async fn disconnect_removes_the_user_from_presence() {
    let relay = Relay::start().await;
    let (alice, bob) = (relay.member().await, relay.member().await);
    let mut alice_ws = relay.connect(alice).await;
    let mut bob_ws = relay.connect(bob).await;
    join(&mut alice_ws, relay.page_id).await;
    join(&mut bob_ws, relay.page_id).await;

    bob_ws.close(None).await.expect("close should send");

    let left = next_of_type(&mut alice_ws, "leave_page").await;
    assert_eq!(left["user_id"], json!(bob));
}

#[tokio::test]
async fn joined_socket_resyncs_after_session_teardown() {
    let relay = Relay::start().await;
    let (alice, bob) = (relay.member().await, relay.member().await);
    let mut alice_ws = relay.connect(alice).await;
    join(&mut alice_ws, relay.page_id).await;

    // A version written behind the session's back forces a teardown.
    relay
        .store
        .append_version(&PageVersion {
            page_id: relay.page_id,
            version_number: 1,
            name: "external".into(),
            content: empty_document(),
            content_html: String::new(),
            change_summary: None,
            created_by: bob,
            created_at: chrono::Utc::now(),
        })
        .await
        .expect("external version should append");
    let conflict = relay.registry.snapshot(relay.page_id, bob, None).await;
    assert!(matches!(conflict, Err(SessionError::VersionConflict { .. })));

    let error = next_of_type(&mut alice_ws, "error").await;
    assert_eq!(error["code"], "SESSION_UNAVAILABLE");
    let state = next_of_type(&mut alice_ws, "page_state").await;
    assert_eq!(state["page_id"], json!(relay.page_id));
    assert_eq!(state["latest_version"], 1);

    relay
        .registry
        .mutate(relay.page_id, bob, PageMutation::Rename { name: "After restart".into() })
        .await
        .expect("bob edits the rebuilt session");
    let update = next_of_type(&mut alice_ws, "page_update").await;
    assert_eq!(update["actor_id"], json!(bob));
    assert_eq!(update["op"], json!({ "kind": "rename", "name": "After restart" }));
}
