use std::time::Duration;

use onezone_common::mutation::PageMutation;
use onezone_common::protocol::ws::{ServerMessage, UnlockReason};
use onezone_common::types::{PageContent, WorkspaceRole};
use onezone_relay::auth::policy::PageAccessPolicy;
use onezone_relay::ownership::PageOwnership;
use onezone_relay::session::{DenyReason, SessionConfig, SessionError, SessionRegistry};
use onezone_relay::store::{NewPage, PageStore};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

struct Workspace {
    registry: SessionRegistry,
    store: PageStore,
    workspace_id: Uuid,
    page_id: Uuid,
}

impl Workspace {
    async fn new(config: SessionConfig) -> Self {
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
                content: PageContent::new("Roadmap"),
                is_private: false,
            })
            .await
            .expect("page should be created");
        policy.register_page(page_id, workspace_id, creator, false).await;

        let registry = SessionRegistry::new(
            config,
            store.clone(),
            policy,
            PageOwnership::local(Uuid::new_v4()),
        );
        Self { registry, store, workspace_id, page_id }
    }

    async fn member(&self) -> Uuid {
        let user_id = Uuid::new_v4();
        self.registry.policy().grant(self.workspace_id, user_id, WorkspaceRole::Member).await;
        user_id
    }
}

fn quick() -> SessionConfig {
    SessionConfig {
        lock_ttl: Duration::from_secs(1),
        flush_debounce: Duration::from_millis(20),
        idle_grace: Duration::from_secs(5),
        sweep_interval: Duration::from_millis(50),
        flush_retry_base: Duration::from_millis(10),
        flush_retry_max: Duration::from_millis(50),
        ..SessionConfig::default()
    }
}

/// No background auto-save, so every version comes from an explicit call.
fn manual_versions() -> SessionConfig {
    SessionConfig { flush_debounce: Duration::from_secs(60), ..quick() }
}

fn rename(name: &str) -> PageMutation {
    PageMutation::Rename { name: name.to_string() }
}

async fn wait_for(
    events: &mut broadcast::Receiver<ServerMessage>,
    predicate: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    timeout(Duration::from_secs(3), async {
        loop {
            let message = events.recv().await.expect("event stream should stay open");
            if predicate(&message) {
                return message;
            }
        }
    })
    .await
    .expect("expected event should arrive")
}

#[tokio::test]
async fn lock_blocks_other_editors_until_it_expires() {
    let workspace = Workspace::new(quick()).await;
    let (alice, bob) = (workspace.member().await, workspace.member().await);
    let page_id = workspace.page_id;

    let joined =
        workspace.registry.join(page_id, bob, Uuid::new_v4()).await.expect("bob should join");
    let mut events = joined.events;

    let lock = workspace.registry.acquire_lock(page_id, alice).await.expect("alice locks");
    assert_eq!(lock.holder_id, alice);

    let denied = workspace.registry.mutate(page_id, bob, rename("Bob was here")).await;
    assert_eq!(denied, Err(SessionError::Denied(DenyReason::LockedBy { holder: alice })));
    let contested = workspace.registry.acquire_lock(page_id, bob).await;
    assert_eq!(contested, Err(SessionError::Denied(DenyReason::LockedBy { holder: alice })));

    let unlocked = wait_for(&mut events, |message| {
        matches!(message, ServerMessage::UnlockPage { reason: UnlockReason::Expired, .. })
    })
    .await;
    assert_eq!(
        unlocked,
        ServerMessage::UnlockPage {
            page_id,
            previous_holder: Some(alice),
            reason: UnlockReason::Expired,
        }
    );

    let lock =
        workspace.registry.acquire_lock(page_id, bob).await.expect("bob locks after expiry");
    assert_eq!(lock.holder_id, bob);
    workspace.registry.mutate(page_id, bob, rename("Bob was here")).await.expect("bob edits");
}

#[tokio::test]
async fn heartbeat_keeps_a_lock_alive_past_its_ttl() {
    let workspace = Workspace::new(quick()).await;
    let (alice, bob) = (workspace.member().await, workspace.member().await);
    let page_id = workspace.page_id;

    workspace.registry.acquire_lock(page_id, alice).await.expect("alice locks");
    for _ in 0..4 {
        sleep(Duration::from_millis(400)).await;
        workspace.registry.heartbeat(page_id, alice).await.expect("heartbeat extends lock");
    }

    let contested = workspace.registry.acquire_lock(page_id, bob).await;
    assert_eq!(contested, Err(SessionError::Denied(DenyReason::LockedBy { holder: alice })));
}

#[tokio::test]
async fn restoring_an_old_version_appends_a_new_one() {
    let workspace = Workspace::new(manual_versions()).await;
    let alice = workspace.member().await;
    let page_id = workspace.page_id;

    for name in ["First", "Second", "Third"] {
        workspace.registry.mutate(page_id, alice, rename(name)).await.expect("rename applies");
        workspace.registry.snapshot(page_id, alice, None).await.expect("snapshot succeeds");
    }

    let restored = workspace.registry.restore(page_id, alice, 2).await.expect("restore succeeds");
    assert_eq!(restored.version.version_number, 4);
    assert_eq!(restored.version.name, "Second");
    assert!(restored.before.is_none(), "live content already matched version 3");

    let state = workspace.registry.state(page_id, alice).await.expect("state");
    assert_eq!(state.page.name, "Second");
    assert_eq!(state.latest_version, Some(4));

    let history =
        workspace.registry.history(page_id, alice, None, None).await.expect("history lists");
    let numbers: Vec<i32> = history.items.iter().map(|version| version.version_number).collect();
    assert_eq!(numbers, vec![4, 3, 2, 1]);
    assert!(history.next_cursor.is_none());
}

#[tokio::test]
async fn last_rename_wins_and_reaches_storage() {
    let workspace = Workspace::new(quick()).await;
    let alice = workspace.member().await;
    let page_id = workspace.page_id;

    workspace.registry.mutate(page_id, alice, rename("X")).await.expect("rename X");
    let ack = workspace.registry.mutate(page_id, alice, rename("Y")).await.expect("rename Y");
    assert_eq!(ack.seq, 2);

    timeout(Duration::from_secs(3), async {
        loop {
            let stored = workspace.store.load_page(page_id).await.expect("page loads");
            if stored.content.name == "Y" {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("debounced flush should persist the final name");

    let version =
        workspace.registry.snapshot(page_id, alice, None).await.expect("snapshot succeeds");
    assert_eq!(version.name, "Y");
}

#[tokio::test]
async fn concurrent_snapshots_number_versions_without_gaps() {
    let workspace = Workspace::new(manual_versions()).await;
    let alice = workspace.member().await;
    let page_id = workspace.page_id;

    let mut tasks = Vec::new();
    for index in 0..10 {
        let registry = workspace.registry.clone();
        tasks.push(tokio::spawn(async move {
            registry.mutate(page_id, alice, rename(&format!("Draft {index}"))).await?;
            registry.snapshot(page_id, alice, Some(format!("draft {index}"))).await
        }));
    }
    for task in tasks {
        task.await.expect("task should not panic").expect("snapshot should succeed");
    }

    let history =
        workspace.registry.history(page_id, alice, None, Some(100)).await.expect("history lists");
    let mut numbers: Vec<i32> =
        history.items.iter().map(|version| version.version_number).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn history_pages_through_every_version() {
    let workspace = Workspace::new(manual_versions()).await;
    let alice = workspace.member().await;
    let page_id = workspace.page_id;

    for index in 0..5 {
        workspace
            .registry
            .mutate(page_id, alice, rename(&format!("Rev {index}")))
            .await
            .expect("rename applies");
        workspace.registry.snapshot(page_id, alice, None).await.expect("snapshot succeeds");
    }

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = workspace
            .registry
            .history(page_id, alice, cursor.as_deref(), Some(2))
            .await
            .expect("history page");
        seen.extend(page.items.iter().map(|version| version.version_number));
        match page.next_cursor {
            Some(next) => cursor = Some(next.encode()),
            None => break,
        }
    }
    assert_eq!(seen, vec![5, 4, 3, 2, 1]);
}

#[tokio::test]
async fn strangers_cannot_join() {
    let workspace = Workspace::new(quick()).await;
    let stranger = Uuid::new_v4();

    let result = workspace.registry.join(workspace.page_id, stranger, Uuid::new_v4()).await;
    assert!(matches!(result, Err(SessionError::Denied(DenyReason::Unauthorized))));
}
