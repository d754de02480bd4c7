//! End-to-end tests: coordinator, channels and shard nodes together.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::watch;

use cairn_core::{
    protocol::{AdminRequest, DataRequest, DataResponse, UniqueIdRequest},
    Config, Error, LockHolder, NodeId, ObjectKey, Operation, Request, ResourceKey, Response,
    SessionId, TransactionId,
};
use cairn_node::{
    Channel, InProcessChannel, NodeContext, ShardNode, TcpChannel, TcpServer,
    TransactionCoordinator,
};

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = dir.to_path_buf();
    config.locks.acquire_timeout = Duration::from_millis(300);
    config
}

async fn open_node(id: u32, config: Config) -> Arc<ShardNode> {
    ShardNode::open(NodeContext::new(NodeId(id), config)).await.unwrap()
}

async fn cluster(dirs: &[TempDir]) -> (Vec<Arc<ShardNode>>, TransactionCoordinator) {
    cluster_with(dirs, |_| {}).await
}

async fn cluster_with(
    dirs: &[TempDir],
    tweak: impl Fn(&mut Config),
) -> (Vec<Arc<ShardNode>>, TransactionCoordinator) {
    let mut nodes = Vec::new();
    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
    for (i, dir) in dirs.iter().enumerate() {
        let mut config = config(dir.path());
        tweak(&mut config);
        let node = open_node(i as u32, config).await;
        channels.push(Arc::new(InProcessChannel::new(Arc::clone(&node))));
        nodes.push(node);
    }
    (nodes, TransactionCoordinator::new(channels).unwrap())
}

fn temp_dirs(n: usize) -> Vec<TempDir> {
    (0..n).map(|_| TempDir::new().unwrap()).collect()
}

/// First `acct:N` key the router places on `node`.
fn key_on(coordinator: &TransactionCoordinator, node: usize, skip: &[String]) -> String {
    (0..10_000)
        .map(|i| format!("acct:{}", i))
        .find(|k| {
            !skip.contains(k)
                && coordinator.router().route(&ObjectKey::new("accounts", k.as_str())) == node
        })
        .unwrap()
}

fn put(key: &str, value: &str) -> Operation {
    Operation::Put {
        key: ObjectKey::new("accounts", key),
        payload: Bytes::copy_from_slice(value.as_bytes()),
    }
}

fn update_if(key: &str, expected: &str, value: &str) -> Operation {
    Operation::UpdateIf {
        key: ObjectKey::new("accounts", key),
        expected: Bytes::copy_from_slice(expected.as_bytes()),
        payload: Bytes::copy_from_slice(value.as_bytes()),
    }
}

async fn declare(channel: &InProcessChannel, session: SessionId, name: &str) {
    channel
        .call(
            session,
            Request::Admin(AdminRequest::DeclareCollection {
                name: name.to_string(),
            }),
        )
        .await
        .unwrap();
}

async fn balance(coordinator: &TransactionCoordinator, key: &str) -> Option<String> {
    coordinator
        .get("accounts", &[key.to_string()])
        .await
        .unwrap()
        .into_iter()
        .next()
        .map(|(_, v)| String::from_utf8(v.to_vec()).unwrap())
}

// ============================================================================
// Atomicity
// ============================================================================

#[tokio::test]
async fn test_failed_update_if_rolls_back_every_node() {
    let dirs = temp_dirs(2);
    let (nodes, coordinator) = cluster(&dirs).await;
    coordinator.declare_collection("accounts").await.unwrap();

    let a = key_on(&coordinator, 0, &[]);
    let b = key_on(&coordinator, 1, &[]);
    coordinator
        .execute(vec![put(&a, "1"), put(&b, "1")])
        .await
        .unwrap();

    let err = coordinator
        .execute(vec![put(&a, "2"), update_if(&b, "wrong", "3")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransactionAborted { .. }), "got {:?}", err);

    assert_eq!(balance(&coordinator, &a).await.as_deref(), Some("1"));
    assert_eq!(balance(&coordinator, &b).await.as_deref(), Some("1"));
    for node in &nodes {
        assert!(node.locks().is_empty());
        assert!(!node.log().has_processing());
        assert!(node.pending_transactions().is_empty());
    }
    assert!(coordinator.unresolved().is_empty());
}

#[tokio::test]
async fn test_transfer_between_accounts_survives_restart() {
    let dirs = temp_dirs(2);
    let (nodes, coordinator) = cluster(&dirs).await;
    coordinator.declare_collection("accounts").await.unwrap();

    let a = key_on(&coordinator, 0, &[]);
    let b = key_on(&coordinator, 1, &[]);
    coordinator
        .execute(vec![put(&a, "1000"), put(&b, "1000")])
        .await
        .unwrap();
    coordinator
        .execute(vec![update_if(&a, "1000", "900"), update_if(&b, "1000", "1100")])
        .await
        .unwrap();

    for node in &nodes {
        node.stop().await.unwrap();
    }
    drop(coordinator);
    drop(nodes);

    let (_nodes, coordinator) = cluster(&dirs).await;
    assert_eq!(balance(&coordinator, &a).await.as_deref(), Some("900"));
    assert_eq!(balance(&coordinator, &b).await.as_deref(), Some("1100"));
}

#[tokio::test]
async fn test_late_ready_rolls_back_instead_of_committing_partially() {
    let dirs = temp_dirs(2);
    let (nodes, coordinator) = cluster_with(&dirs, |config| {
        config.session.continue_timeout = Duration::from_millis(400);
        config.session.response_timeout = Duration::from_millis(350);
        config.locks.acquire_timeout = Duration::from_millis(300);
    })
    .await;
    let coordinator = coordinator.with_decision_window(Duration::from_millis(100));
    coordinator.declare_collection("accounts").await.unwrap();
    let a = key_on(&coordinator, 0, &[]);
    let b = key_on(&coordinator, 1, &[]);

    // another session pins b, so node 1 answers Ready long after node 0
    let pinning = Arc::new(InProcessChannel::new(Arc::clone(&nodes[1])));
    let session = pinning.begin_session().await.unwrap();
    pinning
        .call(
            session,
            Request::DataAccess(DataRequest::Lock {
                resources: vec![ResourceKey::object("accounts", b.as_str())],
                timeout_ms: 0,
            }),
        )
        .await
        .unwrap();
    let unpin = {
        let pinning = Arc::clone(&pinning);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            pinning
                .call(session, Request::DataAccess(DataRequest::Unlock))
                .await
                .unwrap();
        })
    };

    let err = coordinator
        .execute(vec![put(&a, "1"), put(&b, "1")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransactionAborted { .. }), "got {:?}", err);
    unpin.await.unwrap();
    assert_eq!(balance(&coordinator, &a).await, None);
    assert_eq!(balance(&coordinator, &b).await, None);
    assert!(coordinator.unresolved().is_empty());

    // inside the window both participants commit
    let coordinator = coordinator.with_decision_window(Duration::from_millis(400));
    coordinator
        .execute(vec![put(&a, "2"), put(&b, "2")])
        .await
        .unwrap();
    assert_eq!(balance(&coordinator, &a).await.as_deref(), Some("2"));
    assert_eq!(balance(&coordinator, &b).await.as_deref(), Some("2"));
    for node in &nodes {
        assert!(node.pending_transactions().is_empty());
        assert!(!node.log().has_processing());
    }
    pinning.end_session(session).await.unwrap();
}

#[tokio::test]
async fn test_failed_apply_halts_node_and_keeps_locks() {
    let dir = TempDir::new().unwrap();
    let node = open_node(0, config(dir.path())).await;
    let channel = InProcessChannel::new(Arc::clone(&node));
    let session = channel.begin_session().await.unwrap();
    declare(&channel, session, "accounts").await;

    let id = TransactionId(9);
    node.stage(id, &[put("acct:1", "1000")]).await.unwrap();
    node.storage().inject_apply_faults(1);
    assert!(node.continue_transaction(id, true).is_err());
    assert!(node.is_halted());
    assert_eq!(node.locks().held_by(LockHolder::Transaction(id)).len(), 1);
    assert!(node.log().has_processing());

    // a newer write would be overwritten by the redo, so it is refused
    let write = Request::DataAccess(DataRequest::Put {
        collection: "accounts".to_string(),
        items: vec![("acct:1".to_string(), Bytes::from_static(b"5"))],
    });
    match channel.call(session, write).await.unwrap().as_slice() {
        [Response::Exception(e)] => assert_eq!(e.kind, "STORAGE_ERROR"),
        other => panic!("expected a refusal, got {:?}", other),
    }
    assert_eq!(node.locks().held_by(LockHolder::Transaction(id)).len(), 1);
    channel.end_session(session).await.unwrap();
    node.stop().await.unwrap();
    drop(channel);
    drop(node);

    let node = open_node(0, config(dir.path())).await;
    assert!(!node.is_halted());
    assert!(!node.log().has_processing());
    assert_eq!(
        node.storage().get("accounts:acct:1").unwrap(),
        Some(Bytes::from_static(b"1000"))
    );
    assert!(node.locks().is_empty());
}

#[tokio::test]
async fn test_repeated_decisions_survive_log_checkpoint() {
    let dir = TempDir::new().unwrap();
    let node = open_node(0, config(dir.path())).await;
    let channel = InProcessChannel::new(Arc::clone(&node));
    let session = channel.begin_session().await.unwrap();
    declare(&channel, session, "accounts").await;

    let committed = TransactionId(5);
    node.stage(committed, &[put("acct:1", "1")]).await.unwrap();
    node.continue_transaction(committed, true).unwrap();
    let aborted = TransactionId(6);
    node.stage(aborted, &[put("acct:2", "1")]).await.unwrap();
    node.continue_transaction(aborted, false).unwrap();

    node.run_housekeeping(false).unwrap();
    assert!(node.log().status_of(committed).is_none());
    assert!(node.log().status_of(aborted).is_none());

    // a retried commit is acknowledged, not reported as aborted
    node.continue_transaction(committed, true).unwrap();
    assert!(matches!(
        node.continue_transaction(committed, false),
        Err(Error::InvalidTransition { transaction_id: 5, .. })
    ));
    node.continue_transaction(aborted, false).unwrap();
    assert!(matches!(
        node.continue_transaction(aborted, true),
        Err(Error::TransactionAborted { transaction_id: 6, .. })
    ));
    assert_eq!(
        node.storage().get("accounts:acct:1").unwrap(),
        Some(Bytes::from_static(b"1"))
    );
    assert!(node.storage().get("accounts:acct:2").unwrap().is_none());
    channel.end_session(session).await.unwrap();
}

#[tokio::test]
async fn test_transaction_ids_keep_increasing_after_restart() {
    let dirs = temp_dirs(1);
    let (nodes, coordinator) = cluster(&dirs).await;
    coordinator.declare_collection("accounts").await.unwrap();
    let first = coordinator.execute(vec![put("acct:1", "1")]).await.unwrap();
    nodes[0].stop().await.unwrap();
    drop(coordinator);
    drop(nodes);

    let (_nodes, coordinator) = cluster(&dirs).await;
    let second = coordinator.execute(vec![put("acct:1", "2")]).await.unwrap();
    assert!(second > first);
}

// ============================================================================
// Session handshake
// ============================================================================

#[tokio::test]
async fn test_missing_continue_aborts_staged_transaction() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.session.continue_timeout = Duration::from_millis(200);
    config.session.response_timeout = Duration::from_millis(150);
    config.locks.acquire_timeout = Duration::from_millis(100);
    let node = open_node(0, config).await;
    let channel = InProcessChannel::new(Arc::clone(&node));

    let session = channel.begin_session().await.unwrap();
    channel
        .call(
            session,
            Request::Admin(AdminRequest::DeclareCollection {
                name: "accounts".to_string(),
            }),
        )
        .await
        .unwrap();

    let id = TransactionId(77);
    let responses = channel
        .call(
            session,
            Request::DataAccess(DataRequest::Transaction {
                transaction_id: id,
                operations: vec![put("acct:1", "1000")],
            }),
        )
        .await
        .unwrap();
    assert_eq!(responses, vec![Response::Ready { transaction_id: id }]);
    assert_eq!(node.locks().held_by(LockHolder::Transaction(id)).len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(node.locks().is_empty());
    assert!(node.pending_transactions().is_empty());

    // the late commit must not apply anything
    assert!(channel.continue_session(session, true).await.is_err());
    assert!(node.storage().get("accounts:acct:1").unwrap().is_none());
    channel.end_session(session).await.unwrap();
}

#[tokio::test]
async fn test_session_locks_block_other_sessions() {
    let dir = TempDir::new().unwrap();
    let node = open_node(0, config(dir.path())).await;
    let channel = InProcessChannel::new(Arc::clone(&node));

    let owner = channel.begin_session().await.unwrap();
    let other = channel.begin_session().await.unwrap();
    channel
        .call(
            owner,
            Request::Admin(AdminRequest::DeclareCollection {
                name: "accounts".to_string(),
            }),
        )
        .await
        .unwrap();
    channel
        .call(
            owner,
            Request::DataAccess(DataRequest::Lock {
                resources: vec![ResourceKey::object("accounts", "acct:1")],
                timeout_ms: 0,
            }),
        )
        .await
        .unwrap();

    let write = |balance: &str| {
        Request::DataAccess(DataRequest::Put {
            collection: "accounts".to_string(),
            items: vec![("acct:1".to_string(), Bytes::copy_from_slice(balance.as_bytes()))],
        })
    };

    let blocked = channel.call(other, write("5")).await.unwrap();
    match blocked.as_slice() {
        [Response::Exception(e)] => assert_eq!(e.kind, "LOCK_TIMEOUT"),
        other => panic!("expected a lock timeout, got {:?}", other),
    }

    // the owner writes through its own lock and keeps holding it
    assert_eq!(channel.call(owner, write("7")).await.unwrap(), vec![Response::Null]);
    assert!(node
        .locks()
        .holder_of(&ResourceKey::object("accounts", "acct:1"))
        .is_some());

    channel
        .call(owner, Request::DataAccess(DataRequest::Unlock))
        .await
        .unwrap();
    assert_eq!(channel.call(other, write("9")).await.unwrap(), vec![Response::Null]);
    assert_eq!(
        node.storage().get("accounts:acct:1").unwrap(),
        Some(Bytes::from_static(b"9"))
    );
}

// ============================================================================
// Requests
// ============================================================================

#[tokio::test]
async fn test_get_streams_chunks_then_null() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.session.max_chunk_items = 2;
    let node = open_node(0, config).await;
    let channel = InProcessChannel::new(node);
    let session = channel.begin_session().await.unwrap();

    channel
        .call(
            session,
            Request::Admin(AdminRequest::DeclareCollection {
                name: "orders".to_string(),
            }),
        )
        .await
        .unwrap();
    let items = (0..5)
        .map(|i| (format!("order:{}", i), Bytes::from(vec![i as u8])))
        .collect();
    channel
        .call(
            session,
            Request::DataAccess(DataRequest::Put {
                collection: "orders".to_string(),
                items,
            }),
        )
        .await
        .unwrap();

    let responses = channel
        .call(
            session,
            Request::DataAccess(DataRequest::Get {
                collection: "orders".to_string(),
                keys: Vec::new(),
            }),
        )
        .await
        .unwrap();
    assert_eq!(responses.len(), 4);
    assert_eq!(responses.last(), Some(&Response::Null));
    let total: usize = responses
        .iter()
        .map(|r| match r {
            Response::Data(DataResponse::Objects(objects)) => objects.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(total, 5);
}

#[tokio::test]
async fn test_read_only_mode_and_unknown_collection() {
    let dir = TempDir::new().unwrap();
    let node = open_node(0, config(dir.path())).await;
    let channel = InProcessChannel::new(Arc::clone(&node));
    let session = channel.begin_session().await.unwrap();

    let put = Request::DataAccess(DataRequest::Put {
        collection: "orders".to_string(),
        items: vec![("order:1".to_string(), Bytes::from_static(b"x"))],
    });
    match channel.call(session, put.clone()).await.unwrap().as_slice() {
        [Response::Exception(e)] => {
            assert_eq!(e.kind, "UNKNOWN_COLLECTION");
            assert!(!e.context.is_empty());
        }
        other => panic!("unexpected {:?}", other),
    }

    channel
        .call(
            session,
            Request::Admin(AdminRequest::DeclareCollection {
                name: "orders".to_string(),
            }),
        )
        .await
        .unwrap();
    channel
        .call(session, Request::Admin(AdminRequest::SwitchMode { read_only: true }))
        .await
        .unwrap();
    match channel.call(session, put.clone()).await.unwrap().as_slice() {
        [Response::Exception(e)] => assert_eq!(e.kind, "READ_ONLY"),
        other => panic!("unexpected {:?}", other),
    }

    channel
        .call(session, Request::Admin(AdminRequest::SwitchMode { read_only: false }))
        .await
        .unwrap();
    assert_eq!(channel.call(session, put).await.unwrap(), vec![Response::Null]);
}

#[tokio::test]
async fn test_unique_ids_and_resync() {
    let dir = TempDir::new().unwrap();
    let node = open_node(0, config(dir.path())).await;
    let channel = InProcessChannel::new(node);
    let session = channel.begin_session().await.unwrap();

    let generate = Request::UniqueId(UniqueIdRequest::Generate {
        name: "orders".to_string(),
        count: 3,
    });
    let first = channel.call(session, generate.clone()).await.unwrap();
    assert_eq!(first[0], Response::Data(DataResponse::Ids(vec![1, 2, 3])));

    channel
        .call(
            session,
            Request::UniqueId(UniqueIdRequest::Resync {
                name: "orders".to_string(),
                floor: 100,
            }),
        )
        .await
        .unwrap();
    let next = channel.call(session, generate).await.unwrap();
    assert_eq!(next[0], Response::Data(DataResponse::Ids(vec![101, 102, 103])));
}

#[tokio::test]
async fn test_id_reservations_are_bounded() {
    let dir = TempDir::new().unwrap();
    let node = open_node(0, config(dir.path())).await;
    let channel = InProcessChannel::new(Arc::clone(&node));
    let session = channel.begin_session().await.unwrap();

    let generate = |count: u32| {
        Request::UniqueId(UniqueIdRequest::Generate {
            name: "orders".to_string(),
            count,
        })
    };
    channel
        .call(
            session,
            Request::UniqueId(UniqueIdRequest::Resync {
                name: "orders".to_string(),
                floor: u64::MAX - 1,
            }),
        )
        .await
        .unwrap();
    let last = channel.call(session, generate(1)).await.unwrap();
    assert_eq!(last[0], Response::Data(DataResponse::Ids(vec![u64::MAX])));

    match channel.call(session, generate(1)).await.unwrap().as_slice() {
        [Response::Exception(e)] => assert_eq!(e.kind, "PROTOCOL_ERROR"),
        other => panic!("expected an exhausted sequence, got {:?}", other),
    }
    assert!(node.generate_ids("invoices", u32::MAX).is_err());
    assert_eq!(node.generate_ids("invoices", 2).unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn test_drop_waits_for_staged_transactions() {
    let dir = TempDir::new().unwrap();
    let node = open_node(0, config(dir.path())).await;
    let channel = InProcessChannel::new(Arc::clone(&node));
    let session = channel.begin_session().await.unwrap();
    declare(&channel, session, "accounts").await;

    let id = TransactionId(11);
    node.stage(id, &[put("acct:1", "1")]).await.unwrap();
    let drop_accounts = Request::Admin(AdminRequest::Drop {
        collection: Some("accounts".to_string()),
    });
    match channel.call(session, drop_accounts.clone()).await.unwrap().as_slice() {
        [Response::Exception(e)] => assert_eq!(e.kind, "PROTOCOL_ERROR"),
        other => panic!("expected the drop to be refused, got {:?}", other),
    }
    assert_eq!(node.collections(), vec!["accounts".to_string()]);

    node.continue_transaction(id, true).unwrap();
    assert_eq!(
        channel.call(session, drop_accounts).await.unwrap(),
        vec![Response::Null]
    );
    assert!(node.storage().get("accounts:acct:1").unwrap().is_none());
    assert!(node.collections().is_empty());
    assert!(matches!(
        node.stage(TransactionId(12), &[put("acct:1", "2")]).await,
        Err(Error::UnknownCollection { .. })
    ));
    assert!(node.locks().is_empty());
    channel.end_session(session).await.unwrap();
}

#[tokio::test]
async fn test_drop_collection_and_dump() {
    let dirs = temp_dirs(2);
    let (_nodes, coordinator) = cluster(&dirs).await;
    coordinator.declare_collection("accounts").await.unwrap();
    coordinator.declare_collection("orders").await.unwrap();
    coordinator
        .execute(vec![
            put("acct:1", "10"),
            Operation::Put {
                key: ObjectKey::new("orders", "order:1"),
                payload: Bytes::from_static(b"o"),
            },
        ])
        .await
        .unwrap();

    coordinator
        .broadcast(Request::Admin(AdminRequest::Drop {
            collection: Some("accounts".to_string()),
        }))
        .await
        .unwrap();

    let dumped: Vec<ObjectKey> = coordinator
        .broadcast(Request::Admin(AdminRequest::Dump))
        .await
        .unwrap()
        .into_iter()
        .flatten()
        .filter_map(|r| match r {
            Response::Data(DataResponse::Objects(objects)) => Some(objects),
            _ => None,
        })
        .flatten()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(dumped, vec![ObjectKey::new("orders", "order:1")]);

    let err = coordinator.get("accounts", &["acct:1".to_string()]).await.unwrap_err();
    assert!(matches!(err, Error::UnknownCollection { .. }));
}

#[tokio::test]
async fn test_compact_and_analyze_report() {
    let dir = TempDir::new().unwrap();
    let node = open_node(0, config(dir.path())).await;
    let channel: Arc<dyn Channel> = Arc::new(InProcessChannel::new(Arc::clone(&node)));
    let coordinator = TransactionCoordinator::new(vec![channel]).unwrap();
    coordinator.declare_collection("accounts").await.unwrap();
    for i in 0..5 {
        coordinator
            .execute(vec![put("acct:1", &i.to_string())])
            .await
            .unwrap();
    }

    let before = coordinator.analyze().await.unwrap();
    assert_eq!(before[0].live_objects, 1);
    assert!(before[0].dirty_blocks >= 4);

    coordinator
        .broadcast(Request::Admin(AdminRequest::Compact))
        .await
        .unwrap();
    let after = coordinator.analyze().await.unwrap();
    assert_eq!(after[0].live_objects, 1);
    assert_eq!(after[0].dirty_blocks, 0);
    assert_eq!(after[0].invalid_blocks, 0);
    assert_eq!(balance(&coordinator, "acct:1").await.as_deref(), Some("4"));
}

// ============================================================================
// TCP transport
// ============================================================================

#[tokio::test]
async fn test_tcp_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let network = config.network.clone();
    let session = config.session.clone();
    let node = open_node(0, config).await;

    let server = TcpServer::bind(node, "127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = tokio::spawn(server.serve(shutdown_rx));

    let channel: Arc<dyn Channel> = Arc::new(TcpChannel::new(NodeId(0), addr, &network, &session));
    let coordinator = TransactionCoordinator::new(vec![channel]).unwrap();
    coordinator.declare_collection("accounts").await.unwrap();
    coordinator
        .execute(vec![put("acct:1", "1000"), put("acct:2", "5")])
        .await
        .unwrap();

    let objects = coordinator
        .get("accounts", &["acct:1".to_string(), "acct:2".to_string(), "acct:3".to_string()])
        .await
        .unwrap();
    assert_eq!(
        objects,
        vec![
            (ObjectKey::new("accounts", "acct:1"), Bytes::from_static(b"1000")),
            (ObjectKey::new("accounts", "acct:2"), Bytes::from_static(b"5")),
        ]
    );

    shutdown_tx.send(true).unwrap();
    serving.await.unwrap().unwrap();
}
