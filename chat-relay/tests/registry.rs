use std::{collections::HashSet, sync::Arc};

use chat_relay::{
    connection::{Connection, ConnectionId, Outbound},
    registry::Registry,
};

const SESSIONS: usize = 64;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_joins_and_leaves_keep_membership_consistent() {
    let registry = Arc::new(Registry::new());

    let tasks: Vec<_> = (0..SESSIONS)
        .map(|n| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let (outbound, _rx) = Outbound::channel();
                let connection = Connection::new(ConnectionId::next(), format!("user{n}"), outbound);
                let id = connection.id();

                assert!(registry.add(connection.clone()).await);
                assert!(!registry.add(connection).await);

                for _ in 0..10 {
                    let snapshot = registry.snapshot().await;
                    let unique: HashSet<_> = snapshot.iter().map(Connection::id).collect();
                    assert_eq!(unique.len(), snapshot.len(), "snapshot contains duplicates");
                    assert!(unique.contains(&id), "joined member missing from snapshot");
                    tokio::task::yield_now().await;
                }

                assert!(registry.remove(id).await.is_some());
                assert!(registry.remove(id).await.is_none());
                id
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.expect("session task panicked"));
    }

    assert_eq!(ids.len(), SESSIONS);
    assert!(registry.is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshots_only_shrink_while_members_leave() {
    let registry = Arc::new(Registry::new());
    let mut ids = Vec::new();
    for n in 0..SESSIONS {
        let (outbound, _rx) = Outbound::channel();
        let connection = Connection::new(ConnectionId::next(), format!("user{n}"), outbound);
        ids.push(connection.id());
        registry.add(connection).await;
    }

    let remover = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for id in ids {
                registry.remove(id).await;
                tokio::task::yield_now().await;
            }
        })
    };

    let mut previous = SESSIONS;
    loop {
        let size = registry.snapshot().await.len();
        assert!(size <= previous, "membership grew from {previous} to {size}");
        previous = size;
        if size == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }

    remover.await.expect("remover task");
}
