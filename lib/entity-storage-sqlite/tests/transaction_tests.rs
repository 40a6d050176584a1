#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;

use common::{User, setup_users};
use entity_storage::{
    Conditions, Entity, EntityManager, EntitySchema, StatementCache, StorageError, Transaction,
    TransactionMode, TransactionState,
};
use entity_storage_sqlite::SqliteStore;

type Tx = Arc<Transaction<SqliteStore>>;

async fn names(manager: &EntityManager<SqliteStore>, users: &Arc<EntitySchema>) -> Vec<String> {
    let found: Vec<Entity<User>> = manager.find(users, &Conditions::new()).await.unwrap();
    let mut names: Vec<String> = found
        .iter()
        .map(|user| user.model().unwrap().name)
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_rollback_to_savepoint_discards_only_later_work() {
    let (manager, users) = setup_users().await;
    let tx = manager.transactions().create_transaction();
    tx.begin(TransactionMode::Deferred).await.unwrap();

    manager
        .create::<User>(&users, &User::new("Ada", "ada@x.io"))
        .await
        .unwrap();
    let savepoint = tx.savepoint(None).await.unwrap();
    manager
        .create::<User>(&users, &User::new("Grace", "grace@x.io"))
        .await
        .unwrap();
    tx.rollback_to_savepoint(&savepoint).await.unwrap();
    assert!(tx.is_active().await);
    manager
        .create::<User>(&users, &User::new("Hopper", "hopper@x.io"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(names(&manager, &users).await, vec!["Ada", "Hopper"]);
}

#[tokio::test]
async fn test_released_savepoint_is_still_undone_by_outer_rollback() {
    let (manager, users) = setup_users().await;
    let tx = manager.transactions().create_transaction();
    tx.begin(TransactionMode::Immediate).await.unwrap();

    let outer = tx.savepoint(Some("outer")).await.unwrap();
    manager
        .create::<User>(&users, &User::new("Ada", "ada@x.io"))
        .await
        .unwrap();
    let inner = tx.savepoint(Some("inner")).await.unwrap();
    manager
        .create::<User>(&users, &User::new("Grace", "grace@x.io"))
        .await
        .unwrap();

    tx.release_savepoint(&inner).await.unwrap();
    assert_eq!(tx.savepoints().await, vec![outer.clone()]);

    tx.rollback_to_savepoint(&outer).await.unwrap();
    tx.commit().await.unwrap();

    assert!(names(&manager, &users).await.is_empty());
}

#[tokio::test]
async fn test_released_savepoint_is_undone_by_transaction_rollback() {
    let (manager, users) = setup_users().await;
    let tx = manager.transactions().create_transaction();
    tx.begin(TransactionMode::Deferred).await.unwrap();

    let savepoint = tx.savepoint(None).await.unwrap();
    manager
        .create::<User>(&users, &User::new("Ada", "ada@x.io"))
        .await
        .unwrap();
    tx.release_savepoint(&savepoint).await.unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(tx.state().await, TransactionState::RolledBack);
    assert!(names(&manager, &users).await.is_empty());
}

#[tokio::test]
async fn test_helper_rolls_back_and_rethrows() {
    let (manager, users) = setup_users().await;
    let manager_ref = &manager;
    let users_ref = &users;

    let err = manager
        .transactions()
        .transaction(TransactionMode::Deferred, |_tx| async move {
            manager_ref
                .create::<User>(users_ref, &User::new("Ada", "ada@x.io"))
                .await?;
            Err::<(), _>(StorageError::precondition("abort after insert"))
        })
        .await
        .unwrap_err();

    match err {
        StorageError::PreconditionViolated(message) => assert_eq!(message, "abort after insert"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(names(&manager, &users).await.is_empty());
}

#[tokio::test]
async fn test_helper_commits_body_result() {
    let (manager, users) = setup_users().await;
    let manager_ref = &manager;
    let users_ref = &users;

    let id = manager
        .transactions()
        .transaction(TransactionMode::Immediate, |_tx| async move {
            let user: Entity<User> = manager_ref
                .create(users_ref, &User::new("Ada", "ada@x.io"))
                .await?;
            Ok::<_, StorageError>(user.model()?.id)
        })
        .await
        .unwrap();

    assert_eq!(id, Some(1));
    assert_eq!(names(&manager, &users).await, vec!["Ada"]);
}

#[tokio::test]
async fn test_sequential_batch_returns_ordered_results() {
    let (manager, users) = setup_users().await;
    let manager_ref = &manager;
    let users_ref = &users;

    let ids = manager
        .transactions()
        .transaction_sequential(
            TransactionMode::Deferred,
            ["a", "b", "c"].map(|name| {
                move |_tx: Tx| async move {
                    let user: Entity<User> = manager_ref
                        .create(users_ref, &User::new(name, &format!("{name}@x.io")))
                        .await?;
                    Ok::<_, StorageError>(user.model()?.id)
                }
            }),
        )
        .await
        .unwrap();

    assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
}

#[tokio::test]
async fn test_sequential_batch_rolls_back_on_failure() {
    let (manager, users) = setup_users().await;
    let manager_ref = &manager;
    let users_ref = &users;

    let err = manager
        .transactions()
        .transaction_sequential(
            TransactionMode::Deferred,
            [("a", "a@x.io"), ("b", "a@x.io"), ("c", "c@x.io")].map(|(name, email)| {
                move |_tx: Tx| async move {
                    manager_ref
                        .create::<User>(users_ref, &User::new(name, email))
                        .await
                        .map(|_| ())
                }
            }),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::StoreOperationFailed { .. }));
    assert!(names(&manager, &users).await.is_empty());
}

#[tokio::test]
async fn test_parallel_batch_commits_when_all_succeed() {
    let (manager, users) = setup_users().await;
    let manager_ref = &manager;
    let users_ref = &users;

    let results = manager
        .transactions()
        .transaction_parallel(
            TransactionMode::Immediate,
            (0..5).map(|n| {
                move |_tx: Tx| async move {
                    let user = User::new(&format!("u{n}"), &format!("u{n}@x.io"));
                    manager_ref
                        .create::<User>(users_ref, &user)
                        .await
                        .map(|_| n)
                }
            }),
        )
        .await
        .unwrap();

    assert_eq!(results, vec![0, 1, 2, 3, 4]);
    assert_eq!(manager.count(&users, &Conditions::new()).await.unwrap(), 5);
}

#[tokio::test]
async fn test_parallel_batch_rolls_back_if_any_fails() {
    let (manager, users) = setup_users().await;
    let manager_ref = &manager;
    let users_ref = &users;

    let err = manager
        .transactions()
        .transaction_parallel(
            TransactionMode::Immediate,
            ["dup@x.io", "ok@x.io", "dup@x.io"].map(|email| {
                move |_tx: Tx| async move {
                    manager_ref
                        .create::<User>(users_ref, &User::new("p", email))
                        .await
                        .map(|_| ())
                }
            }),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::StoreOperationFailed { .. }));
    assert_eq!(manager.count(&users, &Conditions::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_statement_cache_reuses_handles_on_sqlite() {
    let (manager, _users) = setup_users().await;
    let store = manager.connection();
    let cache = StatementCache::new();

    let first = cache.get_statement(&**store, "SELECT * FROM users").await.unwrap();
    let hits = cache.stats().hit_count;
    let second = cache.get_statement(&**store, "SELECT * FROM users").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.stats().hit_count, hits + 1);

    cache.set_enabled(false);
    let third = cache.get_statement(&**store, "SELECT * FROM users").await.unwrap();
    let fourth = cache.get_statement(&**store, "SELECT * FROM users").await.unwrap();
    assert!(!Arc::ptr_eq(&third, &fourth));
}

#[tokio::test]
async fn test_entity_operations_populate_the_shared_cache() {
    let (manager, users) = setup_users().await;
    manager
        .create::<User>(&users, &User::new("Ada", "ada@x.io"))
        .await
        .unwrap();
    manager
        .create::<User>(&users, &User::new("Grace", "grace@x.io"))
        .await
        .unwrap();

    let stats = manager.cache().stats();
    assert_eq!(stats.miss_count, 1);
    assert_eq!(stats.hit_count, 1);

    assert_eq!(manager.cache().invalidate("users"), 1);
    assert!(manager.cache().is_empty());
}
