use futures_util::future::join_all;
use lab_orchestrator::db::{create_pool, run_migrations};
use lab_orchestrator::{AddressPool, AddressState, PoolError};
use std::collections::HashSet;

/// File-backed so that claims really run on separate connections.
async fn shared_pool(dir: &tempfile::TempDir, size: usize) -> AddressPool {
    let db = create_pool(&dir.path().join("lab.db")).await.unwrap();
    run_migrations(&db).await.unwrap();

    let pool = AddressPool::new(db);
    let addresses: Vec<String> = (0..size).map(|i| format!("10.0.1.{}", 10 + i)).collect();
    pool.seed(&addresses).await.unwrap();
    pool
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_an_address() {
    let dir = tempfile::tempdir().unwrap();
    let size = 8;
    let pool = shared_pool(&dir, size).await;

    let claims = (0..=size).map(|_| {
        let pool = pool.clone();
        tokio::spawn(async move { pool.claim().await })
    });
    let results: Vec<_> = join_all(claims)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let won: Vec<String> = results
        .iter()
        .filter_map(|r| r.as_ref().ok().map(|claim| claim.address.clone()))
        .collect();
    let unique: HashSet<&String> = won.iter().collect();
    assert_eq!(won.len(), size);
    assert_eq!(unique.len(), size);

    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(PoolError::Exhausted)))
        .count();
    assert_eq!(exhausted, 1);

    assert!(pool
        .list()
        .await
        .unwrap()
        .iter()
        .all(|allocation| allocation.state == AddressState::Claimed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assign_and_release() {
    let dir = tempfile::tempdir().unwrap();
    let pool = shared_pool(&dir, 4).await;

    let tasks = (0..4).map(|i| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let claim = pool.claim().await?;
            pool.assign(&claim, &format!("m{}", i)).await?;
            Ok::<_, PoolError>(claim.address)
        })
    });
    let addresses: Vec<String> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    for (i, _) in addresses.iter().enumerate() {
        let allocation = pool.lookup(&format!("m{}", i)).await.unwrap();
        assert_eq!(allocation.state, AddressState::Assigned);
    }

    for address in &addresses {
        pool.release(address).await.unwrap();
        pool.release(address).await.unwrap();
    }
    assert!(pool
        .list()
        .await
        .unwrap()
        .iter()
        .all(|allocation| allocation.state == AddressState::Free));
}

#[test]
fn test_reseeding_reports_duplicates() {
    let report = tokio_test::block_on(async {
        let pool = AddressPool::new(lab_orchestrator::test_utils::create_test_db().await);
        pool.seed(&["10.0.2.1".to_string()]).await.unwrap();
        pool.seed(&["10.0.2.1".to_string(), "10.0.2.2".to_string()])
            .await
            .unwrap()
    });

    assert_eq!(report.added, vec!["10.0.2.2"]);
    assert_eq!(report.duplicates, vec!["10.0.2.1"]);
}
