//! Conformance test suite shared by cache backends.

use std::time::Duration;

use crate::error::StateError;
use crate::key::{CacheKey, KeyKind};
use crate::store::CacheStore;

fn test_key(kind: KeyKind, id: &str) -> CacheKey {
    CacheKey::new(kind, id)
}

/// Run the full cache store conformance test suite.
///
/// Call this from your backend's test module with a fresh store instance.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_store_conformance_tests(store: &dyn CacheStore) -> Result<(), StateError> {
    test_get_missing(store).await?;
    test_set_and_get(store).await?;
    test_delete(store).await?;
    test_increment(store).await?;
    test_cas_set_if_absent(store).await?;
    test_cas_matching(store).await?;
    test_cas_conflict(store).await?;
    test_keys_by_prefix(store).await?;
    test_ttl_expiry(store).await?;
    Ok(())
}

async fn test_get_missing(store: &dyn CacheStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Custom("conf".into()), "missing");
    let val = store.get(&key).await?;
    assert!(val.is_none(), "get on missing key should return None");
    Ok(())
}

async fn test_set_and_get(store: &dyn CacheStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Custom("conf".into()), "set-get");
    store.set(&key, "hello", None).await?;
    let val = store.get(&key).await?;
    assert_eq!(val.as_deref(), Some("hello"));
    Ok(())
}

async fn test_delete(store: &dyn CacheStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Custom("conf".into()), "to-delete");
    store.set(&key, "bye", None).await?;
    let existed = store.delete(&key).await?;
    assert!(existed, "delete should return true for existing key");
    let val = store.get(&key).await?;
    assert!(val.is_none(), "get after delete should return None");

    let existed = store.delete(&key).await?;
    assert!(!existed, "delete on missing key should return false");
    Ok(())
}

async fn test_increment(store: &dyn CacheStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::RateCounter, "conf-counter");
    let val = store.increment(&key, 1, None).await?;
    assert_eq!(val, 1, "first increment from zero should yield 1");

    let val = store.increment(&key, 5, None).await?;
    assert_eq!(val, 6, "second increment should accumulate");

    let val = store.increment(&key, -2, None).await?;
    assert_eq!(val, 4, "negative delta should decrement");
    Ok(())
}

async fn test_cas_set_if_absent(store: &dyn CacheStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::FeedbackDedup, "conf-cas-absent");
    let applied = store.compare_and_swap(&key, None, "1", None).await?;
    assert!(applied, "CAS with expected=None should create a missing key");

    let applied = store.compare_and_swap(&key, None, "2", None).await?;
    assert!(!applied, "CAS with expected=None should fail on an existing key");

    let val = store.get(&key).await?;
    assert_eq!(val.as_deref(), Some("1"), "original value should remain");
    Ok(())
}

async fn test_cas_matching(store: &dyn CacheStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::SessionSeq, "conf-cas-match");
    store.set(&key, "5", None).await?;
    let applied = store.compare_and_swap(&key, Some("5"), "6", None).await?;
    assert!(applied, "CAS with matching expected value should succeed");
    let val = store.get(&key).await?;
    assert_eq!(val.as_deref(), Some("6"));
    Ok(())
}

async fn test_cas_conflict(store: &dyn CacheStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::SessionSeq, "conf-cas-conflict");
    store.set(&key, "5", None).await?;
    let applied = store.compare_and_swap(&key, Some("4"), "6", None).await?;
    assert!(!applied, "CAS with stale expected value should fail");
    let val = store.get(&key).await?;
    assert_eq!(val.as_deref(), Some("5"), "value should be unchanged");
    Ok(())
}

async fn test_keys_by_prefix(store: &dyn CacheStore) -> Result<(), StateError> {
    store
        .set(
            &test_key(KeyKind::ActiveSession, "usr-a:dev-1"),
            "ses-1",
            None,
        )
        .await?;
    store
        .set(
            &test_key(KeyKind::ActiveSession, "usr-a:dev-2"),
            "ses-2",
            None,
        )
        .await?;
    store
        .set(
            &test_key(KeyKind::ActiveSession, "usr-b:dev-1"),
            "ses-3",
            None,
        )
        .await?;

    let mut all = store.keys_by_prefix(KeyKind::ActiveSession, "usr-a:").await?;
    all.sort();
    assert_eq!(
        all,
        vec![
            ("usr-a:dev-1".to_owned(), "ses-1".to_owned()),
            ("usr-a:dev-2".to_owned(), "ses-2".to_owned()),
        ]
    );
    Ok(())
}

async fn test_ttl_expiry(store: &dyn CacheStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Custom("conf".into()), "ttl");
    store
        .set(&key, "short-lived", Some(Duration::from_millis(50)))
        .await?;
    assert!(store.get(&key).await?.is_some());

    tokio::time::sleep(Duration::from_millis(120)).await;

    let val = store.get(&key).await?;
    assert!(val.is_none(), "value should be expired after its TTL");
    Ok(())
}
