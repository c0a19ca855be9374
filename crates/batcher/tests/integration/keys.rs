use std::collections::{BTreeMap, HashMap};

use batcher::{Batcher, CacheKey, KeyError};
use batcher_test::Counter;
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
struct Query {
    owner: &'static str,
    repo: &'static str,
    page: u32,
}

#[tokio::test]
async fn test_invalid_key_fails_before_invocation() {
    batcher_test::setup();

    let batcher = Batcher::<(), ()>::unbounded();
    let counter = Counter::new();

    let result = batcher.call("not a sequence", counter.returning(()));
    assert!(matches!(result, Err(KeyError::NotASequence("a string"))));

    let mut map = BTreeMap::new();
    map.insert(vec![1, 2], "sequence keys");
    let result = batcher.call(&[map], counter.returning(()));
    assert!(matches!(result, Err(KeyError::Serialize(_))));

    assert_eq!(counter.calls(), 0);
    assert!(batcher.is_empty());
}

#[tokio::test]
async fn test_structured_keys_ignore_field_order() {
    batcher_test::setup();

    let batcher = Batcher::<u32, ()>::unbounded();
    let counter = Counter::new();

    let query = Query {
        owner: "getsentry",
        repo: "symbolicator",
        page: 1,
    };
    let mut reordered = HashMap::new();
    reordered.insert("page", json!(1));
    reordered.insert("repo", json!("symbolicator"));
    reordered.insert("owner", json!("getsentry"));

    let first = batcher
        .call(&("search", &query), counter.returning(1))
        .unwrap();
    let second = batcher
        .call(&("search", &reordered), counter.returning(2))
        .unwrap();
    let third = batcher
        .call(
            &json!(["search", {"repo": "symbolicator", "page": 1.0, "owner": "getsentry"}]),
            counter.returning(3),
        )
        .unwrap();

    assert!(first.ptr_eq(&second));
    assert!(first.ptr_eq(&third));
    assert_eq!(*third.await.unwrap(), 1);
    assert_eq!(counter.calls(), 1);
    assert_eq!(batcher.len(), 1);
}

#[tokio::test]
async fn test_sequence_order_matters() {
    batcher_test::setup();

    let batcher = Batcher::<u32, ()>::unbounded();
    let counter = Counter::new();

    let first = batcher.call(&["a", "b"], counter.returning(1)).unwrap();
    let second = batcher.call(&["b", "a"], counter.returning(2)).unwrap();
    let nested = batcher.call(&[["a", "b"]], counter.returning(3)).unwrap();

    assert_eq!(*first.await.unwrap(), 1);
    assert_eq!(*second.await.unwrap(), 2);
    assert_eq!(*nested.await.unwrap(), 3);
    assert_eq!(counter.calls(), 3);
}

#[tokio::test]
async fn test_prebuilt_keys_match_serialized_keys() {
    batcher_test::setup();

    let batcher = Batcher::<u32, ()>::unbounded();
    let counter = Counter::new();

    let mut builder = CacheKey::builder();
    builder.push("user").unwrap().push(&42).unwrap();
    let key = builder.build();

    let first = batcher.call_with_key(key.clone(), counter.returning(1));
    let second = batcher.call(&("user", 42), counter.returning(2)).unwrap();

    assert!(first.ptr_eq(&second));
    assert!(batcher.contains(&key));
    assert_eq!(key.identifier(), r#"["user",42]"#);
    assert_eq!(*second.await.unwrap(), 1);
}
