//! Lifecycle Integration Tests
//!
//! Exercises connection negotiation and the collection cache against a
//! MongoDB instance on localhost. When no server is reachable the tests
//! print a notice and return early.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bedrock_mongo::{
    is_duplicate_error, DbConfig, DbContext, Error, IndexSpec, IndexSpecOptions,
};
use mongodb::bson::doc;
use tracing_subscriber::EnvFilter;

/// Idempotent across the test binary; later calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

fn test_config() -> DbConfig {
    let mut config = DbConfig {
        name: "bedrock_test".to_string(),
        ..Default::default()
    };
    // Fail fast when no local server is listening.
    config.connect_options.server_selection_timeout_ms = 2_000;
    config.connect_options.connect_timeout_ms = 2_000;
    config
}

async fn try_connect() -> Option<DbContext> {
    init_tracing();
    match DbContext::connect(&test_config()).await {
        Ok(context) => Some(context),
        Err(e) => {
            println!("MongoDB not reachable, skipping: {e}");
            None
        }
    }
}

/// A collection name unique to this test run.
fn fresh_name(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    format!("{prefix}_{nanos}")
}

#[tokio::test]
async fn test_open_collections_union_of_overlapping_sets() {
    let Some(context) = try_connect().await else {
        return;
    };

    let a = fresh_name("users");
    let b = fresh_name("tokens");
    let c = fresh_name("jobs");

    context.open_collections(&[&a, &b]).await.unwrap();
    context.open_collections(&[&b, &c]).await.unwrap();

    let names = context.collection_names();
    assert!(names.contains(&a));
    assert!(names.contains(&b));
    assert!(names.contains(&c));
    assert_eq!(names.len(), 3);

    assert!(context.collection(&a).is_some());
    assert!(context.collection("never_opened").is_none());

    context.drop_collections(&[a, b, c]).await.unwrap();
}

#[tokio::test]
async fn test_open_collections_empty_is_noop() {
    let Some(context) = try_connect().await else {
        return;
    };
    context.open_collections(&[]).await.unwrap();
    assert!(context.collection_names().is_empty());
}

#[tokio::test]
async fn test_open_collections_idempotent() {
    let Some(context) = try_connect().await else {
        return;
    };

    let name = fresh_name("sessions");
    context.open_collections(&[&name]).await.unwrap();
    context.open_collections(&[&name]).await.unwrap();
    assert_eq!(context.collection_names(), vec![name.clone()]);

    context.drop_collections(&[name]).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_creation_of_same_collection() {
    let Some(first) = try_connect().await else {
        return;
    };
    let Some(second) = try_connect().await else {
        return;
    };
    let first = Arc::new(first);
    let second = Arc::new(second);

    // Two independent contexts race to create the same collection; the
    // already-exists answer is absorbed on the losing side.
    let name = fresh_name("race");
    let (left, right) = tokio::join!(
        {
            let ctx = first.clone();
            let name = name.clone();
            async move { ctx.open_collections(&[&name]).await }
        },
        {
            let ctx = second.clone();
            let name = name.clone();
            async move { ctx.open_collections(&[&name]).await }
        }
    );
    left.unwrap();
    right.unwrap();
    assert!(first.collection(&name).is_some());
    assert!(second.collection(&name).is_some());

    first.drop_collections(&[name]).await.unwrap();
}

#[tokio::test]
async fn test_create_indexes_absorbs_repeats() {
    let Some(context) = try_connect().await else {
        return;
    };

    let name = fresh_name("indexed");
    context.open_collections(&[&name]).await.unwrap();

    let specs = vec![IndexSpec {
        collection: name.clone(),
        fields: vec![("email".to_string(), 1), ("created".to_string(), -1)],
        options: IndexSpecOptions {
            unique: true,
            ..Default::default()
        },
    }];
    context.create_indexes(&specs).await.unwrap();
    context.create_indexes(&specs).await.unwrap();

    context.drop_collections(&[name]).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_key_predicate_on_live_insert() {
    let Some(context) = try_connect().await else {
        return;
    };

    let name = fresh_name("dupes");
    context.open_collections(&[&name]).await.unwrap();
    let collection = context.collection(&name).unwrap();

    collection
        .insert_one(doc! { "_id": "fixed", "v": 1 })
        .await
        .unwrap();
    let err = collection
        .insert_one(doc! { "_id": "fixed", "v": 2 })
        .await
        .unwrap_err();
    assert!(is_duplicate_error(&err));

    context.drop_collections(&[name]).await.unwrap();
}

#[tokio::test]
async fn test_version_requirement_failure_blocks_connect() {
    init_tracing();
    let config = DbConfig {
        requirements: bedrock_mongo::config::Requirements {
            server_version: ">=99".to_string(),
        },
        ..test_config()
    };

    match DbContext::connect(&config).await {
        Err(Error::Version {
            required, actual, ..
        }) => {
            assert_eq!(required, ">=99");
            assert!(!actual.is_empty());
        }
        Err(e) => println!("MongoDB not reachable, skipping: {e}"),
        Ok(_) => panic!("a >=99 requirement should never be satisfied"),
    }
}
